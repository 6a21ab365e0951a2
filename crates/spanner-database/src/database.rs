//! The database handle.

use std::future::Future;
use std::sync::Arc;

use spanner_client::{
    Error, Result, RunTransactionOptions, Session, SessionKind, SessionSource, SpannerRpc,
    Transaction, TransactionRunner,
};
use spanner_protocol::{
    ExecuteSqlRequest, ResultSet, Statement, TimestampBound, TransactionOptions,
    TransactionSelector,
};

use crate::config::DatabaseConfig;
use crate::factory::{Lease, SessionFactory};

struct DatabaseInner {
    config: DatabaseConfig,
    factory: Arc<SessionFactory>,
}

/// A handle to one Cloud Spanner database.
///
/// Cloning is cheap and clones share sessions.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Create a handle and start creating sessions in the background.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(rpc: Arc<dyn SpannerRpc>, config: DatabaseConfig) -> Result<Self> {
        let factory = Arc::new(SessionFactory::new(rpc, &config)?);
        Ok(Self {
            inner: Arc::new(DatabaseInner { config, factory }),
        })
    }

    /// Run a query in a single-use strong read-only transaction.
    ///
    /// A session the server no longer knows is replaced once.
    pub async fn run(&self, statement: impl Into<Statement>) -> Result<ResultSet> {
        self.run_with_bound(statement, TimestampBound::Strong).await
    }

    /// Run a query in a single-use read-only transaction at `bound`.
    pub async fn run_with_bound(
        &self,
        statement: impl Into<Statement>,
        bound: TimestampBound,
    ) -> Result<ResultSet> {
        let statement = statement.into();
        let factory = &self.inner.factory;
        let mut session = factory.get_session(SessionKind::ReadOnly).await?.session;

        let result = match single_use(&session, &statement, bound).await {
            Err(err) if err.is_session_not_found() => {
                session = factory.renew_for(session, SessionKind::ReadOnly).await?;
                single_use(&session, &statement, bound).await
            }
            result => result,
        };

        self.release_quietly(&session);
        result
    }

    /// Run `f` in a read-write transaction, retrying on abort-class errors.
    ///
    /// Retryable errors raised by the transaction's requests are handled
    /// here and never reach `f`; the attempt is abandoned and restarted.
    pub async fn run_transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_transaction_with_options(self.default_options(), f)
            .await
    }

    /// [`run_transaction`](Self::run_transaction) with explicit options.
    pub async fn run_transaction_with_options<T, F, Fut>(
        &self,
        options: RunTransactionOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut runner = self.runner(options).await?;
        let result = runner.run(f).await;
        self.finish(&runner, result)
    }

    /// Run `f` in a read-write transaction, retrying when it returns an
    /// abort-class error.
    pub async fn run_transaction_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_transaction_async_with_options(self.default_options(), f)
            .await
    }

    /// [`run_transaction_async`](Self::run_transaction_async) with explicit
    /// options.
    pub async fn run_transaction_async_with_options<T, F, Fut>(
        &self,
        options: RunTransactionOptions,
        f: F,
    ) -> Result<T>
    where
        F: FnMut(Arc<Transaction>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut runner = self.runner(options).await?;
        let result = runner.run_async(f).await;
        self.finish(&runner, result)
    }

    /// Execute a partitioned DML statement and return the lower bound of
    /// modified rows.
    pub async fn run_partitioned_update(&self, statement: impl Into<Statement>) -> Result<i64> {
        let lease = self.inner.factory.get_session_for_partitioned_ops().await?;
        let result = async {
            let transaction = lease
                .session
                .begin_transaction(TransactionOptions::PartitionedDml)
                .await?;
            transaction.run_update(statement).await
        }
        .await;

        self.release_quietly(&lease.session);
        result
    }

    /// Get a session and a transaction for it. Give the session back with
    /// [`release`](Self::release).
    pub async fn get_session(&self, kind: SessionKind) -> Result<Lease> {
        self.inner.factory.get_session(kind).await
    }

    /// Give a session back.
    pub fn release(&self, session: &Arc<Session>) -> Result<()> {
        self.inner.factory.release(session)
    }

    /// Close the database and delete pooled sessions.
    pub async fn close(&self) -> Result<()> {
        tracing::info!(database = %self.inner.config.client.database, "closing database");
        self.inner.factory.close().await
    }

    /// The session factory.
    #[must_use]
    pub fn session_factory(&self) -> &Arc<SessionFactory> {
        &self.inner.factory
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    fn default_options(&self) -> RunTransactionOptions {
        RunTransactionOptions::default().timeout(self.inner.config.client.transaction_timeout)
    }

    async fn runner(&self, options: RunTransactionOptions) -> Result<TransactionRunner> {
        let lease = self.inner.factory.get_session(SessionKind::ReadWrite).await?;
        let source: Arc<dyn SessionSource> = self.inner.factory.clone();
        Ok(
            TransactionRunner::new(lease.session, Some(lease.transaction), options)
                .with_session_source(source),
        )
    }

    fn finish<T>(&self, runner: &TransactionRunner, result: Result<T>) -> Result<T> {
        tracing::debug!(
            attempts = runner.attempts(),
            state = ?runner.state(),
            "transaction finished"
        );
        self.release_quietly(runner.session());
        result
    }

    fn release_quietly(&self, session: &Arc<Session>) {
        if let Err(err) = self.inner.factory.release(session) {
            tracing::debug!(error = %err, session = ?session.name(), "session not released");
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("database", &self.inner.config.client.database)
            .field("mode", &self.inner.config.mode)
            .finish_non_exhaustive()
    }
}

async fn single_use(
    session: &Session,
    statement: &Statement,
    bound: TimestampBound,
) -> Result<ResultSet> {
    let name = session.require_name()?;
    let request = ExecuteSqlRequest {
        session: name.to_string(),
        transaction: TransactionSelector::SingleUse(TransactionOptions::ReadOnly(bound)),
        statement: statement.clone(),
        seqno: 0,
    };
    let result = session.rpc().execute_sql(request).await;
    session.touch();
    result.map_err(Error::from)
}
