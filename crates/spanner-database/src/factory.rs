//! Session factory: one entry point over the pool and the multiplexed
//! session.
//!
//! The source of sessions is chosen once, at construction, from
//! [`DatabaseConfig::mode`]. Both backends present the same
//! [`SessionProvider`] interface and hand out a [`Lease`].

use std::sync::Arc;

use async_trait::async_trait;
use spanner_client::{Error, Result, Session, SessionKind, SessionSource, SpannerRpc, Transaction};
use spanner_session_pool::{PoolError, SessionPool};

use crate::config::{DatabaseConfig, SessionMode};
use crate::multiplexed::MultiplexedSession;

/// A session handed out by a [`SessionProvider`], with the transaction to
/// run on it.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The session.
    pub session: Arc<Session>,
    /// A read-write transaction bound to `session`. It may already have
    /// begun if the pool prepared it.
    pub transaction: Arc<Transaction>,
}

impl Lease {
    /// Lease `session`, using its prepared transaction if it has one.
    pub fn new(session: Arc<Session>) -> Result<Self> {
        let transaction = match session.take_prepared_transaction() {
            Some(transaction) => transaction,
            None => session.transaction()?,
        };
        Ok(Self {
            session,
            transaction,
        })
    }
}

/// A source of sessions.
#[async_trait]
pub trait SessionProvider: Send + Sync + std::fmt::Debug {
    /// Get a session suitable for `kind`.
    async fn get_session(&self, kind: SessionKind) -> Result<Lease>;

    /// Get a session suitable for `kind` without leasing a transaction.
    ///
    /// A transaction prepared by the backend stays on the session.
    async fn acquire(&self, kind: SessionKind) -> Result<Arc<Session>>;

    /// Give a session back.
    fn release(&self, session: &Arc<Session>) -> Result<()>;

    /// Drop a session the server no longer knows.
    async fn discard(&self, session: &Arc<Session>) -> Result<()>;

    /// Stop handing out sessions and release server resources.
    async fn close(&self) -> Result<()>;

    /// Which backend this is.
    fn mode(&self) -> SessionMode;
}

/// Convert a pool error into a client error.
pub(crate) fn pool_error(err: PoolError) -> Error {
    match err {
        PoolError::Client(err) => err,
        other => Error::SessionUnavailable(Arc::new(other)),
    }
}

/// Sessions from a [`SessionPool`].
#[derive(Debug, Clone)]
pub struct PoolProvider {
    pool: SessionPool,
}

impl PoolProvider {
    /// Wrap `pool`.
    #[must_use]
    pub fn new(pool: SessionPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionProvider for PoolProvider {
    async fn get_session(&self, kind: SessionKind) -> Result<Lease> {
        let session = self.acquire(kind).await?;
        match Lease::new(Arc::clone(&session)) {
            Ok(lease) => Ok(lease),
            Err(err) => {
                let _ = self.pool.release(&session);
                Err(err)
            }
        }
    }

    async fn acquire(&self, kind: SessionKind) -> Result<Arc<Session>> {
        self.pool.get_session(kind).await.map_err(pool_error)
    }

    fn release(&self, session: &Arc<Session>) -> Result<()> {
        self.pool.release(session).map_err(pool_error)
    }

    async fn discard(&self, session: &Arc<Session>) -> Result<()> {
        self.pool.discard(session).await.map_err(pool_error)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await.map_err(pool_error)
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Pool
    }
}

/// Sessions from a [`MultiplexedSession`]. Release is a no-op.
#[derive(Debug, Clone)]
pub struct MultiplexedProvider {
    session: MultiplexedSession,
}

impl MultiplexedProvider {
    /// Wrap `session`.
    #[must_use]
    pub fn new(session: MultiplexedSession) -> Self {
        Self { session }
    }
}

#[async_trait]
impl SessionProvider for MultiplexedProvider {
    async fn get_session(&self, _kind: SessionKind) -> Result<Lease> {
        let (session, transaction) = self.session.get_session().await?;
        Ok(Lease {
            session,
            transaction,
        })
    }

    async fn acquire(&self, _kind: SessionKind) -> Result<Arc<Session>> {
        self.session.acquire().await
    }

    fn release(&self, _session: &Arc<Session>) -> Result<()> {
        Ok(())
    }

    async fn discard(&self, session: &Arc<Session>) -> Result<()> {
        self.session.renew(session).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        self.session.close();
        Ok(())
    }

    fn mode(&self) -> SessionMode {
        SessionMode::Multiplexed
    }
}

/// Hands out sessions from the configured backend.
///
/// The pool is always built and opened in the background; the multiplexed
/// session is only created when [`SessionMode::Multiplexed`] is selected.
/// Must be constructed inside a Tokio runtime.
#[derive(Debug)]
pub struct SessionFactory {
    pool: PoolProvider,
    multiplexed: MultiplexedProvider,
    mode: SessionMode,
    partitioned_mode: SessionMode,
}

impl SessionFactory {
    /// Build the backends and start creating sessions.
    pub fn new(rpc: Arc<dyn SpannerRpc>, config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let database = config.client.database.to_string();

        let pool = SessionPool::new(Arc::clone(&rpc), database.clone(), config.effective_pool())
            .map_err(pool_error)?;
        pool.open_in_background().map_err(pool_error)?;

        let multiplexed = MultiplexedSession::with_labels(
            rpc,
            database,
            config.effective_multiplexed(),
            config.client.labels.clone(),
        );
        if config.mode == SessionMode::Multiplexed {
            multiplexed.create_session();
        }

        tracing::info!(
            database = %config.client.database,
            mode = ?config.mode,
            partitioned_mode = ?config.partitioned_ops_mode(),
            "session factory created"
        );

        Ok(Self {
            pool: PoolProvider::new(pool),
            multiplexed: MultiplexedProvider::new(multiplexed),
            mode: config.mode,
            partitioned_mode: config.partitioned_ops_mode(),
        })
    }

    fn provider(&self, mode: SessionMode) -> &dyn SessionProvider {
        match mode {
            SessionMode::Pool => &self.pool,
            SessionMode::Multiplexed => &self.multiplexed,
        }
    }

    /// Provider for sessions that served `session`.
    fn owner(&self, session: &Session) -> &dyn SessionProvider {
        if session.is_multiplexed() {
            &self.multiplexed
        } else {
            &self.pool
        }
    }

    /// Get a session from the configured backend.
    pub async fn get_session(&self, kind: SessionKind) -> Result<Lease> {
        self.provider(self.mode).get_session(kind).await
    }

    /// Get a session for partitioned operations.
    ///
    /// Uses the multiplexed session only when it is enabled for both
    /// regular and partitioned operations.
    pub async fn get_session_for_partitioned_ops(&self) -> Result<Lease> {
        self.provider(self.partitioned_mode)
            .get_session(SessionKind::ReadOnly)
            .await
    }

    /// Give a session back to the backend that served it.
    pub fn release(&self, session: &Arc<Session>) -> Result<()> {
        self.owner(session).release(session)
    }

    /// Drop a session the server no longer knows.
    pub async fn discard(&self, session: &Arc<Session>) -> Result<()> {
        self.owner(session).discard(session).await
    }

    /// Drop `stale` and get a replacement for `kind` from the backend that
    /// served it.
    ///
    /// The replacement keeps any transaction the backend prepared, so a
    /// read-write caller can use it without another `BeginTransaction`.
    pub async fn renew_for(&self, stale: Arc<Session>, kind: SessionKind) -> Result<Arc<Session>> {
        let owner = self.owner(&stale);
        if let Err(err) = owner.discard(&stale).await {
            tracing::debug!(error = %err, session = ?stale.name(), "discarding stale session failed");
        }
        owner.acquire(kind).await
    }

    /// Close both backends. Reports the pool's error, if any.
    pub async fn close(&self) -> Result<()> {
        self.multiplexed.close().await?;
        self.pool.close().await
    }

    /// The session pool.
    #[must_use]
    pub fn pool(&self) -> &SessionPool {
        &self.pool.pool
    }

    /// The multiplexed session.
    #[must_use]
    pub fn multiplexed(&self) -> &MultiplexedSession {
        &self.multiplexed.session
    }

    /// Backend for regular operations.
    #[must_use]
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Whether regular operations use the multiplexed session.
    #[must_use]
    pub fn is_multiplexed_enabled(&self) -> bool {
        self.mode == SessionMode::Multiplexed
    }

    /// Whether partitioned operations use the multiplexed session.
    #[must_use]
    pub fn is_multiplexed_enabled_for_partitioned_ops(&self) -> bool {
        self.partitioned_mode == SessionMode::Multiplexed
    }
}

#[async_trait]
impl SessionSource for SessionFactory {
    async fn renew(&self, stale: Arc<Session>) -> Result<Arc<Session>> {
        self.renew_for(stale, SessionKind::ReadWrite).await
    }
}
