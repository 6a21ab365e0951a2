//! Sessions: server-side handles every query and transaction runs on.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use spanner_protocol::{
    ExecuteSqlRequest, SessionInfo, SessionTemplate, Statement, TimestampBound,
    TransactionOptions, TransactionSelector,
};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::instrumentation::SessionCreationSpan;
use crate::rpc::SpannerRpc;
use crate::transaction::Transaction;

/// Statement used to keep idle sessions from expiring server-side.
pub const KEEP_ALIVE_SQL: &str = "SELECT 1";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What a pooled session has been prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionKind {
    /// Serves reads; no transaction is prepared.
    #[default]
    ReadOnly,
    /// Holds a begun read-write transaction ready for use.
    ReadWrite,
}

impl SessionKind {
    /// Name used in logs and events.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "readonly",
            Self::ReadWrite => "readwrite",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handle to a server-allocated session.
///
/// The server-assigned name is set exactly once, by [`Session::create`] or
/// when the session is built from a batch creation result. Sessions are
/// shared as `Arc<Session>`; mutable bookkeeping lives behind locks.
pub struct Session {
    id: u64,
    rpc: Arc<dyn SpannerRpc>,
    database: String,
    template: SessionTemplate,
    info: OnceLock<SessionInfo>,
    last_used: Mutex<Instant>,
    kind: Mutex<SessionKind>,
    transaction: Mutex<Option<Arc<Transaction>>>,
}

impl Session {
    /// Create a local handle; call [`create`](Self::create) to allocate it.
    pub fn new(rpc: Arc<dyn SpannerRpc>, database: impl Into<String>, template: SessionTemplate) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            rpc,
            database: database.into(),
            template,
            info: OnceLock::new(),
            last_used: Mutex::new(Instant::now()),
            kind: Mutex::new(SessionKind::ReadOnly),
            transaction: Mutex::new(None),
        }
    }

    fn from_info(
        rpc: Arc<dyn SpannerRpc>,
        database: &str,
        template: &SessionTemplate,
        info: SessionInfo,
    ) -> Self {
        let session = Self::new(rpc, database, template.clone());
        // Fresh OnceLock, cannot already be set.
        let _ = session.info.set(info);
        session
    }

    /// Allocate the session on the server.
    ///
    /// Calling this on a session that already exists is a no-op.
    pub async fn create(&self) -> Result<()> {
        if self.info.get().is_some() {
            return Ok(());
        }

        let span = SessionCreationSpan::start(&self.database, 1, self.template.multiplexed);
        let info = match self.rpc.create_session(&self.database, &self.template).await {
            Ok(info) => info,
            Err(err) => {
                span.fail(&err);
                return Err(err.into());
            }
        };
        span.returned(1);

        tracing::debug!(
            session = %info.name,
            multiplexed = info.multiplexed,
            "session created"
        );

        if self.info.set(info).is_err() {
            tracing::warn!(id = self.id, "session created concurrently, keeping first name");
        }
        self.touch();
        Ok(())
    }

    /// Allocate up to `count` sessions with one `BatchCreateSessions` call.
    ///
    /// The server may return fewer sessions than requested.
    pub async fn batch_create(
        rpc: &Arc<dyn SpannerRpc>,
        database: &str,
        template: &SessionTemplate,
        count: u32,
    ) -> Result<Vec<Arc<Session>>> {
        let span = SessionCreationSpan::start(database, count, template.multiplexed);
        let infos = match rpc.batch_create_sessions(database, template, count).await {
            Ok(infos) => infos,
            Err(err) => {
                span.fail(&err);
                return Err(err.into());
            }
        };
        span.returned(infos.len());

        Ok(infos
            .into_iter()
            .map(|info| Arc::new(Self::from_info(Arc::clone(rpc), database, template, info)))
            .collect())
    }

    /// Delete the session on the server.
    pub async fn delete(&self) -> Result<()> {
        let name = self.require_name()?;
        tracing::debug!(session = %name, "deleting session");
        self.rpc.delete_session(name).await?;
        Ok(())
    }

    /// Fetch the server's view of the session.
    pub async fn get_metadata(&self) -> Result<SessionInfo> {
        let name = self.require_name()?;
        Ok(self.rpc.get_session(name).await?)
    }

    /// Ping the session with `SELECT 1` to prevent it from expiring.
    pub async fn keep_alive(&self) -> Result<()> {
        let name = self.require_name()?;
        tracing::trace!(session = %name, "pinging session");
        self.rpc
            .execute_sql(ExecuteSqlRequest {
                session: name.to_string(),
                transaction: TransactionSelector::SingleUse(TransactionOptions::ReadOnly(
                    TimestampBound::Strong,
                )),
                statement: Statement::new(KEEP_ALIVE_SQL),
                seqno: 0,
            })
            .await?;
        self.touch();
        Ok(())
    }

    /// A read-write transaction bound to this session, not yet begun.
    ///
    /// The transaction begins inline with its first statement or explicitly
    /// via [`Transaction::begin`].
    pub fn transaction(&self) -> Result<Arc<Transaction>> {
        self.transaction_with_options(TransactionOptions::ReadWrite)
    }

    /// A read-only transaction bound to this session.
    pub fn snapshot(&self, bound: TimestampBound) -> Result<Arc<Transaction>> {
        self.transaction_with_options(TransactionOptions::ReadOnly(bound))
    }

    /// A transaction with explicit options bound to this session.
    pub fn transaction_with_options(&self, options: TransactionOptions) -> Result<Arc<Transaction>> {
        let name = self.require_name()?;
        Ok(Arc::new(Transaction::new(
            Arc::clone(&self.rpc),
            name.to_string(),
            options,
        )))
    }

    /// Create and explicitly begin a transaction.
    pub async fn begin_transaction(&self, options: TransactionOptions) -> Result<Arc<Transaction>> {
        let transaction = self.transaction_with_options(options)?;
        transaction.begin().await?;
        Ok(transaction)
    }

    /// Process-local identifier, stable for the lifetime of the handle.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server-assigned name, once created.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.info.get().map(|info| info.name.as_str())
    }

    /// Server-assigned name, or [`Error::SessionNotCreated`].
    pub fn require_name(&self) -> Result<&str> {
        self.name().ok_or(Error::SessionNotCreated)
    }

    /// Creation time reported by the server.
    #[must_use]
    pub fn create_time(&self) -> Option<DateTime<Utc>> {
        self.info.get().and_then(|info| info.create_time)
    }

    /// Whether this is a multiplexed session.
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.info
            .get()
            .map_or(self.template.multiplexed, |info| info.multiplexed)
    }

    /// Database path the session belongs to.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    /// RPC client the session issues calls through.
    #[must_use]
    pub fn rpc(&self) -> &Arc<dyn SpannerRpc> {
        &self.rpc
    }

    /// When the session was last used.
    #[must_use]
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Mark the session as used now.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    /// What the session is currently prepared for.
    #[must_use]
    pub fn kind(&self) -> SessionKind {
        *self.kind.lock()
    }

    /// Change what the session is prepared for.
    pub fn set_kind(&self, kind: SessionKind) {
        *self.kind.lock() = kind;
    }

    /// Store a prepared transaction on the session.
    pub fn set_prepared_transaction(&self, transaction: Arc<Transaction>) {
        *self.transaction.lock() = Some(transaction);
    }

    /// Take the prepared transaction, if any.
    pub fn take_prepared_transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.lock().take()
    }

    /// Whether a prepared transaction is stored on the session.
    #[must_use]
    pub fn has_prepared_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("multiplexed", &self.is_multiplexed())
            .finish()
    }
}
