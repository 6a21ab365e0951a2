//! Session pool implementation.
//!
//! The pool keeps two ordered sets of idle sessions (read-only and
//! read-write, the latter holding a begun transaction) and a map of borrowed
//! sessions. Creation requests in flight are counted per type so that
//! `pending + available + borrowed <= max` holds at every point.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;
use parking_lot::Mutex;
use spanner_client::instrumentation::SessionMetrics;
use spanner_client::{Error, Session, SessionKind, SpannerRpc};
use spanner_protocol::{SessionTemplate, TransactionOptions};
use tokio::sync::{Notify, Semaphore, broadcast};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, SESSION_VALIDITY};
use crate::error::{PoolError, SessionLeakError};
use crate::lifecycle::{EventSender, PoolEvent};
use crate::maintenance;

/// A bounded pool of Cloud Spanner sessions.
///
/// The pool pre-creates `min` sessions when opened, creates more on demand
/// up to `max`, and makes callers wait (or fail, with `fail` set) when all
/// sessions are borrowed. While it holds any session, a housekeeping task
/// pings idle sessions and evicts idle sessions above `max_idle`.
///
/// # Example
///
/// ```rust,ignore
/// use spanner_session_pool::{PoolConfig, SessionPool};
/// use spanner_client::SessionKind;
///
/// let pool = SessionPool::builder(rpc, "projects/p/instances/i/databases/d")
///     .min(5)
///     .max(20)
///     .build()?;
/// pool.open().await?;
///
/// let session = pool.get_session(SessionKind::ReadWrite).await?;
/// // Use session...
/// pool.release(&session)?;
///
/// pool.close().await?;
/// ```
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    rpc: Arc<dyn SpannerRpc>,
    database: String,
    template: SessionTemplate,
    pub(crate) config: PoolConfig,
    pub(crate) inventory: Mutex<Inventory>,
    /// Woken whenever a session enters the available set or capacity frees up.
    available: Notify,
    opened: AtomicBool,
    pub(crate) closed: CancellationToken,
    /// Limits pool-originated RPCs when `concurrency` is set.
    requests: Option<Semaphore>,
    pub(crate) events: EventSender,
    pub(crate) counters: Mutex<PoolCounters>,
    metrics: SessionMetrics,
    created_at: Instant,
    housekeeping: Mutex<Option<CancellationToken>>,
}

/// Who holds a borrowed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Holder {
    /// A caller, which asked for a session of this type.
    Caller(SessionKind),
    /// The housekeeping task, while pinging.
    Maintenance,
}

pub(crate) struct Borrowed {
    pub(crate) session: Arc<Session>,
    pub(crate) since: Instant,
    pub(crate) holder: Holder,
    /// Released, with a transaction being prepared before it is available.
    pub(crate) releasing: bool,
}

impl Borrowed {
    pub(crate) fn new(session: Arc<Session>, holder: Holder) -> Self {
        Self {
            session,
            since: Instant::now(),
            holder,
            releasing: false,
        }
    }
}

#[derive(Default)]
pub(crate) struct Inventory {
    pub(crate) read_only: VecDeque<Arc<Session>>,
    pub(crate) read_write: VecDeque<Arc<Session>>,
    pub(crate) borrowed: HashMap<u64, Borrowed>,
    pending_read_only: u32,
    pending_read_write: u32,
}

impl Inventory {
    pub(crate) fn available(&self) -> usize {
        self.read_only.len() + self.read_write.len()
    }

    pub(crate) fn size(&self) -> usize {
        self.available() + self.borrowed.len()
    }

    fn pending(&self) -> usize {
        (self.pending_read_only + self.pending_read_write) as usize
    }

    fn reads(&self) -> usize {
        self.read_only.len() + self.borrowed_of(SessionKind::ReadOnly)
    }

    fn writes(&self) -> usize {
        self.read_write.len() + self.borrowed_of(SessionKind::ReadWrite)
    }

    fn borrowed_of(&self, kind: SessionKind) -> usize {
        self.borrowed
            .values()
            .filter(|b| b.session.kind() == kind)
            .count()
    }

    fn pending_mut(&mut self, kind: SessionKind) -> &mut u32 {
        match kind {
            SessionKind::ReadOnly => &mut self.pending_read_only,
            SessionKind::ReadWrite => &mut self.pending_read_write,
        }
    }

    fn has_room(&self, max: u32) -> bool {
        self.size() + self.pending() < max as usize
    }

    fn deque_mut(&mut self, kind: SessionKind) -> &mut VecDeque<Arc<Session>> {
        match kind {
            SessionKind::ReadOnly => &mut self.read_only,
            SessionKind::ReadWrite => &mut self.read_write,
        }
    }

    /// Take a session for a caller. Reads prefer read-only sessions; writes
    /// prefer sessions with a prepared transaction. Either falls back to the
    /// other type.
    fn borrow_next(&mut self, kind: SessionKind) -> Option<Arc<Session>> {
        let session = match kind {
            SessionKind::ReadOnly => self
                .read_only
                .pop_front()
                .or_else(|| self.read_write.pop_front()),
            SessionKind::ReadWrite => self
                .read_write
                .pop_front()
                .or_else(|| self.read_only.pop_front()),
        }?;

        self.borrowed.insert(
            session.id(),
            Borrowed::new(Arc::clone(&session), Holder::Caller(kind)),
        );
        Some(session)
    }

    /// Available sessions idle for at least `idles_after`, oldest first.
    pub(crate) fn idle_sessions(&self, idles_after: Duration) -> Vec<Arc<Session>> {
        let mut idle: Vec<_> = self
            .read_only
            .iter()
            .chain(self.read_write.iter())
            .filter(|s| s.last_used().elapsed() >= idles_after)
            .cloned()
            .collect();
        idle.sort_by_key(|s| s.last_used());
        idle
    }

    /// Remove a session from the available set.
    pub(crate) fn remove_available(&mut self, id: u64) -> Option<Arc<Session>> {
        for deque in [&mut self.read_only, &mut self.read_write] {
            if let Some(index) = deque.iter().position(|s| s.id() == id) {
                return deque.remove(index);
            }
        }
        None
    }
}

/// Internal counters behind [`PoolMetrics`].
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) sessions_created: u64,
    pub(crate) sessions_destroyed: u64,
    pub(crate) acquisitions_successful: u64,
    pub(crate) acquisitions_failed: u64,
    pub(crate) pings_performed: u64,
    pub(crate) pings_failed: u64,
}

enum Wake {
    Closed,
    Created(Result<Result<(), Error>, JoinError>),
    Notified,
    TimedOut,
}

/// Whether a session may still be alive server-side.
pub(crate) fn is_valid(session: &Session) -> bool {
    session.last_used().elapsed() < SESSION_VALIDITY
}

async fn join_creation(
    creation: &mut Option<JoinHandle<Result<(), Error>>>,
) -> Result<Result<(), Error>, JoinError> {
    match creation {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SessionPool {
    /// Create a pool builder.
    #[must_use]
    pub fn builder(rpc: Arc<dyn SpannerRpc>, database: impl Into<String>) -> SessionPoolBuilder {
        SessionPoolBuilder::new(rpc, database)
    }

    /// Create a pool. It serves no sessions until [`open`](Self::open)ed.
    pub fn new(
        rpc: Arc<dyn SpannerRpc>,
        database: impl Into<String>,
        config: PoolConfig,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        let database = database.into();

        let inner = Arc::new(PoolInner {
            rpc,
            template: config.session_template(),
            metrics: SessionMetrics::new(&database),
            database,
            requests: config.concurrency.map(Semaphore::new),
            config,
            inventory: Mutex::new(Inventory::default()),
            available: Notify::new(),
            opened: AtomicBool::new(false),
            closed: CancellationToken::new(),
            events: EventSender::new(),
            counters: Mutex::new(PoolCounters::default()),
            created_at: Instant::now(),
            housekeeping: Mutex::new(None),
        });

        tracing::debug!(
            database = %inner.database,
            min = inner.config.min,
            max = inner.config.max,
            "session pool created"
        );

        Ok(Self { inner })
    }

    /// Open the pool and create the `min` sessions.
    ///
    /// Returns once the initial sessions are created. Creation failures are
    /// reported as [`PoolEvent::Error`], not returned.
    pub async fn open(&self) -> Result<(), PoolError> {
        self.inner.mark_open()?;
        self.inner.fill().await;
        Ok(())
    }

    /// Open the pool and create the `min` sessions in a background task.
    ///
    /// The pool accepts requests as soon as this returns.
    pub fn open_in_background(&self) -> Result<JoinHandle<()>, PoolError> {
        self.inner.mark_open()?;
        let inner = Arc::clone(&self.inner);
        Ok(tokio::spawn(async move { inner.fill().await }))
    }

    /// Borrow a session.
    ///
    /// A read-write request returns a session holding a prepared transaction,
    /// available through [`Session::take_prepared_transaction`].
    pub async fn get_session(&self, kind: SessionKind) -> Result<Arc<Session>, PoolError> {
        let start = Instant::now();
        let result = self.inner.acquire(kind, start).await;

        {
            let mut counters = self.inner.counters.lock();
            match &result {
                Ok(_) => counters.acquisitions_successful += 1,
                Err(_) => counters.acquisitions_failed += 1,
            }
        }
        self.inner
            .metrics
            .record_acquire_wait(start.elapsed().as_secs_f64());

        if let Ok(session) = &result {
            tracing::trace!(session = ?session.name(), kind = %kind, "session acquired");
        }
        result
    }

    /// Return a borrowed session.
    ///
    /// Read-write sessions get a fresh transaction before they become
    /// available again. If that fails the session is destroyed and a
    /// [`PoolEvent::Error`] is emitted.
    pub fn release(&self, session: &Arc<Session>) -> Result<(), PoolError> {
        self.inner.release(session)
    }

    /// Remove a borrowed session from the pool and delete it.
    ///
    /// Used when the server no longer knows the session. The pool is
    /// replenished if it drops below `min`.
    pub async fn discard(&self, session: &Arc<Session>) -> Result<(), PoolError> {
        if self.inner.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        let removed = self
            .inner
            .inventory
            .lock()
            .borrowed
            .remove(&session.id())
            .is_some();
        if !removed {
            return Err(PoolError::UnknownSession);
        }

        tracing::debug!(session = ?session.name(), "discarding session");
        self.inner.available.notify_waiters();
        self.inner.destroy(Arc::clone(session)).await;
        Ok(())
    }

    /// Close the pool and delete every session.
    ///
    /// Waiting callers fail with [`PoolError::Closed`]. Returns
    /// [`PoolError::Leak`] if sessions were still borrowed.
    pub async fn close(&self) -> Result<(), PoolError> {
        self.inner.close().await
    }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let inv = self.inner.inventory.lock();
        PoolStatus {
            available: inv.available() as u32,
            borrowed: inv.borrowed.len() as u32,
            pending: inv.pending() as u32,
            reads: inv.reads() as u32,
            writes: inv.writes() as u32,
            max: self.inner.config.max,
        }
    }

    /// Pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let counters = self.inner.counters.lock();
        PoolMetrics {
            sessions_created: counters.sessions_created,
            sessions_destroyed: counters.sessions_destroyed,
            acquisitions_successful: counters.acquisitions_successful,
            acquisitions_failed: counters.acquisitions_failed,
            pings_performed: counters.pings_performed,
            pings_failed: counters.pings_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Database path the pool creates sessions for.
    #[must_use]
    pub fn database(&self) -> &str {
        &self.inner.database
    }

    /// Whether the pool is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Whether the pool has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Whether the housekeeping task is running.
    #[must_use]
    pub fn is_housekeeping(&self) -> bool {
        self.inner.housekeeping.lock().is_some()
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("database", &self.inner.database)
            .field("status", &self.status())
            .field("open", &self.is_open())
            .finish()
    }
}

impl PoolInner {
    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire) && !self.closed.is_cancelled()
    }

    fn mark_open(&self) -> Result<(), PoolError> {
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        if !self.opened.swap(true, Ordering::AcqRel) {
            tracing::info!(
                database = %self.database,
                min = self.config.effective_min(),
                max = self.config.max,
                "session pool opened"
            );
            self.events.emit(PoolEvent::Open);
        }
        Ok(())
    }

    /// Run a pool-originated RPC under the concurrency limit.
    async fn request<F: Future>(&self, call: F) -> F::Output {
        let _permit = match &self.requests {
            Some(semaphore) => semaphore.acquire().await.ok(),
            None => None,
        };
        call.await
    }

    fn below_min(&self) -> bool {
        let inv = self.inventory.lock();
        inv.size() + inv.pending() < self.config.effective_min() as usize
    }

    fn cancel_pending(&self, kind: SessionKind, count: u32) {
        {
            let mut inv = self.inventory.lock();
            let pending = inv.pending_mut(kind);
            *pending = pending.saturating_sub(count);
        }
        // Capacity freed up; waiters may now create.
        self.available.notify_waiters();
    }

    fn session_available(&self) {
        self.available.notify_waiters();
        self.events.emit(PoolEvent::Available);
        self.record_status();
    }

    fn record_status(&self) {
        let (in_use, idle) = {
            let inv = self.inventory.lock();
            (inv.borrowed.len() as u64, inv.available() as u64)
        };
        self.metrics
            .record_pool_status(in_use, idle, u64::from(self.config.max));
    }

    /// Create sessions until the pool holds its `min` floor, split between
    /// read-only and read-write according to `writes`.
    pub(crate) async fn fill(self: &Arc<Self>) {
        if !self.is_open() {
            return;
        }

        let min = self.config.effective_min() as usize;
        let min_read_write = self.config.min_read_write() as usize;

        let (read_write, read_only) = {
            let mut inv = self.inventory.lock();
            let need_read_write = min_read_write
                .saturating_sub(inv.writes() + inv.pending_read_write as usize);
            let need_read_only = (min - min_read_write)
                .saturating_sub(inv.reads() + inv.pending_read_only as usize);
            let room = (self.config.max as usize).saturating_sub(inv.size() + inv.pending());

            let read_write = need_read_write.min(room) as u32;
            let read_only = need_read_only.min(room - read_write as usize) as u32;
            inv.pending_read_write += read_write;
            inv.pending_read_only += read_only;
            (read_write, read_only)
        };

        if read_write + read_only == 0 {
            return;
        }

        tracing::debug!(read_write, read_only, "filling session pool");
        tokio::join!(
            self.create_sessions(read_write, SessionKind::ReadWrite),
            self.create_sessions(read_only, SessionKind::ReadOnly),
        );
    }

    /// Batch-create `count` sessions of `kind`, already counted as pending.
    ///
    /// The server may return fewer sessions than requested, so this loops.
    async fn create_sessions(self: &Arc<Self>, count: u32, kind: SessionKind) {
        let mut remaining = count;

        while remaining > 0 {
            let result = self
                .request(Session::batch_create(
                    &self.rpc,
                    &self.database,
                    &self.template,
                    remaining,
                ))
                .await;

            let sessions = match result {
                Ok(sessions) if !sessions.is_empty() => sessions,
                Ok(_) => {
                    tracing::warn!(requested = remaining, "batch create returned no sessions");
                    break;
                }
                Err(err) => {
                    self.events.error(err);
                    break;
                }
            };

            let sessions: Vec<_> = sessions.into_iter().take(remaining as usize).collect();
            remaining -= sessions.len() as u32;
            join_all(sessions.into_iter().map(|s| self.add_created(s, kind))).await;
        }

        if remaining > 0 {
            self.cancel_pending(kind, remaining);
        }
    }

    /// Create one session of `kind`, already counted as pending.
    async fn create_one(self: Arc<Self>, kind: SessionKind) -> Result<(), Error> {
        let session = Session::new(
            Arc::clone(&self.rpc),
            self.database.clone(),
            self.template.clone(),
        );

        if let Err(err) = self.request(session.create()).await {
            self.cancel_pending(kind, 1);
            return Err(err);
        }

        self.add_created(Arc::new(session), kind).await;
        Ok(())
    }

    /// Move a newly created session from pending into the available set.
    ///
    /// Read-write sessions get a transaction first; if that fails they are
    /// kept as read-only.
    async fn add_created(self: &Arc<Self>, session: Arc<Session>, pending_kind: SessionKind) {
        if pending_kind == SessionKind::ReadWrite {
            if let Err(err) = self.prepare_transaction(&session).await {
                tracing::debug!(
                    session = ?session.name(),
                    error = %err,
                    "transaction preparation failed, keeping session as read-only"
                );
                session.set_kind(SessionKind::ReadOnly);
            }
        }

        session.touch();
        self.counters.lock().sessions_created += 1;
        self.metrics.record_sessions_created(1);

        let closed = {
            let mut inv = self.inventory.lock();
            let pending = inv.pending_mut(pending_kind);
            *pending = pending.saturating_sub(1);
            if self.closed.is_cancelled() {
                true
            } else {
                inv.deque_mut(session.kind()).push_back(Arc::clone(&session));
                false
            }
        };

        if closed {
            self.delete(&session).await;
            return;
        }

        self.session_available();
        self.update_housekeeping();
    }

    async fn prepare_transaction(&self, session: &Arc<Session>) -> Result<(), Error> {
        let transaction = self
            .request(session.begin_transaction(TransactionOptions::ReadWrite))
            .await?;
        session.set_prepared_transaction(transaction);
        session.set_kind(SessionKind::ReadWrite);
        Ok(())
    }

    async fn acquire(
        self: &Arc<Self>,
        kind: SessionKind,
        start: Instant,
    ) -> Result<Arc<Session>, PoolError> {
        if !self.is_open() {
            return Err(PoolError::Closed);
        }

        let deadline = self.config.acquire_timeout.map(|timeout| start + timeout);

        let session = loop {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(PoolError::Timeout);
            }

            let session = self.next_session(kind, deadline).await?;
            if is_valid(&session) {
                break session;
            }

            tracing::debug!(session = ?session.name(), "discarding expired session");
            self.inventory.lock().borrowed.remove(&session.id());
            let inner = Arc::clone(self);
            tokio::spawn(async move { inner.destroy(session).await });
        };

        if kind == SessionKind::ReadWrite && !session.has_prepared_transaction() {
            if let Err(err) = self.prepare_transaction(&session).await {
                self.return_to_available(&session);
                return Err(PoolError::Client(err));
            }
        }

        self.record_status();
        Ok(session)
    }

    /// Borrow an available session, creating one if there is room, or wait
    /// until one is available, the deadline passes or the pool closes.
    async fn next_session(
        self: &Arc<Self>,
        kind: SessionKind,
        deadline: Option<Instant>,
    ) -> Result<Arc<Session>, PoolError> {
        let mut creation: Option<JoinHandle<Result<(), Error>>> = None;

        loop {
            if self.closed.is_cancelled() {
                return Err(PoolError::Closed);
            }

            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let create = {
                let mut inv = self.inventory.lock();
                if let Some(session) = inv.borrow_next(kind) {
                    return Ok(session);
                }

                if creation.is_some() {
                    false
                } else if inv.has_room(self.config.max) {
                    *inv.pending_mut(kind) += 1;
                    true
                } else if self.config.fail {
                    return Err(PoolError::Exhausted);
                } else {
                    false
                }
            };

            if create {
                // Runs to completion even if this caller stops waiting.
                creation = Some(tokio::spawn(Arc::clone(self).create_one(kind)));
            }

            let wake = tokio::select! {
                biased;
                () = self.closed.cancelled() => Wake::Closed,
                result = join_creation(&mut creation) => Wake::Created(result),
                () = notified => Wake::Notified,
                () = sleep_until_deadline(deadline) => Wake::TimedOut,
            };

            match wake {
                Wake::Closed => return Err(PoolError::Closed),
                Wake::TimedOut => return Err(PoolError::Timeout),
                Wake::Notified => {}
                Wake::Created(result) => {
                    creation = None;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => return Err(PoolError::Client(err)),
                        Err(err) => return Err(PoolError::Client(Error::custom(err))),
                    }
                }
            }
        }
    }

    fn release(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), PoolError> {
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }

        {
            let mut inv = self.inventory.lock();
            let entry = inv
                .borrowed
                .get_mut(&session.id())
                .filter(|b| b.holder != Holder::Maintenance && !b.releasing)
                .ok_or(PoolError::UnknownSession)?;
            entry.releasing = true;
        }

        session.take_prepared_transaction();
        session.touch();
        tracing::trace!(session = ?session.name(), kind = %session.kind(), "releasing session");

        if session.kind() == SessionKind::ReadOnly {
            self.return_to_available(session);
            return Ok(());
        }

        let inner = Arc::clone(self);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            match inner.prepare_transaction(&session).await {
                Ok(()) => inner.return_to_available(&session),
                Err(err) => {
                    let removed = inner
                        .inventory
                        .lock()
                        .borrowed
                        .remove(&session.id())
                        .is_some();
                    if removed {
                        inner.events.error(err);
                        inner.destroy(session).await;
                    }
                }
            }
        });
        Ok(())
    }

    /// Move a borrowed session back into the available set.
    pub(crate) fn return_to_available(&self, session: &Arc<Session>) {
        {
            let mut inv = self.inventory.lock();
            if inv.borrowed.remove(&session.id()).is_none() {
                return;
            }
            inv.deque_mut(session.kind()).push_front(Arc::clone(session));
        }
        self.session_available();
    }

    /// Delete a session already removed from the inventory, then replenish
    /// the pool if it fell below `min`.
    pub(crate) async fn destroy(self: &Arc<Self>, session: Arc<Session>) {
        self.delete(&session).await;
        self.update_housekeeping();

        if self.is_open() && self.below_min() {
            self.fill().await;
        }
    }

    async fn delete(&self, session: &Arc<Session>) {
        let name = session.name().map(str::to_string);
        if let Err(err) = self.request(session.delete()).await {
            self.events.error(err);
        }

        self.counters.lock().sessions_destroyed += 1;
        self.metrics.record_session_destroyed();
        if let Some(name) = name {
            self.events.emit(PoolEvent::Destroy(name));
        }
    }

    /// Start housekeeping when the pool holds its first session and stop it
    /// when the last one is gone.
    pub(crate) fn update_housekeeping(self: &Arc<Self>) {
        let has_sessions = self.inventory.lock().size() > 0;
        let mut housekeeping = self.housekeeping.lock();

        match (has_sessions && self.is_open(), housekeeping.is_some()) {
            (true, false) => {
                let token = self.closed.child_token();
                maintenance::spawn(self, token.clone());
                *housekeeping = Some(token);
                tracing::debug!(database = %self.database, "housekeeping started");
            }
            (false, true) => {
                if let Some(token) = housekeeping.take() {
                    token.cancel();
                }
                tracing::debug!(database = %self.database, "housekeeping stopped");
            }
            _ => {}
        }
    }

    pub(crate) async fn keep_alive(&self, session: &Arc<Session>) -> Result<(), Error> {
        self.request(session.keep_alive()).await
    }

    async fn close(self: &Arc<Self>) -> Result<(), PoolError> {
        if self.closed.is_cancelled() {
            return Err(PoolError::Closed);
        }
        self.closed.cancel();

        let (sessions, leaks) = {
            let mut guard = self.inventory.lock();
            let inv = &mut *guard;
            let mut sessions: Vec<_> = inv
                .read_only
                .drain(..)
                .chain(inv.read_write.drain(..))
                .collect();

            let mut leaks = Vec::new();
            for (_, borrowed) in inv.borrowed.drain() {
                match borrowed.holder {
                    Holder::Caller(kind) if !borrowed.releasing => leaks.push(format!(
                        "session {} borrowed as {kind} {:?} ago was not released",
                        borrowed.session.name().unwrap_or("<unnamed>"),
                        borrowed.since.elapsed(),
                    )),
                    _ => {}
                }
                sessions.push(borrowed.session);
            }
            (sessions, leaks)
        };

        if let Some(token) = self.housekeeping.lock().take() {
            token.cancel();
        }
        self.events.emit(PoolEvent::Close);

        tracing::info!(
            database = %self.database,
            sessions = sessions.len(),
            leaks = leaks.len(),
            "closing session pool"
        );

        join_all(sessions.iter().map(|s| self.delete(s))).await;

        if leaks.is_empty() {
            Ok(())
        } else {
            Err(SessionLeakError::new(leaks).into())
        }
    }
}

/// Builder for creating a session pool.
pub struct SessionPoolBuilder {
    rpc: Arc<dyn SpannerRpc>,
    database: String,
    config: PoolConfig,
}

impl SessionPoolBuilder {
    /// Create a builder with default settings.
    pub fn new(rpc: Arc<dyn SpannerRpc>, database: impl Into<String>) -> Self {
        Self {
            rpc,
            database: database.into(),
            config: PoolConfig::default(),
        }
    }

    /// Set the whole pool configuration.
    #[must_use]
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min(mut self, min: u32) -> Self {
        self.config.min = min;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max(mut self, max: u32) -> Self {
        self.config.max = max;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = Some(timeout);
        self
    }

    /// Fail instead of waiting when exhausted.
    #[must_use]
    pub fn fail(mut self, fail: bool) -> Self {
        self.config.fail = fail;
        self
    }

    /// Set the fraction of pre-allocated read-write sessions.
    #[must_use]
    pub fn writes(mut self, writes: f64) -> Self {
        self.config.writes = writes;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<SessionPool, PoolError> {
        SessionPool::new(self.rpc, self.database, self.config)
    }
}

impl fmt::Debug for SessionPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPoolBuilder")
            .field("database", &self.database)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle sessions ready to be borrowed.
    pub available: u32,
    /// Sessions currently borrowed.
    pub borrowed: u32,
    /// Sessions being created.
    pub pending: u32,
    /// Read-only sessions, available or borrowed.
    pub reads: u32,
    /// Read-write sessions, available or borrowed.
    pub writes: u32,
    /// Maximum allowed sessions.
    pub max: u32,
}

impl PoolStatus {
    /// Sessions held by the pool.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.available + self.borrowed
    }

    /// Percentage of `max` currently borrowed.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (f64::from(self.borrowed) / f64::from(self.max)) * 100.0
    }

    /// Whether no more sessions may be created.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.size() + self.pending >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Sessions created since the pool was built.
    pub sessions_created: u64,
    /// Sessions deleted since the pool was built.
    pub sessions_destroyed: u64,
    /// Successful `get_session` calls.
    pub acquisitions_successful: u64,
    /// Failed `get_session` calls (timeouts, exhaustion, closure).
    pub acquisitions_failed: u64,
    /// Keep-alive pings sent.
    pub pings_performed: u64,
    /// Keep-alive pings that failed.
    pub pings_failed: u64,
    /// Time since the pool was built.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Acquisition success rate (0.0 to 1.0).
    #[must_use]
    pub fn acquisition_success_rate(&self) -> f64 {
        let total = self.acquisitions_successful + self.acquisitions_failed;
        if total == 0 {
            return 1.0;
        }
        self.acquisitions_successful as f64 / total as f64
    }

    /// Keep-alive success rate (0.0 to 1.0).
    #[must_use]
    pub fn ping_success_rate(&self) -> f64 {
        if self.pings_performed == 0 {
            return 1.0;
        }
        let successful = self.pings_performed - self.pings_failed;
        successful as f64 / self.pings_performed as f64
    }
}
