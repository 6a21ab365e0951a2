//! The shared multiplexed session.
//!
//! One server session serves every caller concurrently. It is created once,
//! with at most one `CreateSession` call in flight, and replaced wholesale
//! when it grows older than [`STALENESS_THRESHOLD`]. There is no release
//! step: callers simply drop their `Arc<Session>`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use spanner_client::{Error, Result, Session, SpannerRpc, Transaction};
use spanner_protocol::SessionTemplate;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::config::MultiplexedSessionOptions;

/// Age after which the multiplexed session is recreated.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const EVENT_CAPACITY: usize = 64;

/// Something that happened to the multiplexed session.
#[derive(Debug, Clone)]
pub enum MultiplexedEvent {
    /// A session was created and is ready for use.
    Available,
    /// A background creation failed.
    Error(Arc<Error>),
}

struct MuxInner {
    rpc: Arc<dyn SpannerRpc>,
    database: String,
    template: SessionTemplate,
    options: MultiplexedSessionOptions,
    slot: RwLock<Option<Arc<Session>>>,
    creating: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    events: broadcast::Sender<MultiplexedEvent>,
    maintenance: Mutex<Option<CancellationToken>>,
    closed: CancellationToken,
}

/// A multiplexed session shared by all callers.
///
/// Cloning is cheap and clones share the session.
#[derive(Clone)]
pub struct MultiplexedSession {
    inner: Arc<MuxInner>,
}

impl MultiplexedSession {
    /// Create a handle. No RPC is made until a session is requested or
    /// [`create_session`](Self::create_session) is called.
    #[must_use]
    pub fn new(
        rpc: Arc<dyn SpannerRpc>,
        database: impl Into<String>,
        options: MultiplexedSessionOptions,
    ) -> Self {
        Self::with_labels(rpc, database, options, Default::default())
    }

    /// Create a handle whose session is created with `labels`.
    #[must_use]
    pub fn with_labels(
        rpc: Arc<dyn SpannerRpc>,
        database: impl Into<String>,
        options: MultiplexedSessionOptions,
        labels: std::collections::BTreeMap<String, String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let template = SessionTemplate {
            labels,
            multiplexed: true,
            creator_role: options.database_role.clone(),
        };

        Self {
            inner: Arc::new(MuxInner {
                rpc,
                database: database.into(),
                template,
                options,
                slot: RwLock::new(None),
                creating: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                events,
                maintenance: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Start creating the session in the background.
    ///
    /// Failures are logged. Errors that will resurface on first use
    /// (missing database or instance, missing permission) are not
    /// reported as [`MultiplexedEvent::Error`].
    pub fn create_session(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = inner.create(None).await {
                inner.report(err);
            }
        })
    }

    /// The shared session, creating it if necessary.
    ///
    /// Concurrent callers wait for the same creation. If it fails, only the
    /// caller that issued it gets the error; each queued waiter then takes
    /// the lock in turn and issues its own `CreateSession`. While the
    /// service keeps failing, `K` waiters therefore cost `K` serial calls.
    pub async fn acquire(&self) -> Result<Arc<Session>> {
        if let Some(session) = self.current() {
            return Ok(session);
        }
        self.inner.create(None).await
    }

    /// The shared session and a fresh read-write transaction on it.
    pub async fn get_session(&self) -> Result<(Arc<Session>, Arc<Transaction>)> {
        let session = self.acquire().await?;
        let transaction = session.transaction()?;
        Ok((session, transaction))
    }

    /// Replace `stale`, which the server no longer knows.
    ///
    /// If another caller already replaced it, the replacement is returned
    /// without a new RPC.
    pub async fn renew(&self, stale: &Arc<Session>) -> Result<Arc<Session>> {
        tracing::debug!(session = ?stale.name(), "renewing multiplexed session");
        self.inner.create(Some(stale)).await
    }

    /// Recreate the session if it is older than [`STALENESS_THRESHOLD`].
    ///
    /// Returns whether the session was replaced.
    pub async fn refresh(&self) -> Result<bool> {
        self.inner.refresh().await
    }

    /// The current session, if one has been created.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner.slot.read().clone()
    }

    /// How many times the session has been (re)created.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MultiplexedEvent> {
        self.inner.events.subscribe()
    }

    /// Options in use.
    #[must_use]
    pub fn options(&self) -> &MultiplexedSessionOptions {
        &self.inner.options
    }

    /// Whether the periodic refresh task is running.
    #[must_use]
    pub fn is_maintained(&self) -> bool {
        self.inner.maintenance.lock().is_some()
    }

    /// Stop the refresh task. The session itself expires on the server.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.maintenance.lock().take();
        tracing::debug!(database = %self.inner.database, "multiplexed session closed");
    }
}

impl std::fmt::Debug for MultiplexedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexedSession")
            .field("database", &self.inner.database)
            .field("session", &self.current().as_ref().and_then(|s| s.name().map(str::to_owned)))
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl MuxInner {
    /// Create the session unless another caller already did.
    ///
    /// With `stale` set, a session that is still `stale` is replaced; one
    /// that was already swapped out is returned as is.
    async fn create(self: &Arc<Self>, stale: Option<&Arc<Session>>) -> Result<Arc<Session>> {
        let _guard = self.creating.lock().await;

        let current = self.slot.read().clone();
        if let Some(current) = current {
            let replace = stale.is_some_and(|stale| Arc::ptr_eq(stale, &current));
            if !replace {
                return Ok(current);
            }
        }

        let session = Session::new(
            Arc::clone(&self.rpc),
            self.database.clone(),
            self.template.clone(),
        );
        session.create().await?;
        let session = Arc::new(session);

        *self.slot.write() = Some(Arc::clone(&session));
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            session = ?session.name(),
            generation,
            "multiplexed session created"
        );

        let _ = self.events.send(MultiplexedEvent::Available);
        self.maintain();
        Ok(session)
    }

    async fn refresh(self: &Arc<Self>) -> Result<bool> {
        let Some(current) = self.slot.read().clone() else {
            return Ok(false);
        };

        let metadata = current.get_metadata().await?;
        let Some(created) = metadata.create_time.or_else(|| current.create_time()) else {
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(created);
        if age.to_std().unwrap_or_default() <= STALENESS_THRESHOLD {
            return Ok(false);
        }

        tracing::debug!(
            session = ?current.name(),
            age_hours = age.num_hours(),
            "multiplexed session is stale, recreating"
        );
        self.create(Some(&current)).await?;
        Ok(true)
    }

    fn report(&self, err: Error) {
        let benign = err.service().is_some_and(|e| {
            e.is_database_not_found()
                || e.is_instance_not_found()
                || e.is_create_session_permission_denied()
        });
        if benign {
            tracing::debug!(error = %err, "multiplexed session creation failed");
            return;
        }
        tracing::warn!(error = %err, "multiplexed session creation failed");
        let _ = self.events.send(MultiplexedEvent::Error(Arc::new(err)));
    }

    /// Start the refresh task once.
    fn maintain(self: &Arc<Self>) {
        if self.closed.is_cancelled() {
            return;
        }
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return;
        }

        let token = self.closed.child_token();
        let weak = Arc::downgrade(self);
        let rate = self.options.refresh_rate;
        let cancelled = token.clone();

        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + rate, rate);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancelled.cancelled() => break,
                    _ = ticks.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        if let Err(err) = inner.refresh().await {
                            tracing::warn!(error = %err, "multiplexed session refresh failed");
                        }
                    }
                }
            }

            tracing::trace!("multiplexed session refresh task exited");
        });

        *maintenance = Some(token);
    }
}
