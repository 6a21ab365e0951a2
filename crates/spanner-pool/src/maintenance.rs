//! Background housekeeping: keep-alive pings and idle eviction.
//!
//! The task runs only while the pool holds at least one session and stops
//! when the pool is closed, emptied or dropped.

use std::sync::Arc;

use futures_util::future::join_all;
use spanner_client::Session;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use crate::pool::{Borrowed, Holder, PoolInner, is_valid};

/// Spawn the housekeeping task for `pool`.
pub(crate) fn spawn(pool: &Arc<PoolInner>, token: CancellationToken) -> JoinHandle<()> {
    let weak = Arc::downgrade(pool);
    let keep_alive = pool.config.keep_alive;
    let idles_after = pool.config.idles_after;

    tokio::spawn(async move {
        let start = Instant::now();
        let mut pings = interval_at(start + keep_alive, keep_alive);
        let mut evictions = interval_at(start + idles_after, idles_after);
        pings.set_missed_tick_behavior(MissedTickBehavior::Delay);
        evictions.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                _ = pings.tick() => {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.ping_idle_sessions().await;
                }
                _ = evictions.tick() => {
                    let Some(pool) = weak.upgrade() else { break };
                    pool.evict_idle_sessions();
                }
            }
        }

        tracing::trace!("housekeeping task exited");
    })
}

impl PoolInner {
    /// Ping every session idle for `idles_after`, then top the pool back up
    /// to `min`.
    ///
    /// Sessions are held by the task while pinged, so callers cannot borrow
    /// them. A session that fails its ping is destroyed and reported.
    pub(crate) async fn ping_idle_sessions(self: &Arc<Self>) {
        let idle = {
            let mut inv = self.inventory.lock();
            let idle = inv.idle_sessions(self.config.idles_after);
            for session in &idle {
                inv.remove_available(session.id());
                inv.borrowed.insert(
                    session.id(),
                    Borrowed::new(Arc::clone(session), Holder::Maintenance),
                );
            }
            idle
        };

        if !idle.is_empty() {
            tracing::debug!(count = idle.len(), "pinging idle sessions");
        }
        join_all(idle.into_iter().map(|session| self.ping(session))).await;

        self.fill().await;
    }

    async fn ping(self: &Arc<Self>, session: Arc<Session>) {
        if !is_valid(&session) {
            tracing::debug!(session = ?session.name(), "dropping expired session");
            self.inventory.lock().borrowed.remove(&session.id());
            self.destroy(session).await;
            return;
        }

        self.counters.lock().pings_performed += 1;
        match self.keep_alive(&session).await {
            Ok(()) => self.return_to_available(&session),
            Err(err) => {
                self.counters.lock().pings_failed += 1;
                self.inventory.lock().borrowed.remove(&session.id());
                self.events.error(err);
                self.destroy(session).await;
            }
        }
    }

    /// Delete the oldest idle sessions while more than `max_idle` are idle
    /// and the pool stays above `min`.
    pub(crate) fn evict_idle_sessions(self: &Arc<Self>) {
        let victims = {
            let mut inv = self.inventory.lock();
            let idle = inv.idle_sessions(self.config.idles_after);
            let size = inv.size();
            let min = self.config.effective_min() as usize;
            let max_idle = self.config.max_idle as usize;

            let mut victims = Vec::new();
            let mut idle_count = idle.len();
            for session in idle {
                if idle_count <= max_idle || size - victims.len() <= min {
                    break;
                }
                inv.remove_available(session.id());
                victims.push(session);
                idle_count -= 1;
            }
            victims
        };

        if victims.is_empty() {
            return;
        }

        tracing::debug!(count = victims.len(), "evicting idle sessions");
        for session in victims {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.destroy(session).await });
        }
    }
}
