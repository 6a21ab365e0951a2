//! Pool lifecycle events.
//!
//! Observers subscribe with [`SessionPool::subscribe`](crate::SessionPool::subscribe).
//! Background failures (creation, keep-alive, transaction preparation,
//! deletion) have no caller waiting on them and are reported here instead.

use std::sync::Arc;

use tokio::sync::broadcast;

/// Capacity of the event channel. Slow subscribers observe `Lagged`.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// Something that happened to the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The pool was opened.
    Open,
    /// A session was added or returned to the available set.
    Available,
    /// A background operation failed.
    Error(Arc<spanner_client::Error>),
    /// A session was deleted. Carries the session name.
    Destroy(String),
    /// The pool was closed.
    Close,
}

impl PoolEvent {
    /// Short name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Available => "available",
            Self::Error(_) => "error",
            Self::Destroy(_) => "destroy",
            Self::Close => "close",
        }
    }
}

/// Sending half of the event channel.
#[derive(Debug)]
pub(crate) struct EventSender {
    sender: broadcast::Sender<PoolEvent>,
}

impl EventSender {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. No subscribers is not an error.
    pub(crate) fn emit(&self, event: PoolEvent) {
        tracing::trace!(event = event.name(), "pool event");
        let _ = self.sender.send(event);
    }

    pub(crate) fn error(&self, err: spanner_client::Error) {
        tracing::warn!(error = %err, "background session operation failed");
        self.emit(PoolEvent::Error(Arc::new(err)));
    }
}
