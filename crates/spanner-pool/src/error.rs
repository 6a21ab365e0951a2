//! Pool error types.

use thiserror::Error;

/// Errors returned by the session pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool is closed or closing.
    #[error("Database is closed.")]
    Closed,

    /// No session is available and `fail` is set.
    #[error("No resources available.")]
    Exhausted,

    /// No session became available within the acquire timeout.
    #[error("Timeout occurred while acquiring session.")]
    Timeout,

    /// The session is not currently borrowed from this pool.
    #[error("Unable to release unknown session.")]
    UnknownSession,

    /// Sessions were still borrowed when the pool closed.
    #[error(transparent)]
    Leak(#[from] SessionLeakError),

    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A session RPC failed.
    #[error(transparent)]
    Client(#[from] spanner_client::Error),
}

impl PoolError {
    /// Whether the error is a resource-exhaustion condition the caller may
    /// retry later.
    #[must_use]
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Timeout)
    }
}

/// Sessions still borrowed when the pool was closed.
#[derive(Debug, Clone, Error)]
#[error("{} session leak(s) detected.", .leaks.len())]
pub struct SessionLeakError {
    leaks: Vec<String>,
}

impl SessionLeakError {
    /// Create from one description per leaked session.
    #[must_use]
    pub fn new(leaks: Vec<String>) -> Self {
        Self { leaks }
    }

    /// Description of each leaked session.
    #[must_use]
    pub fn leaks(&self) -> &[String] {
        &self.leaks
    }
}
