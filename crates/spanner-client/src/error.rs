//! Client error types.

use std::sync::Arc;

use spanner_protocol::{Code, ServiceError};
use thiserror::Error;

use crate::runner::DeadlineError;

/// Status codes a transaction is retried on.
///
/// The same set applies to every retry path. A `NOT_FOUND` error for an
/// expired session is also retryable, see [`is_retryable`].
pub const RETRYABLE_CODES: [Code; 2] = [Code::Aborted, Code::Unknown];

/// Whether a failed call should be retried by the transaction runner.
#[must_use]
pub fn is_retryable(err: &ServiceError) -> bool {
    RETRYABLE_CODES.contains(&err.code) || err.is_session_not_found()
}

/// Errors produced by sessions, transactions and the transaction runner.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An RPC failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// The transaction runner gave up retrying.
    #[error(transparent)]
    Deadline(#[from] DeadlineError),

    /// The transaction was already committed, rolled back or ended.
    #[error("transaction has already ended")]
    TransactionEnded,

    /// Rollback was requested before the transaction was begun.
    #[error("Transaction ID is unknown, nothing to rollback.")]
    UnknownTransaction,

    /// A write was attempted in a read-only transaction.
    #[error("read-only transactions cannot {0}")]
    ReadOnly(&'static str),

    /// The session has no server-assigned name yet.
    #[error("session has not been created")]
    SessionNotCreated,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// No session could be obtained for the operation.
    #[error("session unavailable: {0}")]
    SessionUnavailable(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// Error raised by user code inside a transaction.
    #[error("{0}")]
    Custom(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary user error.
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Custom(err.into())
    }

    /// The underlying service error, if this is one.
    #[must_use]
    pub fn service(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(err) => Some(err),
            _ => None,
        }
    }

    /// Status code of the failure, if it came from (or stands in for) an RPC.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Service(err) => Some(err.code),
            Self::Deadline(_) => Some(Code::DeadlineExceeded),
            _ => None,
        }
    }

    /// Whether the transaction runner retries this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.service().is_some_and(is_retryable)
    }

    /// Whether the server no longer knows the session.
    #[must_use]
    pub fn is_session_not_found(&self) -> bool {
        self.service()
            .is_some_and(ServiceError::is_session_not_found)
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
