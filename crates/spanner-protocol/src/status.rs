//! gRPC status codes and the error every Spanner RPC may fail with.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::retry_info::RetryInfo;

/// Trailing metadata key under which servers place a binary `RetryInfo`.
pub const RETRY_INFO_KEY: &str = "google.rpc.retryinfo-bin";

/// gRPC status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    /// Not an error.
    Ok = 0,
    /// The operation was cancelled.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// Client specified an invalid argument.
    InvalidArgument = 3,
    /// Deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation.
    FailedPrecondition = 9,
    /// The operation was aborted, typically due to a concurrency issue.
    Aborted = 10,
    /// Operation was attempted past the valid range.
    OutOfRange = 11,
    /// Operation is not implemented.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request lacks valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Create a status code from its numeric value.
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Cancelled),
            2 => Some(Self::Unknown),
            3 => Some(Self::InvalidArgument),
            4 => Some(Self::DeadlineExceeded),
            5 => Some(Self::NotFound),
            6 => Some(Self::AlreadyExists),
            7 => Some(Self::PermissionDenied),
            8 => Some(Self::ResourceExhausted),
            9 => Some(Self::FailedPrecondition),
            10 => Some(Self::Aborted),
            11 => Some(Self::OutOfRange),
            12 => Some(Self::Unimplemented),
            13 => Some(Self::Internal),
            14 => Some(Self::Unavailable),
            15 => Some(Self::DataLoss),
            16 => Some(Self::Unauthenticated),
            _ => None,
        }
    }

    /// Canonical upper-case name of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", *self as i32, self.as_str())
    }
}

/// Trailing metadata attached to a failed call.
///
/// Only binary (`-bin` suffixed) entries are kept, since those are the only
/// ones the session runtime interprets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

impl Metadata {
    /// Create empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a binary value under `key`.
    pub fn insert_bin(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.entries.push((key.into().to_ascii_lowercase(), value.into()));
    }

    /// First binary value stored under `key`.
    #[must_use]
    pub fn get_bin(&self, key: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// Whether no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Error returned by any Spanner RPC.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    /// Status code.
    pub code: Code,
    /// Human readable message from the server.
    pub message: String,
    /// Trailing metadata.
    pub metadata: Metadata,
}

impl ServiceError {
    /// Create an error without metadata.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: Metadata::new(),
        }
    }

    /// The error a server returns for an expired or deleted session.
    pub fn session_not_found(session: &str) -> Self {
        Self::new(Code::NotFound, format!("Session not found: {session}"))
    }

    /// Replace the trailing metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Attach a `RetryInfo` carrying `delay`.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        let info = RetryInfo {
            retry_delay: Some(delay),
        };
        self.metadata.insert_bin(RETRY_INFO_KEY, info.encode());
        self
    }

    /// Server-suggested delay before retrying, if a decodable `RetryInfo`
    /// is present.
    #[must_use]
    pub fn retry_delay(&self) -> Option<Duration> {
        let raw = self.metadata.get_bin(RETRY_INFO_KEY)?;
        RetryInfo::decode(raw).ok()?.retry_delay
    }

    /// Whether the server no longer knows the session the call used.
    #[must_use]
    pub fn is_session_not_found(&self) -> bool {
        self.code == Code::NotFound && self.message.contains("Session not found")
    }

    /// Whether the database the call addressed does not exist.
    #[must_use]
    pub fn is_database_not_found(&self) -> bool {
        self.code == Code::NotFound && self.message.contains("Database not found")
    }

    /// Whether the instance the call addressed does not exist.
    #[must_use]
    pub fn is_instance_not_found(&self) -> bool {
        self.code == Code::NotFound && self.message.contains("Instance not found")
    }

    /// Whether the caller may not create sessions on the database.
    #[must_use]
    pub fn is_create_session_permission_denied(&self) -> bool {
        self.code == Code::PermissionDenied && self.message.contains("spanner.sessions.create")
    }
}
