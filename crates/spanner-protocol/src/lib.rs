//! # spanner-protocol
//!
//! Value types exchanged with Cloud Spanner at the RPC boundary.
//!
//! This crate has no knowledge of transports or async runtimes. It defines
//! what the session runtime needs to talk about a call: the gRPC status
//! [`Code`], the [`ServiceError`] every call may fail with (including its
//! trailing [`Metadata`]), the binary `google.rpc.RetryInfo` payload servers
//! attach to `ABORTED` errors, and the request/response shapes of the
//! session, transaction and query RPCs.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use spanner_protocol::{Code, ServiceError};
//!
//! let err = ServiceError::new(Code::Aborted, "Transaction was aborted.")
//!     .with_retry_delay(Duration::from_millis(250));
//!
//! assert_eq!(err.retry_delay(), Some(Duration::from_millis(250)));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod retry_info;
pub mod status;
pub mod types;

pub use error::ProtocolError;
pub use retry_info::RetryInfo;
pub use status::{Code, Metadata, RETRY_INFO_KEY, ServiceError};
pub use types::{
    CommitRequest, CommitResponse, ExecuteSqlRequest, KeySet, Mutation, PartialResultSet,
    ReadRequest, ResultSet, SessionInfo, SessionTemplate, Statement, TimestampBound,
    TransactionInfo, TransactionOptions, TransactionSelector, Value, Write,
};
