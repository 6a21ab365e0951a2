//! # spanner-client
//!
//! Async Cloud Spanner sessions, transactions and the transaction retry
//! runner.
//!
//! Everything here talks to the service through the [`SpannerRpc`] trait;
//! session pooling and multiplexed session management are built on top in
//! `spanner-session-pool` and `spanner-database`.
//!
//! ## Features
//!
//! - **Sessions**: create, batch create, keep alive and delete
//! - **Transactions**: inline or explicit begin, buffered mutations, strictly
//!   increasing DML sequence numbers
//! - **Retry runner**: retries `ABORTED`/`UNKNOWN` and expired-session errors
//!   with server-provided or exponential backoff, bounded by a deadline
//! - **Instrumentation**: structured `tracing` events, optional OpenTelemetry
//!   spans and metrics behind the `otel` feature
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_client::{RunTransactionOptions, Session, TransactionRunner};
//!
//! let session = Arc::new(Session::new(rpc, database, template));
//! session.create().await?;
//!
//! let mut runner = TransactionRunner::new(session, None, RunTransactionOptions::default());
//! let rows = runner
//!     .run(|txn| async move {
//!         let rows = txn.run_update("UPDATE Accounts SET Balance = 0 WHERE TRUE").await?;
//!         txn.commit().await?;
//!         Ok(rows)
//!     })
//!     .await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod instrumentation;
pub mod rpc;
pub mod runner;
pub mod session;
pub mod transaction;

pub use config::{Config, DatabaseId};
pub use error::{Error, RETRYABLE_CODES, Result, is_retryable};
pub use rpc::{PartialResultStream, RpcResult, SpannerRpc};
pub use runner::{
    DEFAULT_TRANSACTION_TIMEOUT, DeadlineError, RunTransactionOptions, RunnerState,
    SessionSource, TransactionRunner, exponential_backoff,
};
pub use session::{KEEP_ALIVE_SQL, Session, SessionKind};
pub use spanner_protocol::{Code, ServiceError};
pub use transaction::{ResultStream, Transaction};
