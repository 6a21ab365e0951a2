//! # spanner-testing
//!
//! Test infrastructure for the Cloud Spanner session runtime.
//!
//! Provides [`MockSpanner`], an in-memory service implementing
//! [`SpannerRpc`](spanner_client::SpannerRpc), plus helpers for building
//! the errors servers return.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_testing::{MockSpanner, Method, aborted};
//!
//! let mock = Arc::new(MockSpanner::new());
//! mock.fail_times(Method::Commit, 3, aborted());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock;

use std::time::Duration;

use spanner_protocol::{Code, ServiceError};

pub use mock::{Method, MockSpanner};

/// Database path used throughout the test suites.
pub const TEST_DATABASE: &str = "projects/test-project/instances/test-instance/databases/test-db";

/// An `ABORTED` error without retry information.
#[must_use]
pub fn aborted() -> ServiceError {
    ServiceError::new(Code::Aborted, "Transaction was aborted.")
}

/// An `ABORTED` error carrying a server-suggested retry delay.
#[must_use]
pub fn aborted_with_delay(delay: Duration) -> ServiceError {
    aborted().with_retry_delay(delay)
}

/// An `UNAVAILABLE` error.
#[must_use]
pub fn unavailable() -> ServiceError {
    ServiceError::new(Code::Unavailable, "Service is currently unavailable.")
}

