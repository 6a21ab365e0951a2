//! # spanner-session-pool
//!
//! Bounded pool of Cloud Spanner sessions.
//!
//! Sessions are expensive to create and expire after an hour of inactivity,
//! so the pool keeps a floor of them alive, prepares read-write transactions
//! ahead of time, and hands them out to callers.
//!
//! ## Features
//!
//! - Configurable `min`/`max` sizes with a read-write fraction (`writes`)
//! - Waiting with an optional acquire timeout, or failing fast (`fail`)
//! - Keep-alive pings (`SELECT 1`) for idle sessions
//! - Eviction of idle sessions above `max_idle`
//! - Leak detection on close
//! - Lifecycle events via a broadcast channel
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_session_pool::{PoolConfig, SessionPool};
//! use spanner_client::SessionKind;
//! use std::time::Duration;
//!
//! let config = PoolConfig::new()
//!     .min(5)
//!     .max(20)
//!     .writes(0.2)
//!     .acquire_timeout(Duration::from_secs(30));
//!
//! let pool = SessionPool::new(rpc, "projects/p/instances/i/databases/d", config)?;
//! pool.open().await?;
//!
//! let session = pool.get_session(SessionKind::ReadOnly).await?;
//! // Use session...
//! pool.release(&session)?;
//!
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//!
//! pool.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
mod maintenance;
pub mod pool;

// Configuration
pub use config::{PoolConfig, SESSION_VALIDITY};

// Error types
pub use error::{PoolError, SessionLeakError};

// Pool types
pub use pool::{PoolMetrics, PoolStatus, SessionPool, SessionPoolBuilder};

// Lifecycle events
pub use lifecycle::PoolEvent;
