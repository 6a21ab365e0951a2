//! # spanner-database
//!
//! A Cloud Spanner database handle that hands out sessions from either a
//! bounded [`SessionPool`](spanner_session_pool::SessionPool) or a single
//! [`MultiplexedSession`], chosen once at construction.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spanner_client::Config;
//! use spanner_database::{Database, DatabaseConfig};
//!
//! let client = Config::from_database_path("projects/p/instances/i/databases/d")?;
//! let db = Database::new(rpc, DatabaseConfig::from_env(client))?;
//!
//! let rows = db.run("SELECT SingerId FROM Singers").await?;
//!
//! let updated = db
//!     .run_transaction(|txn| async move {
//!         let count = txn.run_update("UPDATE Singers SET Active = TRUE WHERE TRUE").await?;
//!         txn.commit().await?;
//!         Ok(count)
//!     })
//!     .await?;
//!
//! db.close().await?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod database;
pub mod factory;
pub mod multiplexed;

pub use config::{
    DatabaseConfig, MULTIPLEXED_PARTITIONED_OPS_ENV, MULTIPLEXED_SESSIONS_ENV,
    MultiplexedSessionOptions, SessionMode,
};
pub use database::Database;
pub use factory::{Lease, MultiplexedProvider, PoolProvider, SessionFactory, SessionProvider};
pub use multiplexed::{MultiplexedEvent, MultiplexedSession, STALENESS_THRESHOLD};
pub use spanner_client::{Error, Result};
