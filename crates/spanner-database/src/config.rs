//! Database configuration.
//!
//! Whether sessions come from the pool or from a multiplexed session is
//! decided once, when the [`Database`](crate::Database) is built.

use std::time::Duration;

use spanner_client::{Config, Error, Result};
use spanner_session_pool::PoolConfig;

/// Environment variable enabling multiplexed sessions (`"true"` enables).
pub const MULTIPLEXED_SESSIONS_ENV: &str = "GOOGLE_CLOUD_SPANNER_MULTIPLEXED_SESSIONS";

/// Environment variable enabling multiplexed sessions for partitioned
/// operations. Only honored when [`MULTIPLEXED_SESSIONS_ENV`] is enabled too.
pub const MULTIPLEXED_PARTITIONED_OPS_ENV: &str =
    "GOOGLE_CLOUD_SPANNER_MULTIPLEXED_SESSIONS_PARTITIONED_OPS";

/// Where sessions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum SessionMode {
    /// A bounded pool of exclusive sessions.
    #[default]
    Pool,
    /// One shared multiplexed session.
    Multiplexed,
}

/// Options for the multiplexed session.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MultiplexedSessionOptions {
    /// How often the session's age is checked.
    pub refresh_rate: Duration,

    /// Database role the session is created with. Defaults to the client's.
    pub database_role: Option<String>,
}

impl Default for MultiplexedSessionOptions {
    fn default() -> Self {
        Self {
            refresh_rate: Duration::from_secs(10 * 60),
            database_role: None,
        }
    }
}

impl MultiplexedSessionOptions {
    /// Set the refresh check interval.
    #[must_use]
    pub fn refresh_rate(mut self, rate: Duration) -> Self {
        self.refresh_rate = rate;
        self
    }

    /// Set the database role.
    #[must_use]
    pub fn database_role(mut self, role: impl Into<String>) -> Self {
        self.database_role = Some(role.into());
        self
    }
}

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database path, role, labels and transaction timeout.
    pub client: Config,

    /// Session pool settings. Empty labels and role inherit from `client`.
    pub pool: PoolConfig,

    /// Multiplexed session settings.
    pub multiplexed: MultiplexedSessionOptions,

    /// Session source for regular operations.
    pub mode: SessionMode,

    /// Use the multiplexed session for partitioned operations too.
    pub multiplexed_partitioned_ops: bool,
}

impl DatabaseConfig {
    /// Create a configuration using the session pool.
    #[must_use]
    pub fn new(client: Config) -> Self {
        Self {
            client,
            pool: PoolConfig::default(),
            multiplexed: MultiplexedSessionOptions::default(),
            mode: SessionMode::Pool,
            multiplexed_partitioned_ops: false,
        }
    }

    /// Create a configuration with the session mode taken from the
    /// environment.
    #[must_use]
    pub fn from_env(client: Config) -> Self {
        Self::new(client).with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply the session mode toggles read through `lookup`.
    #[must_use]
    pub fn with_env_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let multiplexed = env_flag(lookup(MULTIPLEXED_SESSIONS_ENV));
        let partitioned = env_flag(lookup(MULTIPLEXED_PARTITIONED_OPS_ENV));

        self.mode = if multiplexed {
            SessionMode::Multiplexed
        } else {
            SessionMode::Pool
        };
        self.multiplexed_partitioned_ops = multiplexed && partitioned;
        self
    }

    /// Set the session pool configuration.
    #[must_use]
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the multiplexed session options.
    #[must_use]
    pub fn multiplexed(mut self, options: MultiplexedSessionOptions) -> Self {
        self.multiplexed = options;
        self
    }

    /// Set the session mode.
    #[must_use]
    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Use the multiplexed session for partitioned operations.
    #[must_use]
    pub fn multiplexed_partitioned_ops(mut self, enabled: bool) -> Self {
        self.multiplexed_partitioned_ops = enabled;
        self
    }

    /// Session source for partitioned operations.
    #[must_use]
    pub fn partitioned_ops_mode(&self) -> SessionMode {
        if self.mode == SessionMode::Multiplexed && self.multiplexed_partitioned_ops {
            SessionMode::Multiplexed
        } else {
            SessionMode::Pool
        }
    }

    /// Pool configuration with labels and role inherited from `client`.
    #[must_use]
    pub fn effective_pool(&self) -> PoolConfig {
        let mut pool = self.pool.clone();
        if pool.labels.is_empty() {
            pool.labels = self.client.labels.clone();
        }
        if pool.database_role.is_none() {
            pool.database_role = self.client.database_role.clone();
        }
        pool
    }

    /// Multiplexed options with the role inherited from `client`.
    #[must_use]
    pub fn effective_multiplexed(&self) -> MultiplexedSessionOptions {
        let mut options = self.multiplexed.clone();
        if options.database_role.is_none() {
            options.database_role = self.client.database_role.clone();
        }
        options
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        if self.multiplexed.refresh_rate.is_zero() {
            return Err(Error::Config(
                "multiplexed session refresh rate must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_flag(value: Option<String>) -> bool {
    value.as_deref() == Some("true")
}
