//! Pool configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use spanner_protocol::SessionTemplate;

use crate::error::PoolError;

/// Sessions unused for this long are assumed to have expired server-side.
pub const SESSION_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Configuration for the session pool.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Number of sessions kept in the pool as a floor.
    pub min: u32,

    /// Maximum number of sessions the pool may hold or create.
    pub max: u32,

    /// Number of idle sessions kept before eviction starts.
    pub max_idle: u32,

    /// Inactivity after which a session counts as idle.
    pub idles_after: Duration,

    /// How often idle sessions are pinged. Must be less than one hour.
    pub keep_alive: Duration,

    /// Maximum time to wait for a session. `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,

    /// Maximum number of pool-originated RPCs in flight. `None` is unlimited.
    pub concurrency: Option<usize>,

    /// Fail immediately instead of waiting when the pool is exhausted.
    pub fail: bool,

    /// Fraction (0.0 to 1.0) of `min` pre-allocated as read-write sessions.
    pub writes: f64,

    /// Absolute number of read-write sessions to pre-allocate.
    ///
    /// Kept for configurations predating `writes`; raises `min` if larger.
    pub min_writes: u32,

    /// Labels applied to every session the pool creates.
    pub labels: BTreeMap<String, String>,

    /// Database role sessions are created with.
    pub database_role: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 25,
            max: 100,
            max_idle: 1,
            idles_after: Duration::from_secs(10 * 60),
            keep_alive: Duration::from_secs(30 * 60),
            acquire_timeout: None,
            concurrency: None,
            fail: false,
            writes: 0.0,
            min_writes: 0,
            labels: BTreeMap::new(),
            database_role: None,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of sessions.
    #[must_use]
    pub fn min(mut self, min: u32) -> Self {
        self.min = min;
        self
    }

    /// Set the maximum number of sessions.
    #[must_use]
    pub fn max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }

    /// Set the number of idle sessions kept before eviction.
    #[must_use]
    pub fn max_idle(mut self, max_idle: u32) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the inactivity period after which a session is idle.
    #[must_use]
    pub fn idles_after(mut self, idles_after: Duration) -> Self {
        self.idles_after = idles_after;
        self
    }

    /// Set the keep-alive interval.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Limit the number of concurrent pool-originated RPCs.
    #[must_use]
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    /// Fail instead of waiting when no session is available.
    #[must_use]
    pub fn fail(mut self, fail: bool) -> Self {
        self.fail = fail;
        self
    }

    /// Set the fraction of pre-allocated read-write sessions.
    #[must_use]
    pub fn writes(mut self, writes: f64) -> Self {
        self.writes = writes;
        self
    }

    /// Set the absolute number of pre-allocated read-write sessions.
    #[must_use]
    pub fn min_writes(mut self, min_writes: u32) -> Self {
        self.min_writes = min_writes;
        self
    }

    /// Add a session label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set the database role.
    #[must_use]
    pub fn database_role(mut self, role: impl Into<String>) -> Self {
        self.database_role = Some(role.into());
        self
    }

    /// The session floor, raised to `min_writes` when that is larger.
    #[must_use]
    pub fn effective_min(&self) -> u32 {
        self.min.max(self.min_writes)
    }

    /// Number of read-write sessions among the `min` floor.
    #[must_use]
    pub fn min_read_write(&self) -> u32 {
        let min = self.effective_min();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let by_fraction = (f64::from(min) * self.writes).floor() as u32;
        by_fraction.max(self.min_writes).min(min)
    }

    /// Template used for every session the pool creates.
    #[must_use]
    pub fn session_template(&self) -> SessionTemplate {
        SessionTemplate {
            labels: self.labels.clone(),
            multiplexed: false,
            creator_role: self.database_role.clone(),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max == 0 {
            return Err(PoolError::Config(
                "max must be greater than 0".to_string(),
            ));
        }

        if self.effective_min() > self.max {
            return Err(PoolError::Config(format!(
                "min ({}) cannot be greater than max ({})",
                self.effective_min(),
                self.max
            )));
        }

        if !(0.0..=1.0).contains(&self.writes) {
            return Err(PoolError::Config(
                "Write percentage should be represented as a float between 0.0 and 1.0."
                    .to_string(),
            ));
        }

        if self.idles_after.is_zero() {
            return Err(PoolError::Config(
                "idles_after must be greater than 0".to_string(),
            ));
        }

        if self.keep_alive.is_zero() || self.keep_alive >= SESSION_VALIDITY {
            return Err(PoolError::Config(
                "keep_alive must be greater than 0 and less than 1 hour".to_string(),
            ));
        }

        if self.concurrency == Some(0) {
            return Err(PoolError::Config(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
