//! Pool configuration and validation.

use serde::Deserialize;
use std::time::Duration;
use strata_types::DataError;

/// Runtime tunables for the SQLite connection pool.
///
/// All durations are expressed in milliseconds. Unsigned fields make
/// negative timeouts unrepresentable; they are rejected when the
/// configuration is parsed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Path to the SQLite database file, or `:memory:` for a private
    /// in-memory database shared by every connection of one pool.
    #[serde(default = "default_path")]
    pub path: String,

    /// Maximum number of pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Idle connections older than this are closed. `0` keeps them forever.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Bound on connection establishment and the default acquire timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Busy timeout applied to every statement waiting on a database lock.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,

    /// Acquisitions slower than this are logged as warnings.
    #[serde(default = "default_slow_acquire_threshold_ms")]
    pub slow_acquire_threshold_ms: u64,

    /// Interval of the background connectivity probe. `0` disables it.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_path() -> String {
    "strata.db".to_string()
}

fn default_max_connections() -> u32 {
    8
}

fn default_idle_timeout_ms() -> u64 {
    600_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_statement_timeout_ms() -> u64 {
    5_000
}

fn default_slow_acquire_threshold_ms() -> u64 {
    1_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connections: default_max_connections(),
            idle_timeout_ms: default_idle_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            statement_timeout_ms: default_statement_timeout_ms(),
            slow_acquire_threshold_ms: default_slow_acquire_threshold_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl PoolConfig {
    /// Convenience constructor with defaults for everything but the path.
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Checks the configuration for values the pool cannot work with.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Configuration` if `max_connections` or
    /// `connect_timeout_ms` is zero, or the path is blank.
    pub fn validate(&self) -> Result<(), DataError> {
        if self.path.trim().is_empty() {
            return Err(DataError::Configuration(
                "database path must not be empty".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(DataError::Configuration(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(DataError::Configuration(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn slow_acquire_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_acquire_threshold_ms)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.health_check_interval_ms))
    }
}
