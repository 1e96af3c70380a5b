//! Configuration loading from file and environment variables.

use serde::Deserialize;
use std::path::PathBuf;
use strata_data::{EntityPolicy, ServiceConfig};
use strata_db::PoolConfig;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Connection pool settings.
    #[serde(default)]
    pub database: PoolConfig,

    /// Migration settings.
    #[serde(default)]
    pub migrations: MigrationsConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where migrations live and how startup treats them.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `<id>_<name>.sql` files.
    #[serde(default = "default_migrations_path")]
    pub path: PathBuf,

    /// Apply pending migrations when the data service starts.
    #[serde(default)]
    pub run_on_startup: bool,

    /// Enables destructive-statement warnings during dry runs.
    #[serde(default)]
    pub production: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "strata_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_migrations_path() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            path: default_migrations_path(),
            run_on_startup: false,
            production: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// The data service settings this configuration describes.
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            database: self.database.clone(),
            migrations_path: self.migrations.path.clone(),
            run_migrations_on_startup: self.migrations.run_on_startup,
            production: self.migrations.production,
            entities: EntityPolicy::allow_all(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

fn parse_bool(value: &str) -> bool {
    value == "true" || value == "1"
}

/// Applies `STRATA_*` overrides using `lookup` to read variables.
///
/// # Errors
///
/// Returns `ConfigError::InvalidEnv` if `STRATA_DB_MAX_CONNECTIONS` is not
/// a number.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("STRATA_DB_PATH") {
        config.database.path = path;
    }
    if let Some(max) = lookup("STRATA_DB_MAX_CONNECTIONS") {
        config.database.max_connections = max.parse().map_err(|_| ConfigError::InvalidEnv {
            var: "STRATA_DB_MAX_CONNECTIONS",
            value: max,
        })?;
    }
    if let Some(path) = lookup("STRATA_MIGRATIONS_PATH") {
        config.migrations.path = PathBuf::from(path);
    }
    if let Some(run) = lookup("STRATA_RUN_MIGRATIONS") {
        config.migrations.run_on_startup = parse_bool(&run);
    }
    if let Some(level) = lookup("STRATA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("STRATA_LOG_JSON") {
        config.logging.json = parse_bool(&json);
    }
    Ok(())
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `STRATA_DB_PATH` overrides `database.path`
/// - `STRATA_DB_MAX_CONNECTIONS` overrides `database.max_connections`
/// - `STRATA_MIGRATIONS_PATH` overrides `migrations.path`
/// - `STRATA_RUN_MIGRATIONS` overrides `migrations.run_on_startup`
/// - `STRATA_LOG_LEVEL` overrides `logging.level`
/// - `STRATA_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// or an override is malformed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    Ok(config)
}
