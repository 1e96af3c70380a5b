//! Connection pool lifecycle, acquisition, and convenience wrappers.
//!
//! [`DbPool`] wraps an `r2d2` pool of SQLite connections with an explicit
//! lifecycle (`Uninitialized → Ready → ShutDown`), acquisition accounting,
//! a periodic health probe, and bounded shutdown. Blocking SQLite work runs
//! on Tokio's blocking thread pool so every public operation is `async`.

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use strata_types::DataError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::connection::PooledConnection;
use crate::health::{self, ConnectionCounts, HealthStatus, LastCheck};
use crate::stats::{PoolStatistics, PoolStats};
use crate::tx::{run_in_transaction, Transaction};
use crate::value::QueryResult;

type SqlitePool = Pool<SqliteConnectionManager>;

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

enum Lifecycle {
    Uninitialized,
    Ready(Box<ReadyPool>),
    ShutDown,
}

struct ReadyPool {
    pool: SqlitePool,
    config: PoolConfig,
    health_task: Option<JoinHandle<()>>,
    started_at: Instant,
    /// Holds a shared in-memory database open while r2d2 reaps idle
    /// connections. Dropped with the pool.
    _memory_anchor: Option<rusqlite::Connection>,
}

struct Shared {
    state: Mutex<Lifecycle>,
    stats: Arc<PoolStats>,
    last_check: LastCheck,
    next_connection_id: AtomicU64,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, Lifecycle> {
        // The lifecycle slot is only ever replaced wholesale, so a poisoned
        // guard still holds a consistent value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Lifecycle::Ready(ready) = state {
            if let Some(task) = ready.health_task.take() {
                task.abort();
            }
        }
    }
}

/// Routes r2d2's connection errors into `tracing`.
#[derive(Debug)]
struct TracingErrorHandler;

impl r2d2::HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::error!(error = %error, "database connection error");
    }
}

/// A bounded pool of SQLite connections with an explicit lifecycle.
///
/// Cloning is cheap; all clones share the same underlying pool.
#[derive(Clone)]
pub struct DbPool {
    shared: Arc<Shared>,
}

impl Default for DbPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.shared.state() {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Ready(_) => "ready",
            Lifecycle::ShutDown => "shut down",
        };
        f.debug_struct("DbPool").field("state", &state).finish()
    }
}

/// Creates and initializes a pool in one step.
///
/// # Errors
///
/// See [`DbPool::initialize`].
pub async fn create_pool(config: PoolConfig) -> Result<DbPool, DataError> {
    let pool = DbPool::new();
    pool.initialize(config).await?;
    Ok(pool)
}

const MEMORY_PATH: &str = ":memory:";

fn open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX
}

/// Names a private shared-cache database for `:memory:` so every pooled
/// connection sees the same data.
fn shared_memory_uri(path: &str) -> Option<String> {
    (path == MEMORY_PATH)
        .then(|| format!("file:strata-mem-{}?mode=memory&cache=shared", Uuid::new_v4()))
}

fn build_manager(target: &str, config: &PoolConfig) -> SqliteConnectionManager {
    let busy_timeout_ms = config.statement_timeout_ms;

    SqliteConnectionManager::file(target)
        .with_flags(open_flags())
        .with_init(move |conn| {
            // In-memory databases report "memory" which is expected and acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                busy_timeout_ms
            ))
        })
}

fn join_error(err: tokio::task::JoinError) -> DataError {
    DataError::ServiceUnavailable(format!("database task failed: {err}"))
}

impl DbPool {
    /// Creates an uninitialized pool. Call [`initialize`](Self::initialize)
    /// before use.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Lifecycle::Uninitialized),
                stats: Arc::new(PoolStats::default()),
                last_check: LastCheck::default(),
                next_connection_id: AtomicU64::new(1),
            }),
        }
    }

    /// Builds the bounded pool and verifies connectivity.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Configuration` if the pool is already initialized
    /// or shut down, or the configuration is invalid, and
    /// `DataError::ServiceUnavailable` if the connectivity probe does not
    /// succeed within the connect timeout.
    pub async fn initialize(&self, config: PoolConfig) -> Result<(), DataError> {
        config.validate()?;
        self.ensure_uninitialized()?;

        let (target, memory_anchor) = match shared_memory_uri(&config.path) {
            Some(uri) => {
                let anchor = rusqlite::Connection::open_with_flags(&uri, open_flags()).map_err(|e| {
                    DataError::ServiceUnavailable(format!("could not open in-memory database: {e}"))
                })?;
                (uri, Some(anchor))
            }
            None => (config.path.clone(), None),
        };

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(Some(0))
            .idle_timeout(config.idle_timeout())
            .connection_timeout(config.connect_timeout())
            .error_handler(Box::new(TracingErrorHandler))
            .build_unchecked(build_manager(&target, &config));

        let outcome = health::probe(pool.clone(), config.connect_timeout()).await;
        health::record(&self.shared.last_check, &outcome);
        let version = outcome.map_err(|e| {
            DataError::ServiceUnavailable(format!(
                "could not connect to database at {}: {e}",
                config.path
            ))
        })?;

        let mut state = self.shared.state();
        // Another caller may have won the race while we were probing.
        if !matches!(*state, Lifecycle::Uninitialized) {
            return Err(Self::lifecycle_conflict(&state));
        }

        let health_task = config.health_check_interval().map(|interval| {
            health::spawn_health_task(
                pool.clone(),
                interval,
                config.connect_timeout(),
                self.shared.last_check.clone(),
            )
        });

        tracing::info!(
            path = %config.path,
            max_connections = config.max_connections,
            sqlite_version = %version,
            "database pool initialized"
        );

        *state = Lifecycle::Ready(Box::new(ReadyPool {
            pool,
            config,
            health_task,
            started_at: Instant::now(),
            _memory_anchor: memory_anchor,
        }));
        Ok(())
    }

    fn ensure_uninitialized(&self) -> Result<(), DataError> {
        let state = self.shared.state();
        match *state {
            Lifecycle::Uninitialized => Ok(()),
            _ => Err(Self::lifecycle_conflict(&state)),
        }
    }

    fn lifecycle_conflict(state: &Lifecycle) -> DataError {
        match state {
            Lifecycle::ShutDown => {
                DataError::Configuration("database pool has been shut down".to_string())
            }
            _ => DataError::Configuration("database pool is already initialized".to_string()),
        }
    }

    fn ready(&self) -> Result<(SqlitePool, PoolConfig), DataError> {
        match &*self.shared.state() {
            Lifecycle::Ready(ready) => Ok((ready.pool.clone(), ready.config.clone())),
            Lifecycle::Uninitialized => Err(DataError::ServiceUnavailable(
                "database pool is not initialized".to_string(),
            )),
            Lifecycle::ShutDown => Err(DataError::ServiceUnavailable(
                "database pool has been shut down".to_string(),
            )),
        }
    }

    /// Whether the pool is initialized and not shut down.
    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.state(), Lifecycle::Ready(_))
    }

    /// The configuration the pool was initialized with.
    pub fn config(&self) -> Option<PoolConfig> {
        self.ready().ok().map(|(_, config)| config)
    }

    /// Borrows a connection, waiting up to `timeout` (default: the
    /// configured connect timeout). Blocking; use [`acquire`](Self::acquire)
    /// from async code.
    ///
    /// # Errors
    ///
    /// Returns `DataError::ServiceUnavailable` if the pool is not ready and
    /// `DataError::AcquireTimeout` if no connection became available in time.
    pub fn acquire_blocking(&self, timeout: Option<Duration>) -> Result<PooledConnection, DataError> {
        let stats = &self.shared.stats;
        let (pool, config) = self.ready().inspect_err(|_| stats.record_error())?;
        let timeout = timeout.unwrap_or_else(|| config.connect_timeout());

        let started = Instant::now();
        let acquired = {
            let _waiting = stats.enter_wait();
            pool.get_timeout(timeout)
        };
        let elapsed = started.elapsed();

        let conn = match acquired {
            Ok(conn) => conn,
            Err(e) => {
                stats.record_timeout();
                tracing::warn!(
                    waited_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "timed out acquiring database connection"
                );
                return Err(DataError::AcquireTimeout {
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
        };

        // The pool may have been shut down while this caller was queued.
        if !self.is_ready() {
            stats.record_error();
            drop(conn);
            return Err(DataError::ServiceUnavailable(
                "database pool has been shut down".to_string(),
            ));
        }

        let slow = elapsed >= config.slow_acquire_threshold();
        stats.record_acquire(elapsed, slow);
        let id = self.shared.next_connection_id.fetch_add(1, Ordering::Relaxed);
        if slow {
            tracing::warn!(
                connection = id,
                elapsed_ms = elapsed.as_millis() as u64,
                threshold_ms = config.slow_acquire_threshold_ms,
                "slow database connection acquisition"
            );
        } else {
            tracing::trace!(connection = id, "connection acquired");
        }

        Ok(PooledConnection::new(conn, self.shared.stats.clone(), id))
    }

    /// Borrows a connection, waiting up to `timeout` (default: the
    /// configured connect timeout).
    ///
    /// While the pool is saturated the caller is counted as waiting. A
    /// timed-out acquisition leaves nothing checked out.
    ///
    /// # Errors
    ///
    /// See [`acquire_blocking`](Self::acquire_blocking).
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<PooledConnection, DataError> {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || pool.acquire_blocking(timeout))
            .await
            .map_err(join_error)?
    }

    /// Returns a connection to the pool. Releasing twice is a logged no-op.
    pub fn release(&self, conn: &mut PooledConnection) {
        conn.release();
    }

    /// Runs a blocking closure with a borrowed connection on the blocking
    /// thread pool, releasing the connection afterwards in all cases.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or an acquisition error converted into `E`.
    pub async fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&rusqlite::Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DataError> + Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.acquire_blocking(None)?;
            let result = f(conn.connection()?);
            if result.is_err() {
                pool.shared.stats.record_error();
            }
            conn.release();
            result
        })
        .await
        .map_err(|e| E::from(join_error(e)))?
    }

    /// Runs one parameterized statement on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Database` on execution failure, or an
    /// acquisition error.
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<QueryResult, DataError> {
        let sql = sql.into();
        self.with_connection(move |conn| crate::value::run_query(conn, &sql, &params))
            .await
    }

    /// Runs a parameterless batch of statements on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Database` on execution failure, or an
    /// acquisition error.
    pub async fn execute_batch(&self, sql: impl Into<String>) -> Result<(), DataError> {
        let sql = sql.into();
        self.with_connection(move |conn| -> Result<(), DataError> {
            Ok(conn.execute_batch(&sql)?)
        })
        .await
    }

    /// Runs `f` inside `BEGIN` / `COMMIT` on one pooled connection.
    ///
    /// Any error from `f` rolls the transaction back and is returned
    /// unchanged; a failing rollback is logged and does not replace it. The
    /// connection is released exactly once whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a `DataError` converted into `E` if
    /// the connection cannot be acquired or the transaction cannot begin or
    /// commit.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DataError> + Send + 'static,
    {
        let pool = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.acquire_blocking(None)?;
            let result = run_in_transaction(conn.connection()?, f);
            if result.is_err() {
                pool.shared.stats.record_error();
            }
            conn.release();
            result
        })
        .await
        .map_err(|e| E::from(join_error(e)))?
    }

    /// Live total/idle/waiting gauges. All zero when the pool is not ready.
    pub fn connection_counts(&self) -> ConnectionCounts {
        let waiting = self.shared.stats.waiting();
        match &*self.shared.state() {
            Lifecycle::Ready(ready) => {
                let state = ready.pool.state();
                ConnectionCounts {
                    total: state.connections,
                    idle: state.idle_connections,
                    waiting,
                }
            }
            _ => ConnectionCounts {
                waiting,
                ..ConnectionCounts::default()
            },
        }
    }

    /// Probes the database and reports its health. Never fails: probe
    /// errors are reported as `healthy = false` with an error summary.
    pub async fn health_status(&self) -> HealthStatus {
        let ready = match &*self.shared.state() {
            Lifecycle::Ready(ready) => Some((
                ready.pool.clone(),
                ready.config.connect_timeout(),
                ready.started_at,
            )),
            _ => None,
        };

        let Some((pool, timeout, started_at)) = ready else {
            return HealthStatus {
                healthy: false,
                connections: self.connection_counts(),
                version: None,
                uptime_secs: 0,
                last_check_at: None,
                error: Some("database pool is not initialized".to_string()),
            };
        };

        let outcome = health::probe(pool, timeout).await;
        health::record(&self.shared.last_check, &outcome);
        let last_check_at = self.last_check_at();

        let (healthy, version, error) = match outcome {
            Ok(version) => (true, Some(version), None),
            Err(e) => (false, None, Some(e.to_string())),
        };

        HealthStatus {
            healthy,
            connections: self.connection_counts(),
            version,
            uptime_secs: started_at.elapsed().as_secs(),
            last_check_at,
            error,
        }
    }

    /// When the last connectivity probe finished, whether run by
    /// [`health_status`](Self::health_status) or the background task.
    pub fn last_check_at(&self) -> Option<DateTime<Utc>> {
        self.last_check().map(|check| check.at)
    }

    /// Error summary of the last probe, if it failed.
    pub fn last_check_error(&self) -> Option<String> {
        self.last_check().and_then(|check| check.outcome.err())
    }

    fn last_check(&self) -> Option<health::HealthCheck> {
        self.shared
            .last_check
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cumulative acquisition counters.
    pub fn statistics(&self) -> PoolStatistics {
        self.shared.stats.snapshot()
    }

    /// Resets the cumulative counters to zero.
    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
        tracing::debug!("pool statistics reset");
    }

    fn take_ready(&self) -> Option<Box<ReadyPool>> {
        let mut state = self.shared.state();
        match std::mem::replace(&mut *state, Lifecycle::ShutDown) {
            Lifecycle::Ready(ready) => Some(ready),
            previous => {
                *state = previous;
                None
            }
        }
    }

    /// Stops health checks, waits up to `timeout` (default 5s) for borrowed
    /// connections to come back, then closes the pool.
    ///
    /// Returns `true` if this call performed the teardown. Subsequent calls
    /// (and calls on a pool that was never initialized) return `false`.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        let Some(mut ready) = self.take_ready() else {
            tracing::debug!("database pool shutdown requested but pool is not running");
            return false;
        };
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        if let Some(task) = ready.health_task.take() {
            task.abort();
        }

        let pool = ready.pool;
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let state = pool.state();
                if state.idle_connections >= state.connections {
                    break;
                }
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;

        if drained.is_err() {
            let state = pool.state();
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                in_use = state.connections.saturating_sub(state.idle_connections),
                "database pool shutdown timed out, forcing termination"
            );
        }

        drop(pool);
        tracing::info!("database pool shut down");
        true
    }

    /// Tears the pool down immediately without waiting for in-flight work.
    ///
    /// Connections still borrowed close when their holders release them.
    /// Returns `true` if this call performed the teardown.
    pub fn force_shutdown(&self) -> bool {
        let Some(mut ready) = self.take_ready() else {
            return false;
        };
        if let Some(task) = ready.health_task.take() {
            task.abort();
        }
        let state = ready.pool.state();
        tracing::warn!(
            in_use = state.connections.saturating_sub(state.idle_connections),
            "database pool force shut down"
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> PoolConfig {
        PoolConfig {
            path: ":memory:".to_string(),
            max_connections: 2,
            health_check_interval_ms: 0,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn create_in_memory_pool() {
        let config = PoolConfig {
            statement_timeout_ms: 2_500,
            ..memory_config()
        };
        let pool = create_pool(config).await.expect("pool creation should succeed");
        let conn = pool.acquire(None).await.expect("should get a connection");
        let sqlite = conn.connection().expect("live connection");

        let mode: String = sqlite
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("should query journal_mode");
        assert!(mode == "wal" || mode == "memory", "unexpected journal_mode: {mode}");

        let fk: i32 = sqlite
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("should query foreign_keys");
        assert_eq!(fk, 1, "foreign keys should be enabled");

        let busy_timeout: i32 = sqlite
            .query_row("PRAGMA busy_timeout;", [], |row| row.get(0))
            .expect("should query busy_timeout");
        assert_eq!(busy_timeout, 2_500, "busy timeout should match settings");
    }

    #[tokio::test]
    async fn operations_before_initialize_are_unavailable() {
        let pool = DbPool::new();
        let err = pool.acquire(None).await.expect_err("pool is not ready");
        assert!(matches!(err, DataError::ServiceUnavailable(_)));
        assert!(!pool.is_ready());
        assert_eq!(pool.statistics().total_errors, 1);
    }

    #[tokio::test]
    async fn double_initialize_is_a_configuration_error() {
        let pool = create_pool(memory_config()).await.expect("first init");
        let err = pool
            .initialize(memory_config())
            .await
            .expect_err("second init should fail");
        assert!(matches!(err, DataError::Configuration(_)));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_connecting() {
        let pool = DbPool::new();
        let err = pool
            .initialize(PoolConfig {
                max_connections: 0,
                ..memory_config()
            })
            .await
            .expect_err("zero connections should fail");
        assert!(matches!(err, DataError::Configuration(_)));
        assert!(!pool.is_ready());
    }

    #[tokio::test]
    async fn unreachable_database_is_unavailable() {
        let pool = DbPool::new();
        let err = pool
            .initialize(PoolConfig {
                path: "/nonexistent-dir/strata/db.sqlite".to_string(),
                connect_timeout_ms: 200,
                ..memory_config()
            })
            .await
            .expect_err("unopenable path should fail");
        assert!(matches!(err, DataError::ServiceUnavailable(_)), "{err:?}");
        assert!(!pool.is_ready());
    }

    #[tokio::test]
    async fn double_release_is_a_no_op() {
        let pool = create_pool(memory_config()).await.expect("pool");
        let mut conn = pool.acquire(None).await.expect("connection");
        pool.release(&mut conn);
        pool.release(&mut conn);
        assert!(conn.is_released());
        assert!(conn.connection().is_err());

        let stats = pool.statistics();
        assert_eq!(stats.total_acquired, 1);
        assert_eq!(stats.total_released, 1);
    }

    #[tokio::test]
    async fn reset_statistics_zeroes_counters() {
        let pool = create_pool(memory_config()).await.expect("pool");
        pool.query("SELECT 1", vec![]).await.expect("query");
        assert!(pool.statistics().total_acquired >= 1);

        pool.reset_statistics();
        assert_eq!(pool.statistics(), PoolStatistics::default());
    }

    #[tokio::test]
    async fn health_status_reports_version_and_counts() {
        let pool = create_pool(memory_config()).await.expect("pool");
        let health = pool.health_status().await;
        assert!(health.healthy);
        assert!(health.version.is_some());
        assert!(health.last_check_at.is_some());
        assert!(health.error.is_none());
        assert!(health.connections.total <= 2);
    }

    #[tokio::test]
    async fn health_status_without_pool_does_not_fail() {
        let pool = DbPool::new();
        let health = pool.health_status().await;
        assert!(!health.healthy);
        assert!(health.error.is_some());
    }

    #[tokio::test]
    async fn force_shutdown_is_idempotent() {
        let pool = create_pool(memory_config()).await.expect("pool");
        assert!(pool.force_shutdown());
        assert!(!pool.force_shutdown());
        assert!(!pool.shutdown(None).await);
    }
}
