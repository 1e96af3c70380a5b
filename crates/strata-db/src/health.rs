//! Connectivity probing and the periodic health-check task.

use chrono::{DateTime, Utc};
use r2d2_sqlite::SqliteConnectionManager;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strata_types::DataError;
use tokio::task::JoinHandle;
use tokio::time::sleep;

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// Live connection gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionCounts {
    pub total: u32,
    pub idle: u32,
    pub waiting: u32,
}

/// Point-in-time health report. Building one never fails.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub connections: ConnectionCounts,
    /// SQLite library version reported by the probe.
    pub version: Option<String>,
    pub uptime_secs: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Summary of the probe failure when `healthy` is false.
    pub error: Option<String>,
}

/// Outcome of the most recent probe, shared with the background task.
#[derive(Debug, Clone)]
pub(crate) struct HealthCheck {
    pub(crate) at: DateTime<Utc>,
    pub(crate) outcome: Result<String, String>,
}

pub(crate) type LastCheck = Arc<Mutex<Option<HealthCheck>>>;

/// Runs `SELECT 1` on a freshly acquired connection and returns the SQLite
/// version. Blocking.
pub(crate) fn probe_blocking(pool: &Pool, timeout: Duration) -> Result<String, DataError> {
    let conn = pool.get_timeout(timeout).map_err(|e| {
        DataError::ServiceUnavailable(format!("could not acquire a connection for probe: {e}"))
    })?;
    let (one, version): (i64, String) =
        conn.query_row("SELECT 1, sqlite_version()", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
    if one != 1 {
        return Err(DataError::ServiceUnavailable(format!(
            "connectivity probe returned {one}"
        )));
    }
    Ok(version)
}

/// Runs the probe on the blocking pool, bounded by `timeout`.
pub(crate) async fn probe(pool: Pool, timeout: Duration) -> Result<String, DataError> {
    let task = tokio::task::spawn_blocking(move || probe_blocking(&pool, timeout));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(DataError::ServiceUnavailable(format!(
            "probe task failed: {join_err}"
        ))),
        Err(_) => Err(DataError::ServiceUnavailable(format!(
            "probe did not complete within {}ms",
            timeout.as_millis()
        ))),
    }
}

pub(crate) fn record(last: &LastCheck, outcome: &Result<String, DataError>) {
    let check = HealthCheck {
        at: Utc::now(),
        outcome: outcome.as_ref().map(Clone::clone).map_err(ToString::to_string),
    };
    *last.lock().unwrap_or_else(|e| e.into_inner()) = Some(check);
}

/// Starts the periodic connectivity probe.
///
/// A failed probe is logged and recorded; it never tears the pool down.
pub(crate) fn spawn_health_task(
    pool: Pool,
    interval: Duration,
    timeout: Duration,
    last: LastCheck,
) -> JoinHandle<()> {
    tracing::info!(interval_ms = interval.as_millis() as u64, "starting database health checks");

    tokio::spawn(async move {
        loop {
            sleep(interval).await;

            let outcome = probe(pool.clone(), timeout).await;
            match &outcome {
                Ok(version) => tracing::debug!(%version, "database health check passed"),
                Err(e) => tracing::error!(error = %e, "database health check failed"),
            }
            record(&last, &outcome);
        }
    })
}
