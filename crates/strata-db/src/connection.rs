//! Exclusively-owned handles to pooled connections.

use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use serde_json::Value;
use std::sync::Arc;
use strata_types::DataError;

use crate::stats::PoolStats;
use crate::value::{run_query, QueryResult};

type Inner = r2d2::PooledConnection<SqliteConnectionManager>;

/// A connection borrowed from a [`DbPool`](crate::DbPool).
///
/// The handle is released exactly once: either explicitly through
/// [`release`](Self::release) or when it is dropped. Releasing an already
/// released handle is a logged no-op.
pub struct PooledConnection {
    inner: Option<Inner>,
    stats: Arc<PoolStats>,
    id: u64,
}

impl PooledConnection {
    pub(crate) fn new(inner: Inner, stats: Arc<PoolStats>, id: u64) -> Self {
        Self {
            inner: Some(inner),
            stats,
            id,
        }
    }

    /// Sequence number assigned at acquisition, used in log fields.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    /// Borrows the underlying SQLite connection.
    ///
    /// # Errors
    ///
    /// Returns `DataError::ServiceUnavailable` if the handle was released.
    pub fn connection(&self) -> Result<&Connection, DataError> {
        self.inner.as_deref().ok_or_else(|| {
            DataError::ServiceUnavailable(format!("connection {} was already released", self.id))
        })
    }

    /// Runs one parameterized statement on this connection.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Database` on execution failure, or
    /// `DataError::ServiceUnavailable` if the handle was released.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DataError> {
        run_query(self.connection()?, sql, params)
    }

    /// Returns the connection to the pool.
    ///
    /// A transaction left open on the connection (for example by a panic
    /// unwinding through a caller's closure) is rolled back first so the
    /// next borrower starts clean.
    pub fn release(&mut self) {
        let Some(conn) = self.inner.take() else {
            tracing::warn!(connection = self.id, "connection already released, ignoring");
            return;
        };

        if !conn.is_autocommit() {
            tracing::warn!(
                connection = self.id,
                "connection released with an open transaction, rolling back"
            );
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::error!(connection = self.id, error = %e, "failed to roll back abandoned transaction");
            }
        }

        drop(conn);
        self.stats.record_release();
        tracing::trace!(connection = self.id, "connection released");
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.release();
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}
