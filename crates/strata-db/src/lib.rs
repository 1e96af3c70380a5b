//! Pooled, transactional SQLite access and a directory-driven migration
//! runner.
//!
//! Provides a bounded `r2d2` connection pool with an explicit lifecycle,
//! acquisition statistics and health probes, nested transactions through
//! savepoints, and migrations loaded from `<id>_<name>.sql` files.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: no external database process is required.
//!   WAL mode allows concurrent readers with a single writer.
//! - **Blocking work on the blocking pool**: SQLite calls are synchronous,
//!   so every async operation hands its connection work to
//!   `tokio::task::spawn_blocking`.
//! - **Runtime migrations**: migration files are read from disk rather than
//!   embedded, and each one is checksummed when it runs.

mod config;
mod connection;
pub mod guard;
mod health;
pub mod migrations;
mod pool;
mod stats;
mod tx;
mod value;

pub use config::PoolConfig;
pub use connection::PooledConnection;
pub use guard::{find_destructive, DestructiveStatement};
pub use health::{ConnectionCounts, HealthStatus};
pub use migrations::{MigrationError, MigrationRunner, RunOptions, RunReport};
pub use pool::{create_pool, DbPool};
pub use stats::PoolStatistics;
pub use tx::Transaction;
pub use value::{from_sql_ref, run_query, to_sql_value, QueryResult};
