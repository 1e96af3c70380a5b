//! Versioned SQL migrations read from a directory at runtime.
//!
//! Each migration runs exactly once, inside a transaction together with its
//! row in the `schema_migrations` bookkeeping table. Executed migrations are
//! fingerprinted so later edits to their files are detected.

mod error;
mod retry;
mod runner;
mod source;

pub use error::{ChecksumMismatch, MigrationError};
pub use retry::{RecordingSleeper, RetryDecision, RetryPolicy, SleepFuture, Sleeper, TokioSleeper};
pub use runner::{
    AppliedMigration, FailedMigration, MigrationRunner, MigrationState, MigrationStatus, RunOptions, RunReport,
    MAX_SCRIPT_BYTES, MIGRATIONS_TABLE,
};
pub use source::{checksum, Migration, MigrationId, MigrationSet};
