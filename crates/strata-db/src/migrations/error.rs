use std::path::PathBuf;
use strata_types::DataError;
use thiserror::Error;

use super::source::MigrationId;

/// An executed migration whose on-disk `up` script no longer matches the
/// checksum recorded when it ran.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChecksumMismatch {
    pub id: MigrationId,
    pub name: String,
    pub stored: String,
    pub computed: String,
}

fn mismatch_ids(mismatches: &[ChecksumMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur while loading or applying migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A pool or database operation failed.
    #[error(transparent)]
    Data(#[from] DataError),

    /// The migrations directory or a migration file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A migration file is malformed.
    #[error("invalid migration file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Two files share the same migration id.
    #[error("duplicate migration id {id}: {first} and {second}")]
    DuplicateId {
        id: MigrationId,
        first: PathBuf,
        second: PathBuf,
    },

    /// The bookkeeping table exists but was created by an incompatible version.
    #[error("bookkeeping table {table} is incompatible, missing columns: {}", .missing.join(", "))]
    IncompatibleTable {
        table: &'static str,
        missing: Vec<String>,
    },

    /// Executed migrations were edited after they ran.
    #[error("executed migrations changed on disk: {}", mismatch_ids(.0))]
    ChecksumMismatch(Vec<ChecksumMismatch>),

    /// An executed migration has no file on disk anymore.
    #[error("migration {id} was executed but its file can no longer be found")]
    MissingFile { id: MigrationId },

    /// Rollback was requested for a migration without a `down` section.
    #[error("migration {id} has no down section")]
    NoDownScript { id: MigrationId },

    /// A migration kept failing after every retry.
    #[error("migration {id} ({name}) failed after {attempts} attempt(s): {source}")]
    Failed {
        id: MigrationId,
        name: String,
        attempts: u32,
        source: DataError,
    },
}
