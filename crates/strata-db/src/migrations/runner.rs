//! Applies, validates, and rolls back migrations against a pool.
//!
//! The runner is a single sequential driver: pending migrations are applied
//! one at a time in ascending id order, each inside its own transaction
//! together with its bookkeeping row.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_types::DataError;

use super::error::{ChecksumMismatch, MigrationError};
use super::retry::{RetryDecision, RetryPolicy, Sleeper, TokioSleeper};
use super::source::{checksum, Migration, MigrationId, MigrationSet};
use crate::guard::find_destructive;
use crate::pool::DbPool;

/// Name of the bookkeeping table.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

const EXPECTED_COLUMNS: [&str; 4] = ["id", "name", "executed_at", "checksum"];

/// Upper bound on the size of an `up` script accepted by dry runs.
pub const MAX_SCRIPT_BYTES: usize = 1024 * 1024;

/// Where a migration is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Pending,
    Executing,
    Executed,
    Failed,
    RollingBack,
    RolledBack,
}

impl MigrationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bookkeeping row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub id: MigrationId,
    pub name: String,
    pub checksum: String,
    pub executed_at: String,
}

/// Read-only summary of applied versus on-disk migrations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub total: usize,
    pub executed: usize,
    pub pending: usize,
    pub checksum_mismatches: Vec<MigrationId>,
    /// Executed migrations whose files are gone.
    pub missing_files: Vec<MigrationId>,
}

/// Options for [`MigrationRunner::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Validate pending migrations without executing any SQL.
    pub dry_run: bool,
    /// Refuse to run when an executed migration changed on disk.
    pub validate_checksums: bool,
    /// Record a migration that exhausted its retries and move on.
    pub continue_on_error: bool,
    pub max_retries: u32,
    /// Copy the database with `VACUUM INTO` before applying anything.
    pub backup_before_run: bool,
    /// Backup destination; defaults to a timestamped sibling of the database.
    pub backup_path: Option<PathBuf>,
    /// Enables the destructive-statement warning scan during dry runs.
    pub production: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            validate_checksums: true,
            continue_on_error: false,
            max_retries: 3,
            backup_before_run: false,
            backup_path: None,
            production: false,
        }
    }
}

/// A migration that could not be applied (or failed dry-run validation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedMigration {
    pub id: MigrationId,
    pub name: String,
    pub error: String,
}

/// Outcome of [`MigrationRunner::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    /// Applied migrations, or in a dry run the ones that would be applied.
    pub applied: Vec<MigrationId>,
    pub failed: Vec<FailedMigration>,
    pub warnings: Vec<String>,
    pub backup: Option<PathBuf>,
}

/// Drives migrations from a directory against a [`DbPool`].
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    pool: DbPool,
    dir: PathBuf,
    sleeper: Arc<dyn Sleeper>,
}

fn ensure_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            executed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
            checksum TEXT NOT NULL CHECK (length(checksum) = 64)
        );"
    ))
    .map_err(DataError::from)?;

    let present = table_columns(conn)?;
    let missing: Vec<String> = EXPECTED_COLUMNS
        .iter()
        .filter(|col| !present.contains(**col))
        .map(|col| col.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(MigrationError::IncompatibleTable {
            table: MIGRATIONS_TABLE,
            missing,
        });
    }

    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS idx_{MIGRATIONS_TABLE}_executed_at ON {MIGRATIONS_TABLE} (executed_at);
         CREATE INDEX IF NOT EXISTS idx_{MIGRATIONS_TABLE}_checksum ON {MIGRATIONS_TABLE} (checksum);"
    ))
    .map_err(DataError::from)?;
    Ok(())
}

fn table_columns(conn: &Connection) -> Result<HashSet<String>, DataError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({MIGRATIONS_TABLE})"))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(columns)
}

fn table_exists(conn: &Connection) -> Result<bool, DataError> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [MIGRATIONS_TABLE],
        |row| row.get(0),
    )?)
}

fn parse_id(raw: String) -> rusqlite::Result<MigrationId> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })
}

fn read_applied(conn: &Connection) -> Result<Vec<AppliedMigration>, DataError> {
    if !table_exists(conn)? {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(&format!(
        "SELECT id, name, checksum, executed_at FROM {MIGRATIONS_TABLE}"
    ))?;
    let mut applied = stmt
        .query_map([], |row| {
            Ok(AppliedMigration {
                id: parse_id(row.get(0)?)?,
                name: row.get(1)?,
                checksum: row.get(2)?,
                executed_at: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    applied.sort_by_key(|m| m.id);
    Ok(applied)
}

fn mismatches(set: &MigrationSet, applied: &[AppliedMigration]) -> Vec<ChecksumMismatch> {
    applied
        .iter()
        .filter_map(|row| {
            let migration = set.get(row.id)?;
            let computed = checksum(&migration.up);
            (computed != row.checksum).then(|| ChecksumMismatch {
                id: row.id,
                name: row.name.clone(),
                stored: row.checksum.clone(),
                computed,
            })
        })
        .collect()
}

/// Structural checks run by dry runs: returns (errors, warnings).
fn inspect(migration: &Migration, production: bool) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Parsed files never have an empty up section, but sets built with
    // `MigrationSet::from_migrations` may.
    if migration.up.trim().is_empty() {
        errors.push("up section is empty".to_string());
    }
    if migration.up.len() > MAX_SCRIPT_BYTES {
        errors.push(format!(
            "up section is {} bytes, limit is {MAX_SCRIPT_BYTES}",
            migration.up.len()
        ));
    }
    if production {
        for kind in find_destructive(&migration.up) {
            warnings.push(format!(
                "migration {} ({}) contains {kind}",
                migration.id, migration.name
            ));
        }
    }
    if migration.down.is_none() {
        warnings.push(format!(
            "migration {} ({}) has no down section and cannot be rolled back",
            migration.id, migration.name
        ));
    }

    (errors, warnings)
}

fn default_backup_path(db_path: &str) -> Result<PathBuf, DataError> {
    if db_path == ":memory:" || db_path.starts_with("file:") {
        return Err(DataError::Configuration(
            "backup_path is required when the database has no plain file path".to_string(),
        ));
    }
    let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
    Ok(PathBuf::from(format!("{db_path}.backup-{stamp}")))
}

impl MigrationRunner {
    pub fn new(pool: DbPool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            dir: dir.into(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replaces the sleeper used between retries.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads the migrations directory on the blocking pool.
    ///
    /// # Errors
    ///
    /// See [`MigrationSet::load`].
    pub async fn load(&self) -> Result<MigrationSet, MigrationError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || MigrationSet::load(&dir))
            .await
            .map_err(|e| DataError::ServiceUnavailable(format!("migration loader failed: {e}")))?
    }

    /// Creates the bookkeeping table and its indexes if absent and checks
    /// that an existing table has the expected columns. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::IncompatibleTable` if a prior, incompatible
    /// table exists, or `MigrationError::Data` on database failure.
    pub async fn initialize(&self) -> Result<(), MigrationError> {
        self.pool.with_connection(ensure_table).await?;
        tracing::debug!(table = MIGRATIONS_TABLE, "migration bookkeeping table ready");
        Ok(())
    }

    /// Rows of the bookkeeping table in ascending id order. Empty if the
    /// table does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Data` on database failure.
    pub async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrationError> {
        Ok(self.pool.with_connection(read_applied).await?)
    }

    /// Summarizes applied, pending, and divergent migrations. Read-only.
    ///
    /// # Errors
    ///
    /// Returns loader errors or `MigrationError::Data`.
    pub async fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let set = self.load().await?;
        let applied = self.applied().await?;
        let applied_ids: HashSet<MigrationId> = applied.iter().map(|m| m.id).collect();

        Ok(MigrationStatus {
            total: set.len(),
            executed: applied.len(),
            pending: set.iter().filter(|m| !applied_ids.contains(&m.id)).count(),
            checksum_mismatches: mismatches(&set, &applied).into_iter().map(|m| m.id).collect(),
            missing_files: applied
                .iter()
                .filter(|row| set.get(row.id).is_none())
                .map(|row| row.id)
                .collect(),
        })
    }

    /// Recomputes the checksum of every executed migration's `up` script
    /// and reports those that no longer match.
    ///
    /// # Errors
    ///
    /// Returns loader errors or `MigrationError::Data`.
    pub async fn validate_checksums(&self) -> Result<Vec<ChecksumMismatch>, MigrationError> {
        let set = self.load().await?;
        let applied = self.applied().await?;
        let found = mismatches(&set, &applied);
        for m in &found {
            tracing::warn!(
                migration = %m.id,
                name = %m.name,
                stored = %m.stored,
                computed = %m.computed,
                "executed migration changed on disk"
            );
        }
        Ok(found)
    }

    /// Applies pending migrations in ascending id order.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ChecksumMismatch` when validation is enabled
    /// and history diverges, `MigrationError::Failed` when a migration
    /// exhausts its retries without `continue_on_error`, and loader or
    /// database errors.
    pub async fn run(&self, options: RunOptions) -> Result<RunReport, MigrationError> {
        let set = self.load().await?;
        self.initialize().await?;
        let applied = self.applied().await?;

        let divergent = mismatches(&set, &applied);
        if !divergent.is_empty() {
            if options.validate_checksums {
                tracing::error!(count = divergent.len(), "refusing to run: executed migrations changed on disk");
                return Err(MigrationError::ChecksumMismatch(divergent));
            }
            tracing::warn!(count = divergent.len(), "executed migrations changed on disk, continuing");
        }

        let applied_ids: HashSet<MigrationId> = applied.iter().map(|m| m.id).collect();
        let latest_applied = applied.iter().map(|m| m.id).max();
        let pending: Vec<&Migration> = set.iter().filter(|m| !applied_ids.contains(&m.id)).collect();
        for m in &pending {
            tracing::debug!(migration = %m.id, name = %m.name, state = %MigrationState::Pending, "migration pending");
        }

        let mut report = RunReport {
            dry_run: options.dry_run,
            ..RunReport::default()
        };

        if let Some(latest) = latest_applied {
            for m in pending.iter().filter(|m| m.id < latest) {
                report.warnings.push(format!(
                    "migration {} ({}) is older than the latest applied migration {latest}",
                    m.id, m.name
                ));
            }
        }

        if pending.is_empty() {
            tracing::info!("no pending migrations");
            return Ok(report);
        }

        if options.dry_run {
            for m in pending {
                let (errors, warnings) = inspect(m, options.production);
                report.warnings.extend(warnings);
                if errors.is_empty() {
                    report.applied.push(m.id);
                } else {
                    report.failed.push(FailedMigration {
                        id: m.id,
                        name: m.name.clone(),
                        error: errors.join("; "),
                    });
                }
            }
            tracing::info!(
                would_apply = report.applied.len(),
                invalid = report.failed.len(),
                "dry run complete"
            );
            return Ok(report);
        }

        if options.backup_before_run {
            report.backup = Some(self.backup(options.backup_path.clone()).await?);
        }

        let policy = RetryPolicy::new(options.max_retries);
        for m in pending {
            match self.apply_with_retry(m, policy).await {
                Ok(()) => report.applied.push(m.id),
                Err(err) if options.continue_on_error => {
                    tracing::error!(migration = %m.id, error = %err, "skipping failed migration");
                    report.failed.push(FailedMigration {
                        id: m.id,
                        name: m.name.clone(),
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    tracing::error!(
                        applied = report.applied.len(),
                        "migration run aborted"
                    );
                    return Err(err);
                }
            }
        }

        tracing::info!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "migration run complete"
        );
        Ok(report)
    }

    async fn backup(&self, requested: Option<PathBuf>) -> Result<PathBuf, MigrationError> {
        let path = match requested {
            Some(path) => path,
            None => {
                let db_path = self
                    .pool
                    .config()
                    .map(|c| c.path)
                    .ok_or_else(|| DataError::ServiceUnavailable("database pool is not initialized".to_string()))?;
                default_backup_path(&db_path)?
            }
        };

        let target = path.to_string_lossy().into_owned();
        self.pool
            .with_connection(move |conn| -> Result<(), DataError> {
                conn.execute("VACUUM INTO ?1", [target])?;
                Ok(())
            })
            .await?;
        tracing::info!(path = %path.display(), "database backed up before migration");
        Ok(path)
    }

    async fn apply_with_retry(&self, migration: &Migration, policy: RetryPolicy) -> Result<(), MigrationError> {
        let mut failures = 0;
        loop {
            tracing::info!(
                migration = %migration.id,
                name = %migration.name,
                state = %MigrationState::Executing,
                "applying migration"
            );
            let err = match self.apply_once(migration).await {
                Ok(()) => {
                    tracing::info!(migration = %migration.id, state = %MigrationState::Executed, "migration applied");
                    return Ok(());
                }
                Err(err) => err,
            };

            failures += 1;
            match policy.after_failure(failures) {
                RetryDecision::Retry { attempt, delay } => {
                    tracing::warn!(
                        migration = %migration.id,
                        state = %MigrationState::Failed,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "migration failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
                }
                RetryDecision::GiveUp { attempts } => {
                    return Err(MigrationError::Failed {
                        id: migration.id,
                        name: migration.name.clone(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }

    async fn apply_once(&self, migration: &Migration) -> Result<(), DataError> {
        let id = migration.id.to_string();
        let name = migration.name.clone();
        let up = migration.up.clone();
        let sum = migration.checksum.clone();

        self.pool
            .transaction(move |tx| -> Result<(), DataError> {
                tx.execute_batch(&up)?;
                tx.connection().execute(
                    &format!("INSERT INTO {MIGRATIONS_TABLE} (id, name, checksum) VALUES (?1, ?2, ?3)"),
                    params![id, name, sum],
                )?;
                Ok(())
            })
            .await
    }

    /// Rolls back the most recently executed migration.
    ///
    /// Returns the rolled back id, or `None` (with a warning) when nothing
    /// has been executed.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::MissingFile` if the migration's file is gone,
    /// `MigrationError::NoDownScript` if it has no down section, and loader
    /// or database errors.
    pub async fn rollback_last(&self) -> Result<Option<MigrationId>, MigrationError> {
        let set = self.load().await?;

        let latest = self
            .pool
            .with_connection(|conn| -> Result<Option<MigrationId>, DataError> {
                if !table_exists(conn)? {
                    return Ok(None);
                }
                let raw: Option<String> = conn
                    .query_row(
                        &format!(
                            "SELECT id FROM {MIGRATIONS_TABLE}
                             ORDER BY executed_at DESC, CAST(id AS INTEGER) DESC
                             LIMIT 1"
                        ),
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(raw.map(parse_id).transpose()?)
            })
            .await?;

        let Some(id) = latest else {
            tracing::warn!("no executed migrations to roll back");
            return Ok(None);
        };

        let migration = set.get(id).ok_or(MigrationError::MissingFile { id })?;
        let down = migration
            .down
            .clone()
            .ok_or(MigrationError::NoDownScript { id })?;

        tracing::info!(
            migration = %id,
            name = %migration.name,
            state = %MigrationState::RollingBack,
            "rolling back migration"
        );

        let key = id.to_string();
        self.pool
            .transaction(move |tx| -> Result<(), DataError> {
                tx.execute_batch(&down)?;
                tx.connection().execute(
                    &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE id = ?1"),
                    [key],
                )?;
                Ok(())
            })
            .await?;

        tracing::info!(migration = %id, state = %MigrationState::RolledBack, "migration rolled back");
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(up: &str) -> Migration {
        Migration {
            id: MigrationId::new(1),
            name: "widgets".to_string(),
            up: up.to_string(),
            down: None,
            checksum: checksum(up),
            path: PathBuf::from("1_widgets.sql"),
        }
    }

    #[test]
    fn inspect_rejects_hand_built_empty_up() {
        let (errors, warnings) = inspect(&migration("  \n"), false);
        assert_eq!(errors, vec!["up section is empty".to_string()]);
        assert!(warnings.iter().any(|w| w.contains("no down section")), "{warnings:?}");
    }

    #[test]
    fn inspect_warns_on_destructive_statements_in_production() {
        let m = migration("DROP TABLE widgets;");
        let (errors, quiet) = inspect(&m, false);
        assert!(errors.is_empty());
        let (_, loud) = inspect(&m, true);
        assert!(loud.len() > quiet.len(), "{loud:?}");
    }

    #[test]
    fn states_render_as_snake_case() {
        let rendered: Vec<String> = [
            MigrationState::Pending,
            MigrationState::Executing,
            MigrationState::Executed,
            MigrationState::Failed,
            MigrationState::RollingBack,
            MigrationState::RolledBack,
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(
            rendered,
            ["pending", "executing", "executed", "failed", "rolling_back", "rolled_back"]
        );
    }
}
