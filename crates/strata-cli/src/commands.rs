//! Command implementations.
//!
//! Each command opens its own pool, does its work, and shuts the pool down
//! again before returning, whatever the outcome.

use serde::Serialize;
use std::future::Future;
use strata_data::{DataService, StartupError};
use strata_db::migrations::{MigrationSet, MigrationStatus};
use strata_db::{create_pool, DbPool, MigrationError, MigrationRunner, RunOptions, RunReport};
use strata_types::DataError;
use thiserror::Error;

use crate::cli::{Command, MigrateArgs};
use crate::config::Config;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("{0} executed migration(s) changed on disk")]
    Divergent(usize),

    #[error("{0} migration(s) failed")]
    MigrationsFailed(usize),

    #[error("database is unhealthy: {0}")]
    Unhealthy(String),
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T) -> String) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text(value));
    }
    Ok(())
}

async fn with_runner<T, F, Fut>(config: &Config, f: F) -> Result<T, CliError>
where
    F: FnOnce(MigrationRunner) -> Fut,
    Fut: Future<Output = Result<T, CliError>>,
{
    let pool: DbPool = create_pool(config.database.clone()).await?;
    let runner = MigrationRunner::new(pool.clone(), &config.migrations.path);
    let result = f(runner).await;
    pool.shutdown(None).await;
    result
}

fn status_text(status: &MigrationStatus) -> String {
    let mut lines = vec![format!(
        "migrations: {} total, {} executed, {} pending",
        status.total, status.executed, status.pending
    )];
    lines.extend(status.checksum_mismatches.iter().map(|id| format!("checksum mismatch: {id}")));
    lines.extend(status.missing_files.iter().map(|id| format!("missing file: {id}")));
    lines.join("\n")
}

fn report_text(report: &RunReport) -> String {
    let verb = if report.dry_run { "would apply" } else { "applied" };
    let mut lines = Vec::new();
    if let Some(path) = &report.backup {
        lines.push(format!("backup written to {}", path.display()));
    }
    lines.extend(report.applied.iter().map(|id| format!("{verb}: {id}")));
    lines.extend(
        report
            .failed
            .iter()
            .map(|f| format!("failed: {} ({}): {}", f.id, f.name, f.error)),
    );
    lines.extend(report.warnings.iter().map(|w| format!("warning: {w}")));
    if lines.is_empty() {
        lines.push("nothing to migrate".to_string());
    }
    lines.join("\n")
}

fn run_options(args: &MigrateArgs, config: &Config) -> RunOptions {
    RunOptions {
        dry_run: args.dry_run,
        validate_checksums: !args.no_validate,
        continue_on_error: args.continue_on_error,
        max_retries: args.max_retries,
        backup_before_run: args.backup.is_some(),
        backup_path: args.backup.clone().flatten(),
        production: config.migrations.production,
    }
}

/// Runs one command against `config`.
///
/// # Errors
///
/// Returns the command's failure; the binary turns it into a non-zero exit
/// status.
pub async fn run(command: Command, config: &Config, json: bool) -> Result<(), CliError> {
    match command {
        Command::Status => {
            let status = with_runner(config, |runner| async move {
                runner.status().await.map_err(CliError::from)
            })
            .await?;
            emit(json, &status, status_text)
        }
        Command::Migrate(args) => {
            let options = run_options(&args, config);
            let report = with_runner(config, |runner| async move {
                runner.run(options).await.map_err(CliError::from)
            })
            .await?;
            emit(json, &report, report_text)?;
            if report.failed.is_empty() {
                Ok(())
            } else {
                Err(CliError::MigrationsFailed(report.failed.len()))
            }
        }
        Command::Rollback => {
            let rolled = with_runner(config, |runner| async move {
                runner.rollback_last().await.map_err(CliError::from)
            })
            .await?;
            emit(json, &rolled, |rolled| match rolled {
                Some(id) => format!("rolled back: {id}"),
                None => "nothing to roll back".to_string(),
            })
        }
        Command::Validate => {
            let mismatches = with_runner(config, |runner| async move {
                runner.validate_checksums().await.map_err(CliError::from)
            })
            .await?;
            emit(json, &mismatches, |found| {
                if found.is_empty() {
                    return "all executed migrations match their files".to_string();
                }
                found
                    .iter()
                    .map(|m| {
                        format!(
                            "checksum mismatch: {} ({}) stored {} computed {}",
                            m.id, m.name, m.stored, m.computed
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            if mismatches.is_empty() {
                Ok(())
            } else {
                Err(CliError::Divergent(mismatches.len()))
            }
        }
        Command::New { name } => {
            let path = MigrationSet::scaffold(&config.migrations.path, &name, chrono::Utc::now())?;
            emit(json, &path, |path| format!("created {}", path.display()))
        }
        Command::Health => {
            let service = DataService::initialize(config.service_config()).await?;
            let health = service.health().await;
            let statistics = service.statistics();
            service.shutdown(None).await;

            #[derive(Serialize)]
            struct HealthReport<'a> {
                health: &'a strata_db::HealthStatus,
                statistics: &'a strata_db::PoolStatistics,
            }
            let report = HealthReport {
                health: &health,
                statistics: &statistics,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);

            if health.healthy {
                Ok(())
            } else {
                Err(CliError::Unhealthy(
                    health.error.unwrap_or_else(|| "unknown error".to_string()),
                ))
            }
        }
    }
}
