//! Command-line interface definition.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Database migrations and health checks")]
pub struct Cli {
    /// Path to the TOML configuration file (falls back to STRATA_CONFIG_PATH, then strata.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<String>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show executed, pending and divergent migrations
    Status,
    /// Apply pending migrations
    Migrate(MigrateArgs),
    /// Roll back the most recently executed migration
    Rollback,
    /// Check executed migrations against their files on disk
    Validate,
    /// Create an empty migration file
    New {
        /// Human-readable migration name
        name: String,
    },
    /// Probe the database and report pool health
    Health,
}

#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct MigrateArgs {
    /// Validate pending migrations without executing them
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    pub dry_run: bool,

    /// Run even if executed migrations changed on disk
    #[arg(long = "no-validate", action = ArgAction::SetTrue)]
    pub no_validate: bool,

    /// Skip failing migrations instead of stopping
    #[arg(long = "continue-on-error", action = ArgAction::SetTrue)]
    pub continue_on_error: bool,

    /// Retries per migration before it counts as failed
    #[arg(long = "max-retries", value_name = "N", default_value_t = 3)]
    pub max_retries: u32,

    /// Back up the database first, optionally to PATH
    #[arg(long, value_name = "PATH", num_args = 0..=1)]
    pub backup: Option<Option<PathBuf>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_migrate_flags() {
        let cli = Cli::try_parse_from([
            "strata",
            "migrate",
            "--dry-run",
            "--continue-on-error",
            "--max-retries",
            "5",
            "--backup",
        ])
        .expect("parse");

        match cli.command {
            Command::Migrate(args) => {
                assert!(args.dry_run);
                assert!(!args.no_validate);
                assert!(args.continue_on_error);
                assert_eq!(args.max_retries, 5);
                assert_eq!(args.backup, Some(None));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn backup_path_and_global_flags() {
        let cli = Cli::try_parse_from([
            "strata",
            "migrate",
            "--backup",
            "/tmp/before.db",
            "--config",
            "prod.toml",
            "--json",
        ])
        .expect("parse");

        assert_eq!(cli.config.as_deref(), Some("prod.toml"));
        assert!(cli.json);
        match cli.command {
            Command::Migrate(args) => {
                assert_eq!(args.backup, Some(Some(PathBuf::from("/tmp/before.db"))));
                assert_eq!(args.max_retries, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn new_requires_a_name() {
        assert!(Cli::try_parse_from(["strata", "new"]).is_err());
        let cli = Cli::try_parse_from(["strata", "new", "add users"]).expect("parse");
        assert_eq!(
            cli.command,
            Command::New {
                name: "add users".to_string()
            }
        );
    }
}
