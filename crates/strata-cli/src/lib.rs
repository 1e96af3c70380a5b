//! The `strata` command-line tool.
//!
//! Loads configuration from a TOML file with environment overrides, then
//! runs migration and health commands against the configured database.

pub mod cli;
pub mod commands;
pub mod config;
