//! Shared types and error definitions for the Strata data-access core.
//!
//! This crate provides the foundational types used across all Strata
//! crates: the [`DataError`] taxonomy every public operation returns, and
//! the dynamic [`Record`] row representation with its serde-based
//! projection into caller-defined structs.
//!
//! No crate in the workspace depends on anything *except* `strata-types`
//! for cross-cutting type definitions. This keeps the dependency graph
//! clean and prevents circular dependencies.

mod error;
mod record;

pub use error::{DataError, DbErrorKind};
pub use record::{from_record, to_record, Record};
