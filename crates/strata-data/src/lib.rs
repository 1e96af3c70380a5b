//! Generic data service over a Strata connection pool.
//!
//! Provides CRUD, counting, aggregation and raw-query operations over named
//! tables without a compiled type per table. Table and column names are
//! runtime strings, so every one of them passes through a single validator
//! ([`ident`]) before it reaches SQL text; values only ever travel as
//! positional parameters.
//!
//! Transactions hand a [`TxScope`] to the caller's closure. The scope
//! exposes the same operations synchronously on the transaction's
//! connection and opens savepoints for nested scopes.

mod exec;
pub mod ident;
pub mod query;
mod scope;
mod service;

pub use ident::EntityPolicy;
pub use query::{Aggregate, Criteria, FindOptions, OrderDirection, SqlStatement, MAX_LIMIT};
pub use scope::TxScope;
pub use service::{DataService, ServiceConfig, StartupError};
