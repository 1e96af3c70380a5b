//! Shapes raw query results into the values each operation returns.

use serde_json::Value;
use strata_db::{find_destructive, QueryResult};
use strata_types::{DataError, Record};

pub(crate) fn count(result: &QueryResult) -> i64 {
    result.scalar().as_i64().unwrap_or(0)
}

pub(crate) fn exists(result: &QueryResult) -> bool {
    result.scalar().as_i64() == Some(1)
}

pub(crate) fn aggregate(result: &QueryResult) -> Value {
    result.scalar()
}

pub(crate) fn created(result: QueryResult, entity: &str) -> Result<Record, DataError> {
    result
        .into_first()
        .ok_or_else(|| DataError::execution(format!("insert into {entity} returned no row")))
}

pub(crate) fn deleted(result: &QueryResult) -> bool {
    result.row_count > 0
}

/// Rejects raw SQL that looks destructive.
pub(crate) fn guard_raw(sql: &str) -> Result<(), DataError> {
    let found = find_destructive(sql);
    if found.is_empty() {
        return Ok(());
    }
    let kinds = found.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ");
    tracing::warn!(statements = %kinds, "rejected destructive raw query");
    Err(DataError::Validation(format!(
        "raw query contains disallowed statements ({kinds}); use query_admin for administrative SQL"
    )))
}
