//! Conversion between JSON values and SQLite values, and statement execution.
//!
//! Parameters always travel through positional placeholders; nothing in
//! this module interpolates a value into SQL text.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use serde::Serialize;
use serde_json::{Number, Value};
use strata_types::{DataError, Record};

/// Rows produced by a statement, plus its row count.
///
/// For row-producing statements (`SELECT`, `... RETURNING`) `row_count` is
/// the number of rows returned; otherwise it is the number of rows affected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub rows: Vec<Record>,
    pub row_count: usize,
}

impl QueryResult {
    /// Consumes the result and returns its first row, if any.
    pub fn into_first(self) -> Option<Record> {
        self.rows.into_iter().next()
    }

    /// Returns the first row's value for a single-column result, or
    /// `Value::Null` when there are no rows.
    pub fn scalar(&self) -> Value {
        self.rows
            .first()
            .and_then(|row| row.values().next().cloned())
            .unwrap_or(Value::Null)
    }
}

/// Converts a JSON parameter into the value SQLite will bind.
///
/// Booleans bind as `0`/`1`; arrays and objects bind as their JSON text.
pub fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// Converts a column value read from SQLite into JSON.
pub fn from_sql_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
    }
}

fn row_to_record(row: &Row<'_>, columns: &[String]) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (idx, name) in columns.iter().enumerate() {
        record.insert(name.clone(), from_sql_ref(row.get_ref(idx)?));
    }
    Ok(record)
}

/// Prepares and runs a single parameterized statement.
///
/// # Errors
///
/// Returns `DataError::Database` if preparation, binding, or execution fails.
pub fn run_query(conn: &Connection, sql: &str, params: &[Value]) -> Result<QueryResult, DataError> {
    let mut stmt = conn.prepare(sql)?;
    let bound: Vec<SqlValue> = params.iter().map(to_sql_value).collect();

    if stmt.column_count() == 0 {
        let affected = stmt.execute(params_from_iter(bound.iter()))?;
        return Ok(QueryResult {
            rows: Vec::new(),
            row_count: affected,
        });
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut rows = stmt.query(params_from_iter(bound.iter()))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(row_to_record(row, &columns)?);
    }

    Ok(QueryResult {
        row_count: records.len(),
        rows: records,
    })
}
