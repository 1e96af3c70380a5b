//! SQL statement builders for the generic CRUD operations.
//!
//! Builders validate every identifier up front and never place a value in
//! SQL text: values become `?N` parameters. A builder that returns `Ok`
//! has done all the validation the operation needs, so callers can build
//! before touching the pool.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strata_types::{DataError, Record};

use crate::ident::{quote, EntityPolicy};

/// Largest page `find` will return.
pub const MAX_LIMIT: i64 = 10_000;

/// Equality criteria, ANDed together. `null` values match `IS NULL`.
pub type Criteria = Record;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Paging, ordering and projection for `find`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindOptions {
    /// Clamped to `[1, MAX_LIMIT]`; defaults to `MAX_LIMIT`.
    pub limit: Option<i64>,
    /// Negative offsets are treated as zero.
    pub offset: Option<i64>,
    pub order_by: Option<String>,
    pub order_direction: OrderDirection,
    /// Columns to return; all columns when absent.
    pub select: Option<Vec<String>>,
}

impl FindOptions {
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by = Some(column.into());
        self.order_direction = direction;
        self
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(MAX_LIMIT).clamp(1, MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    fn as_sql(self) -> &'static str {
        match self {
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlStatement {
    fn new(sql: String) -> Self {
        Self {
            sql,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("?{}", self.params.len())
    }

    fn push_where(&mut self, criteria: &Criteria) -> Result<(), DataError> {
        if criteria.is_empty() {
            return Ok(());
        }
        let mut clauses = Vec::with_capacity(criteria.len());
        for (column, value) in criteria {
            let column = quote(column)?;
            if value.is_null() {
                clauses.push(format!("{column} IS NULL"));
            } else {
                let slot = self.bind(value.clone());
                clauses.push(format!("{column} = {slot}"));
            }
        }
        self.sql.push_str(" WHERE ");
        self.sql.push_str(&clauses.join(" AND "));
        Ok(())
    }
}

fn column_list(columns: &[String]) -> Result<String, DataError> {
    if columns.is_empty() {
        return Err(DataError::Validation("select list is empty".to_string()));
    }
    Ok(columns
        .iter()
        .map(|c| quote(c))
        .collect::<Result<Vec<_>, _>>()?
        .join(", "))
}

/// `SELECT ... FROM entity WHERE ... ORDER BY ... LIMIT ? OFFSET ?`
///
/// # Errors
///
/// Returns `DataError::Validation` for any disallowed identifier.
pub fn select(
    policy: &EntityPolicy,
    entity: &str,
    criteria: &Criteria,
    options: &FindOptions,
) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    let columns = match &options.select {
        Some(columns) => column_list(columns)?,
        None => "*".to_string(),
    };

    let mut stmt = SqlStatement::new(format!("SELECT {columns} FROM {table}"));
    stmt.push_where(criteria)?;
    if let Some(order_by) = &options.order_by {
        let column = quote(order_by)?;
        stmt.sql
            .push_str(&format!(" ORDER BY {column} {}", options.order_direction.as_sql()));
    }
    let limit = stmt.bind(Value::from(options.effective_limit()));
    let offset = stmt.bind(Value::from(options.effective_offset()));
    stmt.sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
    Ok(stmt)
}

/// `SELECT COUNT(*) AS "count" FROM entity WHERE ...`
///
/// # Errors
///
/// Returns `DataError::Validation` for any disallowed identifier.
pub fn count(policy: &EntityPolicy, entity: &str, criteria: &Criteria) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    let mut stmt = SqlStatement::new(format!("SELECT COUNT(*) AS \"count\" FROM {table}"));
    stmt.push_where(criteria)?;
    Ok(stmt)
}

/// `SELECT EXISTS(SELECT 1 FROM entity WHERE ...) AS "exists"`
///
/// # Errors
///
/// Returns `DataError::Validation` for any disallowed identifier.
pub fn exists(policy: &EntityPolicy, entity: &str, criteria: &Criteria) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    let mut stmt = SqlStatement::new(format!("SELECT 1 FROM {table}"));
    stmt.push_where(criteria)?;
    stmt.sql = format!("SELECT EXISTS({}) AS \"exists\"", stmt.sql);
    Ok(stmt)
}

/// `SELECT FN(column) AS "value" FROM entity WHERE ...`
///
/// # Errors
///
/// Returns `DataError::Validation` for any disallowed identifier.
pub fn aggregate(
    policy: &EntityPolicy,
    entity: &str,
    function: Aggregate,
    column: &str,
    criteria: &Criteria,
) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    let column = quote(column)?;
    let mut stmt = SqlStatement::new(format!(
        "SELECT {}({column}) AS \"value\" FROM {table}",
        function.as_sql()
    ));
    stmt.push_where(criteria)?;
    Ok(stmt)
}

/// `INSERT INTO entity (...) VALUES (...) RETURNING *`
///
/// Adds a random UUID `id` when `data` has none.
///
/// # Errors
///
/// Returns `DataError::Validation` for empty data or any disallowed
/// identifier.
pub fn insert(policy: &EntityPolicy, entity: &str, mut data: Record) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    if data.is_empty() {
        return Err(DataError::Validation(format!("cannot create an empty {entity} row")));
    }
    if !data.contains_key("id") {
        data.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
    }

    let mut stmt = SqlStatement::new(String::new());
    let mut columns = Vec::with_capacity(data.len());
    let mut slots = Vec::with_capacity(data.len());
    for (column, value) in data {
        columns.push(quote(&column)?);
        slots.push(stmt.bind(value));
    }
    stmt.sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) RETURNING *",
        columns.join(", "),
        slots.join(", ")
    );
    Ok(stmt)
}

/// `UPDATE entity SET ... WHERE "id" = ? RETURNING *`
///
/// The `id` key in `data` is ignored; ids are never rewritten.
///
/// # Errors
///
/// Returns `DataError::Validation` if nothing is left to update or any
/// identifier is disallowed.
pub fn update(policy: &EntityPolicy, entity: &str, id: Value, mut data: Record) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    data.remove("id");
    if data.is_empty() {
        return Err(DataError::Validation(format!("no columns to update on {entity}")));
    }

    let mut stmt = SqlStatement::new(String::new());
    let mut assignments = Vec::with_capacity(data.len());
    for (column, value) in data {
        let column = quote(&column)?;
        let slot = stmt.bind(value);
        assignments.push(format!("{column} = {slot}"));
    }
    let id_slot = stmt.bind(id);
    stmt.sql = format!(
        "UPDATE {table} SET {} WHERE \"id\" = {id_slot} RETURNING *",
        assignments.join(", ")
    );
    Ok(stmt)
}

/// `DELETE FROM entity WHERE "id" = ?`
///
/// # Errors
///
/// Returns `DataError::Validation` for a disallowed entity.
pub fn delete(policy: &EntityPolicy, entity: &str, id: Value) -> Result<SqlStatement, DataError> {
    let table = policy.entity(entity)?;
    let mut stmt = SqlStatement::new(format!("DELETE FROM {table} WHERE \"id\" = "));
    let slot = stmt.bind(id);
    stmt.sql.push_str(&slot);
    Ok(stmt)
}
