//! Synchronous CRUD inside a transaction.

use serde_json::Value;
use strata_db::{QueryResult, Transaction};
use strata_types::{DataError, Record};

use crate::exec;
use crate::ident::EntityPolicy;
use crate::query::{self, Aggregate, Criteria, FindOptions, SqlStatement};

/// The handle passed to transaction closures.
///
/// Every operation runs on the transaction's connection. Nested scopes
/// opened with [`transaction`](Self::transaction) reuse that connection
/// through a savepoint.
pub struct TxScope<'s, 'c> {
    tx: &'s mut Transaction<'c>,
    policy: &'s EntityPolicy,
}

impl<'s, 'c> TxScope<'s, 'c> {
    pub(crate) fn new(tx: &'s mut Transaction<'c>, policy: &'s EntityPolicy) -> Self {
        Self { tx, policy }
    }

    /// `0` in the outermost scope, one more for each nested scope.
    pub fn depth(&self) -> u32 {
        self.tx.depth()
    }

    fn run(&self, stmt: &SqlStatement) -> Result<QueryResult, DataError> {
        self.tx.query(&stmt.sql, &stmt.params)
    }

    pub fn find(&self, entity: &str, criteria: &Criteria, options: &FindOptions) -> Result<Vec<Record>, DataError> {
        let stmt = query::select(self.policy, entity, criteria, options)?;
        Ok(self.run(&stmt)?.rows)
    }

    pub fn find_one(&self, entity: &str, criteria: &Criteria) -> Result<Option<Record>, DataError> {
        let stmt = query::select(self.policy, entity, criteria, &FindOptions::default().limit(1))?;
        Ok(self.run(&stmt)?.into_first())
    }

    pub fn find_by_id(&self, entity: &str, id: impl Into<Value>) -> Result<Option<Record>, DataError> {
        let mut criteria = Criteria::new();
        criteria.insert("id".to_string(), id.into());
        self.find_one(entity, &criteria)
    }

    pub fn count(&self, entity: &str, criteria: &Criteria) -> Result<i64, DataError> {
        let stmt = query::count(self.policy, entity, criteria)?;
        Ok(exec::count(&self.run(&stmt)?))
    }

    pub fn exists(&self, entity: &str, criteria: &Criteria) -> Result<bool, DataError> {
        let stmt = query::exists(self.policy, entity, criteria)?;
        Ok(exec::exists(&self.run(&stmt)?))
    }

    pub fn aggregate(
        &self,
        entity: &str,
        function: Aggregate,
        column: &str,
        criteria: &Criteria,
    ) -> Result<Value, DataError> {
        let stmt = query::aggregate(self.policy, entity, function, column, criteria)?;
        Ok(exec::aggregate(&self.run(&stmt)?))
    }

    pub fn create(&self, entity: &str, data: Record) -> Result<Record, DataError> {
        let stmt = query::insert(self.policy, entity, data)?;
        exec::created(self.run(&stmt)?, entity)
    }

    /// Inserts every row or none of them. The batch runs in its own
    /// savepoint, so a failed batch leaves this scope usable.
    pub fn create_many(&mut self, entity: &str, rows: Vec<Record>) -> Result<Vec<Record>, DataError> {
        let statements = rows
            .into_iter()
            .map(|row| query::insert(self.policy, entity, row))
            .collect::<Result<Vec<_>, _>>()?;

        self.transaction(|scope| {
            statements
                .iter()
                .map(|stmt| exec::created(scope.run(stmt)?, entity))
                .collect()
        })
    }

    /// Returns the updated row, or `None` when no row has that id.
    pub fn update(&self, entity: &str, id: impl Into<Value>, data: Record) -> Result<Option<Record>, DataError> {
        let stmt = query::update(self.policy, entity, id.into(), data)?;
        Ok(self.run(&stmt)?.into_first())
    }

    pub fn delete(&self, entity: &str, id: impl Into<Value>) -> Result<bool, DataError> {
        let stmt = query::delete(self.policy, entity, id.into())?;
        Ok(exec::deleted(&self.run(&stmt)?))
    }

    /// Runs raw parameterized SQL, refusing destructive statements.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DataError> {
        exec::guard_raw(sql)?;
        self.tx.query(sql, params)
    }

    /// Runs raw parameterized SQL without the destructive-statement check.
    pub fn query_admin(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DataError> {
        self.tx.query(sql, params)
    }

    /// Opens a nested scope backed by a savepoint.
    ///
    /// If `f` fails, its work is rolled back to the savepoint and the error
    /// is returned. Handling that error keeps this scope committable.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TxScope<'_, 'c>) -> Result<T, E>,
        E: From<DataError>,
    {
        let policy = self.policy;
        self.tx.transaction(|inner| f(&mut TxScope::new(inner, policy)))
    }
}
