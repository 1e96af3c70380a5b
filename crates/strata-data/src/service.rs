//! The async data service.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use strata_db::{
    DbPool, HealthStatus, MigrationError, MigrationRunner, PoolConfig, PoolStatistics, QueryResult, RunOptions,
    RunReport,
};
use strata_types::{DataError, Record};
use thiserror::Error;

use crate::exec;
use crate::ident::EntityPolicy;
use crate::query::{self, Aggregate, Criteria, FindOptions, SqlStatement};
use crate::scope::TxScope;

/// Everything [`DataService::initialize`] needs.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub database: PoolConfig,
    pub migrations_path: PathBuf,
    pub run_migrations_on_startup: bool,
    /// Passed through to the migration run as `RunOptions::production`.
    pub production: bool,
    pub entities: EntityPolicy,
}

/// Errors from [`DataService::initialize`].
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to initialize database pool: {0}")]
    Pool(#[from] DataError),

    #[error("startup migrations failed: {0}")]
    Migrations(#[from] MigrationError),
}

/// Generic, injection-safe CRUD over named entities.
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct DataService {
    pool: DbPool,
    policy: Arc<EntityPolicy>,
}

impl DataService {
    /// Wraps an existing pool. Operations fail with
    /// `DataError::ServiceUnavailable` until the pool is initialized.
    pub fn new(pool: DbPool, policy: EntityPolicy) -> Self {
        Self {
            pool,
            policy: Arc::new(policy),
        }
    }

    /// Initializes a pool from `config` and, when configured, applies
    /// pending migrations before returning.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Pool` if the pool cannot be initialized and
    /// `StartupError::Migrations` if the startup migration run fails. The
    /// pool is shut down again in the latter case.
    pub async fn initialize(config: ServiceConfig) -> Result<Self, StartupError> {
        let pool = strata_db::create_pool(config.database).await?;

        if config.run_migrations_on_startup {
            let runner = MigrationRunner::new(pool.clone(), &config.migrations_path);
            match Self::migrate(&runner, config.production).await {
                Ok(report) => tracing::info!(
                    applied = report.applied.len(),
                    warnings = report.warnings.len(),
                    "startup migrations complete"
                ),
                Err(err) => {
                    pool.force_shutdown();
                    return Err(err.into());
                }
            }
        }

        Ok(Self::new(pool, config.entities))
    }

    async fn migrate(runner: &MigrationRunner, production: bool) -> Result<RunReport, MigrationError> {
        runner.initialize().await?;
        runner
            .run(RunOptions {
                production,
                ..RunOptions::default()
            })
            .await
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn run(&self, stmt: SqlStatement) -> Result<QueryResult, DataError> {
        self.pool.query(stmt.sql, stmt.params).await
    }

    /// Rows of `entity` matching `criteria`.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Validation` for disallowed identifiers (before
    /// any I/O), or pool and database errors.
    pub async fn find(&self, entity: &str, criteria: Criteria, options: FindOptions) -> Result<Vec<Record>, DataError> {
        let stmt = query::select(&self.policy, entity, &criteria, &options)?;
        let rows = self.run(stmt).await?.rows;
        tracing::debug!(entity, rows = rows.len(), "find");
        Ok(rows)
    }

    /// The first row matching `criteria`, if any.
    ///
    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn find_one(&self, entity: &str, criteria: Criteria) -> Result<Option<Record>, DataError> {
        let stmt = query::select(&self.policy, entity, &criteria, &FindOptions::default().limit(1))?;
        Ok(self.run(stmt).await?.into_first())
    }

    /// The row whose `id` column equals `id`, if any.
    ///
    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn find_by_id(&self, entity: &str, id: impl Into<Value>) -> Result<Option<Record>, DataError> {
        let mut criteria = Criteria::new();
        criteria.insert("id".to_string(), id.into());
        self.find_one(entity, criteria).await
    }

    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn count(&self, entity: &str, criteria: Criteria) -> Result<i64, DataError> {
        let stmt = query::count(&self.policy, entity, &criteria)?;
        Ok(exec::count(&self.run(stmt).await?))
    }

    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn exists(&self, entity: &str, criteria: Criteria) -> Result<bool, DataError> {
        let stmt = query::exists(&self.policy, entity, &criteria)?;
        Ok(exec::exists(&self.run(stmt).await?))
    }

    /// `SUM`/`AVG`/`MIN`/`MAX` of `column`; `null` over an empty set.
    ///
    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn aggregate(
        &self,
        entity: &str,
        function: Aggregate,
        column: &str,
        criteria: Criteria,
    ) -> Result<Value, DataError> {
        let stmt = query::aggregate(&self.policy, entity, function, column, &criteria)?;
        Ok(exec::aggregate(&self.run(stmt).await?))
    }

    /// Inserts one row and returns it as stored, including generated
    /// columns. A UUID `id` is generated when `data` has none.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Validation` for empty data or disallowed
    /// identifiers and `DataError::Database` for constraint violations.
    pub async fn create(&self, entity: &str, data: Record) -> Result<Record, DataError> {
        let stmt = query::insert(&self.policy, entity, data)?;
        let row = exec::created(self.run(stmt).await?, entity)?;
        tracing::debug!(entity, id = %row.get("id").unwrap_or(&serde_json::Value::Null), "created row");
        Ok(row)
    }

    /// Inserts every row in one transaction; nothing is kept if any insert
    /// fails. Rows come back in input order.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub async fn create_many(&self, entity: &str, rows: Vec<Record>) -> Result<Vec<Record>, DataError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let statements = rows
            .into_iter()
            .map(|row| query::insert(&self.policy, entity, row))
            .collect::<Result<Vec<_>, _>>()?;

        let entity_name = entity.to_string();
        let created = self
            .pool
            .transaction(move |tx| {
                statements
                    .iter()
                    .map(|stmt| exec::created(tx.query(&stmt.sql, &stmt.params)?, &entity_name))
                    .collect::<Result<Vec<_>, DataError>>()
            })
            .await?;
        tracing::debug!(entity, rows = created.len(), "created rows");
        Ok(created)
    }

    /// Updates the row with `id` and returns it, or `None` if no row has
    /// that id. The `id` column itself is never changed.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Validation` when nothing is left to update.
    pub async fn update(&self, entity: &str, id: impl Into<Value>, data: Record) -> Result<Option<Record>, DataError> {
        let stmt = query::update(&self.policy, entity, id.into(), data)?;
        Ok(self.run(stmt).await?.into_first())
    }

    /// Deletes the row with `id`; `false` when no row matched.
    ///
    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub async fn delete(&self, entity: &str, id: impl Into<Value>) -> Result<bool, DataError> {
        let stmt = query::delete(&self.policy, entity, id.into())?;
        Ok(exec::deleted(&self.run(stmt).await?))
    }

    /// Runs raw parameterized SQL.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Validation` if the SQL contains `DROP TABLE`,
    /// `TRUNCATE`, `ALTER TABLE`, or a `DELETE` without `WHERE`. This is a
    /// best-effort check, not a security boundary.
    pub async fn query(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<QueryResult, DataError> {
        let sql = sql.into();
        exec::guard_raw(&sql)?;
        self.pool.query(sql, params).await
    }

    /// Runs raw parameterized SQL without the destructive-statement check.
    ///
    /// # Errors
    ///
    /// Returns pool and database errors.
    pub async fn query_admin(&self, sql: impl Into<String>, params: Vec<Value>) -> Result<QueryResult, DataError> {
        let sql = sql.into();
        tracing::info!(sql = %sql, "running administrative query");
        self.pool.query(sql, params).await
    }

    /// Runs `f` in one transaction on one connection.
    ///
    /// Commits if `f` returns `Ok`, rolls back and returns the error
    /// otherwise. Use [`TxScope::transaction`] inside `f` for savepoints.
    ///
    /// # Errors
    ///
    /// Returns `f`'s error, or pool and database errors converted into `E`.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut TxScope<'_, '_>) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DataError> + Send + 'static,
    {
        let policy = Arc::clone(&self.policy);
        self.pool
            .transaction(move |tx| f(&mut TxScope::new(tx, &policy)))
            .await
    }

    pub fn statistics(&self) -> PoolStatistics {
        self.pool.statistics()
    }

    pub async fn health(&self) -> HealthStatus {
        self.pool.health_status().await
    }

    /// See [`DbPool::shutdown`].
    pub async fn shutdown(&self, timeout: Option<Duration>) -> bool {
        self.pool.shutdown(timeout).await
    }
}
