//! Transactions with savepoint-based nesting.
//!
//! The outermost scope issues `BEGIN` and `COMMIT`/`ROLLBACK`. Every nested
//! scope opened through [`Transaction::transaction`] issues
//! `SAVEPOINT sp_N` and either `RELEASE SAVEPOINT sp_N` or
//! `ROLLBACK TO SAVEPOINT sp_N`, where `N` increases monotonically within
//! the enclosing transaction.

use rusqlite::Connection;
use serde_json::Value;
use std::cell::Cell;
use strata_types::DataError;

use crate::value::{run_query, QueryResult};

/// A unit of work bound to one borrowed connection.
///
/// The connection is only reachable through this handle while the
/// transaction is active, so it cannot be reused outside of it.
pub struct Transaction<'a> {
    conn: &'a Connection,
    savepoints: &'a Cell<u32>,
    depth: u32,
}

impl<'a> Transaction<'a> {
    /// The bound connection.
    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// `0` for the outermost scope, incremented for each savepoint level.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Runs one parameterized statement inside the transaction.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Database` if the statement fails.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DataError> {
        run_query(self.conn, sql, params)
    }

    /// Runs a batch of semicolon-separated statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Database` if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> Result<(), DataError> {
        Ok(self.conn.execute_batch(sql)?)
    }

    /// Opens a nested scope backed by a savepoint.
    ///
    /// On success the savepoint is released. On failure the work done in
    /// the nested scope is rolled back to the savepoint and the error is
    /// returned; if the caller handles it, the enclosing scope can still
    /// commit. If it propagates to the outermost scope, everything rolls
    /// back.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or `DataError::Database` (converted into
    /// `E`) if the savepoint cannot be created or released.
    pub fn transaction<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'a>) -> Result<T, E>,
        E: From<DataError>,
    {
        let seq = self.savepoints.get() + 1;
        self.savepoints.set(seq);
        let name = format!("sp_{seq}");

        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(DataError::from)?;
        tracing::trace!(savepoint = %name, depth = self.depth + 1, "savepoint opened");

        let mut nested = Transaction {
            conn: self.conn,
            savepoints: self.savepoints,
            depth: self.depth + 1,
        };

        match f(&mut nested) {
            Ok(value) => {
                self.conn
                    .execute_batch(&format!("RELEASE SAVEPOINT {name}"))
                    .map_err(DataError::from)?;
                Ok(value)
            }
            Err(err) => {
                // ROLLBACK TO leaves the savepoint on the stack; release it too.
                if let Err(rollback_err) = self.conn.execute_batch(&format!(
                    "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"
                )) {
                    tracing::error!(
                        savepoint = %name,
                        error = %rollback_err,
                        "failed to roll back to savepoint"
                    );
                } else {
                    tracing::debug!(savepoint = %name, "rolled back to savepoint");
                }
                Err(err)
            }
        }
    }
}

/// Runs `f` inside `BEGIN` / `COMMIT`, rolling back on any error.
///
/// A rollback failure is logged and never replaces the error that caused
/// the rollback.
pub(crate) fn run_in_transaction<T, E, F>(conn: &Connection, f: F) -> Result<T, E>
where
    F: FnOnce(&mut Transaction<'_>) -> Result<T, E>,
    E: From<DataError>,
{
    conn.execute_batch("BEGIN").map_err(DataError::from)?;

    let savepoints = Cell::new(0);
    let mut tx = Transaction {
        conn,
        savepoints: &savepoints,
        depth: 0,
    };

    match f(&mut tx) {
        Ok(value) => match conn.execute_batch("COMMIT") {
            Ok(()) => Ok(value),
            Err(commit_err) => {
                rollback(conn);
                Err(DataError::from(commit_err).into())
            }
        },
        Err(err) => {
            rollback(conn);
            Err(err)
        }
    }
}

fn rollback(conn: &Connection) {
    if conn.is_autocommit() {
        return;
    }
    match conn.execute_batch("ROLLBACK") {
        Ok(()) => tracing::debug!("transaction rolled back"),
        Err(e) => tracing::error!(error = %e, "transaction rollback failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.execute_batch("CREATE TABLE log (entry TEXT NOT NULL);")
            .expect("schema should apply");
        conn
    }

    fn entries(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT entry FROM log ORDER BY rowid")
            .expect("prepare");
        stmt.query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows")
    }

    fn insert(tx: &Transaction<'_>, entry: &str) -> Result<(), DataError> {
        tx.query("INSERT INTO log (entry) VALUES (?1)", &[json!(entry)])?;
        Ok(())
    }

    #[test]
    fn commit_persists_work() {
        let conn = setup();
        run_in_transaction(&conn, |tx| insert(tx, "a")).expect("commit");
        assert_eq!(entries(&conn), vec!["a"]);
        assert!(conn.is_autocommit());
    }

    #[test]
    fn error_rolls_back_everything() {
        let conn = setup();
        let err = run_in_transaction(&conn, |tx| {
            insert(tx, "a")?;
            Err::<(), _>(DataError::Validation("boom".into()))
        })
        .expect_err("closure error should propagate");

        assert!(matches!(err, DataError::Validation(msg) if msg == "boom"));
        assert!(entries(&conn).is_empty());
        assert!(conn.is_autocommit());
    }

    #[test]
    fn caught_nested_failure_rolls_back_only_its_savepoint() {
        let conn = setup();
        run_in_transaction(&conn, |tx| {
            insert(tx, "outer")?;
            let nested: Result<(), DataError> = tx.transaction(|inner| {
                assert_eq!(inner.depth(), 1);
                insert(inner, "inner")?;
                Err(DataError::Validation("inner failure".into()))
            });
            assert!(nested.is_err());
            insert(tx, "after")
        })
        .expect("outer scope should commit");

        assert_eq!(entries(&conn), vec!["outer", "after"]);
    }

    #[test]
    fn propagated_nested_failure_rolls_back_whole_transaction() {
        let conn = setup();
        let result: Result<(), DataError> = run_in_transaction(&conn, |tx| {
            insert(tx, "outer")?;
            tx.transaction(|inner| {
                insert(inner, "inner")?;
                Err(DataError::Validation("inner failure".into()))
            })
        });

        assert!(result.is_err());
        assert!(entries(&conn).is_empty());
    }

    #[test]
    fn savepoint_names_increase_within_a_transaction() {
        let conn = setup();
        run_in_transaction(&conn, |tx| {
            tx.transaction(|a| {
                a.transaction(|b| {
                    assert_eq!(b.depth(), 2);
                    insert(b, "deep")
                })
            })?;
            tx.transaction(|c| insert(c, "second"))?;
            // Three savepoints were opened; the counter never reuses a name.
            assert_eq!(tx.savepoints.get(), 3);
            Ok::<_, DataError>(())
        })
        .expect("commit");

        assert_eq!(entries(&conn), vec!["deep", "second"]);
    }
}
