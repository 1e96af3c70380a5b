//! The error taxonomy shared by the pool, data service, and migration runner.

use rusqlite::ffi;
use std::fmt;
use thiserror::Error;

/// Classification of a failure reported by the database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// A `UNIQUE` constraint rejected the write.
    UniqueViolation,
    /// A `PRIMARY KEY` constraint rejected the write.
    PrimaryKeyViolation,
    /// A `FOREIGN KEY` constraint rejected the write.
    ForeignKeyViolation,
    /// A `NOT NULL` constraint rejected the write.
    NotNullViolation,
    /// A `CHECK` constraint rejected the write.
    CheckViolation,
    /// Any other constraint violation.
    OtherConstraint,
    /// The database was busy or locked by another connection.
    Busy,
    /// Statement preparation or execution failed for a non-constraint reason.
    Execution,
}

impl DbErrorKind {
    /// Maps an SQLite extended result code onto a kind.
    pub fn from_extended_code(code: i32) -> Self {
        match code {
            ffi::SQLITE_CONSTRAINT_UNIQUE => Self::UniqueViolation,
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Self::PrimaryKeyViolation,
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Self::ForeignKeyViolation,
            ffi::SQLITE_CONSTRAINT_NOTNULL => Self::NotNullViolation,
            ffi::SQLITE_CONSTRAINT_CHECK => Self::CheckViolation,
            _ => match code & 0xff {
                ffi::SQLITE_CONSTRAINT => Self::OtherConstraint,
                ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => Self::Busy,
                _ => Self::Execution,
            },
        }
    }

    /// Whether this kind represents a constraint violation.
    pub fn is_constraint(self) -> bool {
        matches!(
            self,
            Self::UniqueViolation
                | Self::PrimaryKeyViolation
                | Self::ForeignKeyViolation
                | Self::NotNullViolation
                | Self::CheckViolation
                | Self::OtherConstraint
        )
    }

    /// Returns the string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UniqueViolation => "unique_violation",
            Self::PrimaryKeyViolation => "primary_key_violation",
            Self::ForeignKeyViolation => "foreign_key_violation",
            Self::NotNullViolation => "not_null_violation",
            Self::CheckViolation => "check_violation",
            Self::OtherConstraint => "constraint_violation",
            Self::Busy => "busy",
            Self::Execution => "execution",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by every public data-access operation.
///
/// Callers never see a raw driver error: engine failures are classified
/// into [`DataError::Database`] with the extended result code preserved.
#[derive(Debug, Error)]
pub enum DataError {
    /// Bad or duplicate initialization.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Rejected input: bad identifiers, empty payloads, disallowed raw SQL.
    #[error("validation error: {0}")]
    Validation(String),

    /// The pool is not ready or the database cannot be reached.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// No connection became available within the acquire timeout.
    #[error("timed out after {waited_ms}ms waiting for a database connection")]
    AcquireTimeout {
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// The database rejected or failed to execute a statement.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Classification of the failure.
        kind: DbErrorKind,
        /// SQLite extended result code, when the engine reported one.
        code: Option<i32>,
        /// Human-readable message from the engine.
        message: String,
        /// The underlying driver error.
        #[source]
        source: Option<rusqlite::Error>,
    },

    /// A row could not be projected into (or built from) a typed value.
    #[error("row projection failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DataError {
    /// Builds a [`DataError::Database`] with no underlying driver error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Database {
            kind: DbErrorKind::Execution,
            code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Whether the error belongs to the service-unavailable class.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable(_) | Self::AcquireTimeout { .. })
    }

    /// Returns the engine error kind for database failures.
    pub fn db_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DataError {
    fn from(err: rusqlite::Error) -> Self {
        let (kind, code, message) = match &err {
            rusqlite::Error::SqliteFailure(failure, msg) => (
                DbErrorKind::from_extended_code(failure.extended_code),
                Some(failure.extended_code),
                msg.clone().unwrap_or_else(|| failure.to_string()),
            ),
            other => (DbErrorKind::Execution, None, other.to_string()),
        };
        Self::Database {
            kind,
            code,
            message,
            source: Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn unique_violation_is_classified() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.execute_batch(
            "CREATE TABLE users (id TEXT PRIMARY KEY, email TEXT UNIQUE);
             INSERT INTO users (id, email) VALUES ('a', 'x@example.com');",
        )
        .expect("setup should succeed");

        let err: DataError = conn
            .execute(
                "INSERT INTO users (id, email) VALUES ('b', 'x@example.com')",
                [],
            )
            .expect_err("duplicate email should fail")
            .into();

        assert_eq!(err.db_kind(), Some(DbErrorKind::UniqueViolation));
        match err {
            DataError::Database { code, source, .. } => {
                assert_eq!(code, Some(ffi::SQLITE_CONSTRAINT_UNIQUE));
                assert!(source.is_some(), "driver error should be preserved");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn foreign_key_violation_is_classified() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE parents (id TEXT PRIMARY KEY);
             CREATE TABLE children (id TEXT PRIMARY KEY, parent_id TEXT REFERENCES parents(id));",
        )
        .expect("setup should succeed");

        let err: DataError = conn
            .execute("INSERT INTO children (id, parent_id) VALUES ('c', 'nope')", [])
            .expect_err("dangling reference should fail")
            .into();

        let kind = err.db_kind().expect("should be a database error");
        assert_eq!(kind, DbErrorKind::ForeignKeyViolation);
        assert!(kind.is_constraint());
    }

    #[test]
    fn syntax_errors_are_execution_failures() {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        let err: DataError = conn
            .execute("SELEC 1", [])
            .expect_err("bad sql should fail")
            .into();
        assert_eq!(err.db_kind(), Some(DbErrorKind::Execution));
        assert!(!err.is_unavailable());
    }

    #[test]
    fn unavailable_class_covers_timeouts() {
        assert!(DataError::AcquireTimeout { waited_ms: 10 }.is_unavailable());
        assert!(DataError::ServiceUnavailable("down".into()).is_unavailable());
        assert!(!DataError::Validation("bad".into()).is_unavailable());
    }
}
