//! Transaction-control SQL per backend.
//!
//! Statements here never carry user input except savepoint names, which are
//! validated as plain identifiers and emitted unquoted so the same text works
//! on every backend.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, IsolationLevel};

/// Statements that open a transaction with the requested settings, in order.
///
/// SQLite has no per-transaction isolation or access mode. READ UNCOMMITTED
/// maps to `PRAGMA read_uncommitted` and read-only to `PRAGMA query_only`;
/// both are undone by [`reset_statements`] when the transaction ends.
pub fn begin_statements(
    db_type: DatabaseType,
    isolation: Option<IsolationLevel>,
    read_only: bool,
) -> Vec<String> {
    match db_type {
        DatabaseType::PostgreSQL => {
            let mut sql = String::from("BEGIN");
            if let Some(level) = isolation {
                sql.push_str(" ISOLATION LEVEL ");
                sql.push_str(level.as_sql());
            }
            if read_only {
                sql.push_str(" READ ONLY");
            }
            vec![sql]
        }
        DatabaseType::MySQL => {
            let mut stmts = Vec::with_capacity(2);
            // Applies to the next transaction only
            if let Some(level) = isolation {
                stmts.push(format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()));
            }
            stmts.push(if read_only {
                "START TRANSACTION READ ONLY".to_string()
            } else {
                "START TRANSACTION".to_string()
            });
            stmts
        }
        DatabaseType::SQLite => {
            let mut stmts = Vec::with_capacity(3);
            if isolation == Some(IsolationLevel::ReadUncommitted) {
                stmts.push("PRAGMA read_uncommitted = 1".to_string());
            }
            if read_only {
                stmts.push("PRAGMA query_only = 1".to_string());
            }
            stmts.push("BEGIN".to_string());
            stmts
        }
    }
}

/// Statements that undo session settings applied by [`begin_statements`].
pub fn reset_statements(
    db_type: DatabaseType,
    isolation: Option<IsolationLevel>,
    read_only: bool,
) -> Vec<&'static str> {
    let mut stmts = Vec::new();
    if db_type == DatabaseType::SQLite {
        if isolation == Some(IsolationLevel::ReadUncommitted) {
            stmts.push("PRAGMA read_uncommitted = 0");
        }
        if read_only {
            stmts.push("PRAGMA query_only = 0");
        }
    }
    stmts
}

pub const COMMIT: &str = "COMMIT";
pub const ROLLBACK: &str = "ROLLBACK";

pub fn savepoint(name: &str) -> DbResult<String> {
    validate_savepoint_name(name)?;
    Ok(format!("SAVEPOINT {name}"))
}

pub fn release_savepoint(name: &str) -> DbResult<String> {
    validate_savepoint_name(name)?;
    Ok(format!("RELEASE SAVEPOINT {name}"))
}

pub fn rollback_to_savepoint(name: &str) -> DbResult<String> {
    validate_savepoint_name(name)?;
    Ok(format!("ROLLBACK TO SAVEPOINT {name}"))
}

/// Savepoint names must be ASCII identifiers: letters, digits and
/// underscores, not starting with a digit.
pub fn validate_savepoint_name(name: &str) -> DbResult<()> {
    let Some(first) = name.chars().next() else {
        return Err(DbError::invalid_input("Savepoint name cannot be empty"));
    };
    if first.is_ascii_digit() {
        return Err(DbError::invalid_input(format!(
            "Savepoint name '{name}' cannot start with a digit"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(DbError::invalid_input(format!(
            "Savepoint name '{name}' may only contain letters, digits and underscores"
        )));
    }
    Ok(())
}
