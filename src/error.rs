//! Error types for dbtx.
//!
//! This module defines all error types using `thiserror`. Driver errors are
//! converted into [`DbError`] at the boundary and classified in exactly one
//! place, [`DbError::class`], which is what the retry executor consults.
//!
//! # Classification
//!
//! | Error                                   | Class     |
//! |-----------------------------------------|-----------|
//! | `Connection`                            | Transient |
//! | `Timeout`                               | Transient |
//! | `Database`, SQLSTATE class `08`         | Transient |
//! | `Database`, SQLSTATE `40001` / `40P01`  | Transient |
//! | `Database`, SQLSTATE `55P03` / `57014`  | Transient |
//! | `Database`, MySQL 1205 / 1213 / 3024    | Transient |
//! | `Database`, SQLite BUSY (5) / LOCKED (6)| Transient |
//! | anything else                           | Fatal     |

use thiserror::Error;

/// Boxed error type carried by [`DbError::Application`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// SQLSTATE codes that indicate the operation may succeed when retried.
const TRANSIENT_SQL_STATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "55P03", // lock_not_available
    "57014", // query_canceled (statement_timeout)
    "57P01", // admin_shutdown
];

/// MySQL error numbers: lock wait timeout, deadlock, max execution time exceeded.
const TRANSIENT_MYSQL_ERRORS: &[i64] = &[1205, 1213, 3024];

/// SQLite primary result codes: SQLITE_BUSY, SQLITE_LOCKED.
const TRANSIENT_SQLITE_CODES: &[i64] = &[5, 6];

/// Retry classification of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The attempt may succeed if repeated on a fresh transaction.
    Transient,
    /// Retrying cannot help; propagate immediately.
    Fatal,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40001" for serialization failure
        sql_state: Option<String>,
        /// MySQL error number or SQLite extended result code
        vendor_code: Option<i64>,
        /// Statement that was executing when the driver failed
        statement: Option<String>,
        suggestion: String,
    },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("No transaction manager registered for database '{database}'")]
    ManagerNotFound { database: String },

    #[error("No transaction is active in the current context")]
    NoCurrentTransaction,

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Interceptor '{interceptor}' failed in {event}: {message}")]
    Interceptor {
        interceptor: String,
        event: String,
        message: String,
    },

    #[error(transparent)]
    Application(BoxError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            vendor_code: None,
            statement: None,
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error carrying a vendor-specific error code.
    pub fn database_with_vendor_code(
        message: impl Into<String>,
        sql_state: Option<String>,
        vendor_code: i64,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            vendor_code: Some(vendor_code),
            statement: None,
            suggestion: "Check the SQL syntax and referenced objects".to_string(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a manager-not-found error.
    pub fn manager_not_found(database: impl Into<String>) -> Self {
        Self::ManagerNotFound {
            database: database.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an interceptor failure.
    pub fn interceptor(
        interceptor: impl Into<String>,
        event: impl std::fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::Interceptor {
            interceptor: interceptor.into(),
            event: event.to_string(),
            message: message.into(),
        }
    }

    /// Wrap an error raised by user code inside a transactional block.
    pub fn application(err: impl Into<BoxError>) -> Self {
        Self::Application(err.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the statement being executed to a driver error.
    ///
    /// Non-database errors are returned unchanged.
    pub fn with_statement(self, sql: &str) -> Self {
        match self {
            Self::Database {
                message,
                sql_state,
                vendor_code,
                statement: None,
                suggestion,
            } => Self::Database {
                message,
                sql_state,
                vendor_code,
                statement: Some(sql.to_string()),
                suggestion,
            },
            other => other,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Statement text attached to a driver error.
    pub fn statement(&self) -> Option<&str> {
        match self {
            Self::Database { statement, .. } => statement.as_deref(),
            _ => None,
        }
    }

    /// Classify this error for retry purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => ErrorClass::Transient,
            Self::Database {
                sql_state,
                vendor_code,
                ..
            } => {
                if sql_state.as_deref().is_some_and(is_transient_sql_state)
                    || vendor_code.is_some_and(is_transient_vendor_code)
                {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            _ => ErrorClass::Fatal,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// True for errors that originated in the driver or the connection.
    pub fn is_driver_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Database { .. } | Self::Timeout { .. }
        )
    }
}

fn is_transient_sql_state(state: &str) -> bool {
    state.starts_with("08") || TRANSIENT_SQL_STATES.contains(&state)
}

fn is_transient_vendor_code(code: i64) -> bool {
    // SQLite extended codes carry the primary code in the low byte.
    TRANSIENT_MYSQL_ERRORS.contains(&code) || TRANSIENT_SQLITE_CODES.contains(&(code & 0xff))
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.to_string());
                if let Some(mysql) = db_err.try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                {
                    DbError::database_with_vendor_code(message, code, mysql.number() as i64)
                } else if db_err
                    .try_downcast_ref::<sqlx::sqlite::SqliteError>()
                    .is_some()
                {
                    match code.as_deref().and_then(|c| c.parse::<i64>().ok()) {
                        Some(vendor) => DbError::database_with_vendor_code(message, None, vendor),
                        None => DbError::database(
                            message,
                            None,
                            "Check the SQL syntax and referenced objects",
                        ),
                    }
                } else {
                    DbError::database(message, code, "Check the SQL syntax and referenced objects")
                }
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => DbError::timeout("connection pool acquire", 0),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::internal(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection(
                "Database worker crashed",
                "Reconnect to the database",
            ),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
