//! Connection-related data models.
//!
//! This module defines types for database connection configuration and
//! the observable state of transactions.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Configuration for a database connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub db_type: DatabaseType,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// Connection pool configuration options.
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl ConnectionConfig {
    /// Create a new connection configuration.
    pub fn new(
        id: impl Into<String>,
        connection_string: impl Into<String>,
        pool_options: PoolOptions,
    ) -> Result<Self, ConnectionConfigError> {
        let id = id.into();
        let connection_string = connection_string.into();

        if id.is_empty() {
            return Err(ConnectionConfigError::EmptyId);
        }
        if !id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConnectionConfigError::InvalidId(id));
        }

        let db_type = DatabaseType::from_connection_string(&connection_string)
            .ok_or_else(|| ConnectionConfigError::UnknownDatabaseType(connection_string.clone()))?;

        Ok(Self {
            id,
            db_type,
            connection_string,
            pool_options,
        })
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        if let Some(at_pos) = self.connection_string.find('@') {
            if let Some(colon_pos) = self.connection_string[..at_pos].rfind(':') {
                let prefix = &self.connection_string[..colon_pos + 1];
                let suffix = &self.connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
        self.connection_string.clone()
    }
}

/// Errors that can occur when creating a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    /// Connection ID is empty
    #[error("Connection ID cannot be empty")]
    EmptyId,

    /// Connection ID contains invalid characters
    #[error("Connection ID contains invalid characters: {0}")]
    InvalidId(String),

    /// Could not determine database type from connection string
    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),
}

/// Lifecycle status of a transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// No statement has touched the connection yet
    NotStarted,
    /// A database transaction (or savepoint) is open
    Active,
    Committed,
    RolledBack,
    /// Connection released; the state must not be used again
    Closed,
}

impl TransactionStatus {
    /// Check if a database transaction is currently open.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the state has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Snapshot of a transaction state, for listing without holding it.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionMetadata {
    pub transaction_id: String,
    pub database: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// Milliseconds since the state was created
    pub duration_ms: u64,
    pub statement_count: u64,
    pub status: TransactionStatus,
    pub nested: bool,
}
