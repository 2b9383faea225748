//! Data models for dbtx.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod isolation;
pub mod query;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionConfigError, DatabaseType, TransactionMetadata, TransactionStatus,
};
pub use isolation::IsolationLevel;
pub use query::{QueryParam, Row};
