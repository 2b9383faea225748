//! dbtx Library
//!
//! Transactional execution for SQL databases (SQLite, PostgreSQL, MySQL):
//! a retrying `transaction` block, nested transactions over savepoints,
//! commit/rollback interceptors and a registry of per-database managers.

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod models;
pub mod transaction;

pub use config::{Config, DatabaseUrl, TransactionConfig};
pub use database::{Database, TransactionOptions};
pub use error::{DbError, DbResult};
pub use models::{IsolationLevel, QueryParam, Row};
pub use transaction::{
    BlockingDatabase, BlockingTransaction, Transaction, TransactionInterceptor,
    TransactionManagerRegistry,
};
