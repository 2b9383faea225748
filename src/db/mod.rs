//! Database access layer.
//!
//! This module provides everything below the transaction core:
//! - Connection and provider traits the core is written against
//! - The sqlx-backed provider for PostgreSQL, MySQL and SQLite
//! - Transaction-control SQL per backend
//! - Parameter binding and row decoding
//! - Backend dispatch macro

#[macro_use]
pub mod macros;
pub mod params;
pub mod pool;
pub mod provider;
pub mod statements;
pub mod types;

pub use pool::{DbPool, PooledConnection, SqlxConnection, SqlxConnectionProvider};
pub use provider::{Connection, ConnectionProvider, ProviderMetadata};
