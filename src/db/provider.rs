//! Connection seams.
//!
//! The transaction core talks to the database only through [`Connection`] and
//! [`ConnectionProvider`]. The sqlx-backed implementation lives in
//! [`crate::db::pool`]; tests substitute scripted doubles.

use crate::error::DbResult;
use crate::models::{DatabaseType, IsolationLevel, QueryParam, Row};
use futures_util::future::BoxFuture;
use serde::Serialize;

/// A single database connection exclusively owned by one transaction state.
pub trait Connection: Send {
    /// Open a database transaction.
    fn begin(
        &mut self,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    ) -> BoxFuture<'_, DbResult<()>>;

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>>;

    fn savepoint<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DbResult<()>>;

    fn release_savepoint<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DbResult<()>>;

    fn rollback_to_savepoint<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DbResult<()>>;

    /// Run a statement and return the number of affected rows.
    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<u64>>;

    /// Run a query and return all rows.
    fn fetch_all<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<Vec<Row>>>;

    /// Release the connection. An open transaction is rolled back first.
    fn close(self: Box<Self>) -> BoxFuture<'static, DbResult<()>>;
}

/// Descriptive information about a provider's database.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderMetadata {
    /// None for providers that are not backed by a real database
    pub database_type: Option<DatabaseType>,
    /// Credentials are masked
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

/// Source of fresh connections. Failures from `create` are classified like
/// any other driver error, so a connection drop is retried.
pub trait ConnectionProvider: Send + Sync {
    fn create(&self) -> BoxFuture<'_, DbResult<Box<dyn Connection>>>;

    fn metadata(&self) -> ProviderMetadata;

    /// Release pooled resources.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}
