//! Database handle.
//!
//! A [`Database`] ties a connection provider to a transaction manager
//! registered in a [`TransactionManagerRegistry`], and is the usual entry
//! point for running transactional blocks.

use crate::config::{DatabaseUrl, TransactionConfig};
use crate::db::{ConnectionProvider, SqlxConnectionProvider};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionConfig, IsolationLevel, TransactionMetadata};
use crate::transaction::{
    DefaultTransactionManager, Transaction, TransactionManager, TransactionManagerRegistry,
    run_transactional,
};
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// Per-call overrides of the database defaults.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    /// Run nested in this transaction instead of the ambient one
    pub outer: Option<Transaction>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn outer(mut self, outer: Transaction) -> Self {
        self.outer = Some(outer);
        self
    }
}

/// Handle to a logical database.
#[derive(Clone)]
pub struct Database {
    id: String,
    registry: Arc<TransactionManagerRegistry>,
}

impl Database {
    /// Connect using a `[id=]url` string, registering in the process-wide registry.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let parsed = DatabaseUrl::parse(url).map_err(DbError::invalid_input)?;
        Self::connect_with(parsed, TransactionManagerRegistry::global()).await
    }

    /// Connect using a parsed URL, registering in `registry`.
    pub async fn connect_with(
        url: DatabaseUrl,
        registry: Arc<TransactionManagerRegistry>,
    ) -> DbResult<Self> {
        let config = ConnectionConfig::new(&url.id, &url.connection_string, url.pool_options)
            .map_err(|e| DbError::invalid_input(e.to_string()))?;
        let provider = SqlxConnectionProvider::connect(config).await?;
        Self::with_provider(url.id, Arc::new(provider), url.transaction, registry).await
    }

    /// Register a [`DefaultTransactionManager`] over `provider`.
    pub async fn with_provider(
        id: impl Into<String>,
        provider: Arc<dyn ConnectionProvider>,
        config: TransactionConfig,
        registry: Arc<TransactionManagerRegistry>,
    ) -> DbResult<Self> {
        let manager = DefaultTransactionManager::new(
            id,
            config,
            provider,
            registry.global_interceptors(),
        )?;
        Ok(Self::with_manager(Arc::new(manager), registry).await)
    }

    /// Register a custom manager.
    pub async fn with_manager(
        manager: Arc<dyn TransactionManager>,
        registry: Arc<TransactionManagerRegistry>,
    ) -> Self {
        let id = manager.database().to_string();
        registry.register(manager).await;
        Self { id, registry }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &Arc<TransactionManagerRegistry> {
        &self.registry
    }

    /// The manager currently registered for this database.
    pub async fn manager(&self) -> DbResult<Arc<dyn TransactionManager>> {
        self.registry.manager_for(&self.id).await
    }

    /// Run `block` in a transaction with the database defaults.
    ///
    /// ```ignore
    /// let count = db
    ///     .transaction(|tx| Box::pin(async move {
    ///         tx.exec("INSERT INTO users (name) VALUES ('alice')").await?;
    ///         tx.fetch_one_i64("SELECT COUNT(*) FROM users").await
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<'a, T, F>(&self, block: F) -> DbResult<T>
    where
        F: FnMut(Transaction) -> BoxFuture<'a, DbResult<T>> + Send + 'a,
        T: Send + 'a,
    {
        self.transaction_with(TransactionOptions::default(), block)
            .await
    }

    pub async fn transaction_with<'a, T, F>(
        &self,
        options: TransactionOptions,
        block: F,
    ) -> DbResult<T>
    where
        F: FnMut(Transaction) -> BoxFuture<'a, DbResult<T>> + Send + 'a,
        T: Send + 'a,
    {
        let manager = self.manager().await?;
        let config = manager.config();
        let isolation = options.isolation.or(config.default_isolation_level);
        let read_only = options.read_only.unwrap_or(config.default_read_only);
        run_transactional(manager, isolation, read_only, options.outer, block).await
    }

    pub async fn list_active(&self) -> DbResult<Vec<TransactionMetadata>> {
        Ok(self.manager().await?.list_active().await)
    }

    /// Close the manager and unregister it. Later calls fail with
    /// [`DbError::ManagerNotFound`].
    pub async fn close(&self) -> DbResult<()> {
        if self.registry.close_and_unregister(&self.id).await {
            Ok(())
        } else {
            Err(DbError::manager_not_found(&self.id))
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("id", &self.id).finish()
    }
}
