//! Transaction managers and the registry that maps database handles to them.

use crate::config::TransactionConfig;
use crate::db::ConnectionProvider;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, TransactionMetadata};
use crate::transaction::interceptor::{InterceptorChain, SharedInterceptor};
use crate::transaction::state::Transaction;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Open top-level transactions of one manager, keyed by transaction id.
pub(crate) type ActiveTransactions = RwLock<HashMap<String, Transaction>>;

/// Produces transaction states for one database handle.
///
/// `new_transaction` is the extension point for custom backends: the
/// executor reaches the database only through the states it returns.
pub trait TransactionManager: Send + Sync {
    fn database(&self) -> &str;

    fn config(&self) -> &TransactionConfig;

    /// Create a fresh state. With `outer` set, the state is nested in it.
    fn new_transaction(
        &self,
        isolation: Option<IsolationLevel>,
        read_only: bool,
        outer: Option<Transaction>,
    ) -> BoxFuture<'_, DbResult<Transaction>>;

    /// Snapshot of open top-level transactions.
    fn list_active(&self) -> BoxFuture<'_, Vec<TransactionMetadata>> {
        Box::pin(async { Vec::new() })
    }

    /// Roll back and close lingering states, then release resources.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Manager backed by a [`ConnectionProvider`].
pub struct DefaultTransactionManager {
    database: String,
    config: TransactionConfig,
    provider: Arc<dyn ConnectionProvider>,
    interceptors: Arc<InterceptorChain>,
    active: Arc<ActiveTransactions>,
}

impl DefaultTransactionManager {
    pub fn new(
        database: impl Into<String>,
        config: TransactionConfig,
        provider: Arc<dyn ConnectionProvider>,
        interceptors: Arc<InterceptorChain>,
    ) -> DbResult<Self> {
        config.validate()?;
        Ok(Self {
            database: database.into(),
            config,
            provider,
            interceptors,
            active: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }
}

impl TransactionManager for DefaultTransactionManager {
    fn database(&self) -> &str {
        &self.database
    }

    fn config(&self) -> &TransactionConfig {
        &self.config
    }

    fn new_transaction(
        &self,
        isolation: Option<IsolationLevel>,
        read_only: bool,
        outer: Option<Transaction>,
    ) -> BoxFuture<'_, DbResult<Transaction>> {
        Box::pin(async move {
            let top_level = outer.is_none();
            let mut builder = Transaction::builder(&self.database, Arc::clone(&self.provider))
                .config(&self.config)
                .isolation(isolation)
                .read_only(read_only)
                .outer(outer)
                .global_interceptors(Arc::clone(&self.interceptors));
            if top_level {
                builder = builder.tracker(Arc::downgrade(&self.active));
            }
            let tx = builder.build()?;

            if top_level {
                self.active
                    .write()
                    .await
                    .insert(tx.id().to_string(), tx.clone());
            }
            debug!(
                transaction_id = %tx.id(),
                database = %self.database,
                nested = !top_level,
                "New transaction state"
            );
            Ok(tx)
        })
    }

    fn list_active(&self) -> BoxFuture<'_, Vec<TransactionMetadata>> {
        Box::pin(async move {
            let active = self.active.read().await;
            active.values().map(Transaction::metadata).collect()
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let lingering: Vec<Transaction> = {
                let mut active = self.active.write().await;
                active.drain().map(|(_, tx)| tx).collect()
            }; // Lock released here

            for tx in lingering {
                warn!(
                    transaction_id = %tx.id(),
                    database = %self.database,
                    "Rolling back lingering transaction on close"
                );
                if let Err(e) = tx.rollback().await {
                    warn!(transaction_id = %tx.id(), error = %e, "Rollback failed during close");
                }
                if let Err(e) = tx.close().await {
                    warn!(transaction_id = %tx.id(), error = %e, "Close failed during close");
                }
            }
            self.provider.close().await;
        })
    }
}

/// Maps database handles to their managers.
///
/// Also owns the global interceptors, which are fixed at construction and
/// shared read-only with every transaction the registered managers create.
pub struct TransactionManagerRegistry {
    managers: RwLock<HashMap<String, Arc<dyn TransactionManager>>>,
    interceptors: Arc<InterceptorChain>,
}

impl TransactionManagerRegistry {
    pub fn new() -> Self {
        Self::with_interceptors(Vec::new())
    }

    pub fn with_interceptors(interceptors: impl IntoIterator<Item = SharedInterceptor>) -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
            interceptors: Arc::new(interceptors.into_iter().collect()),
        }
    }

    /// Process-wide registry for callers that do not inject their own.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<TransactionManagerRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TransactionManagerRegistry::new())))
    }

    pub fn global_interceptors(&self) -> Arc<InterceptorChain> {
        Arc::clone(&self.interceptors)
    }

    /// Register `manager` under its database id. The last registration wins;
    /// the replaced manager is returned.
    pub async fn register(
        &self,
        manager: Arc<dyn TransactionManager>,
    ) -> Option<Arc<dyn TransactionManager>> {
        let database = manager.database().to_string();
        let previous = self.managers.write().await.insert(database.clone(), manager);
        info!(
            database = %database,
            replaced = previous.is_some(),
            "Transaction manager registered"
        );
        previous
    }

    pub async fn manager_for(&self, database: &str) -> DbResult<Arc<dyn TransactionManager>> {
        self.managers
            .read()
            .await
            .get(database)
            .cloned()
            .ok_or_else(|| DbError::manager_not_found(database))
    }

    pub async fn contains(&self, database: &str) -> bool {
        self.managers.read().await.contains_key(database)
    }

    pub async fn databases(&self) -> Vec<String> {
        self.managers.read().await.keys().cloned().collect()
    }

    /// Remove the manager for `database` and close it. Returns false if none
    /// was registered.
    pub async fn close_and_unregister(&self, database: &str) -> bool {
        let removed = self.managers.write().await.remove(database);
        match removed {
            Some(manager) => {
                manager.close().await;
                info!(database = %database, "Transaction manager closed");
                true
            }
            None => false,
        }
    }
}

impl Default for TransactionManagerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
