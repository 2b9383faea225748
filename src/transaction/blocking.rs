//! Synchronous facade.
//!
//! [`BlockingDatabase`] owns a multi-threaded tokio runtime and runs each
//! transactional block on the runtime's blocking pool, so ordinary threaded
//! code gets the same retry loop, nesting and hooks as async callers. Inside
//! a block, the transaction is bound to the worker thread; a nested
//! [`BlockingDatabase::transaction`] call from that thread joins it.

use crate::config::DatabaseUrl;
use crate::database::{Database, TransactionOptions};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Row, TransactionStatus};
use crate::transaction::context;
use crate::transaction::interceptor::SharedInterceptor;
use crate::transaction::manager::TransactionManagerRegistry;
use crate::transaction::state::Transaction;
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::{Handle, Runtime};

/// Blocking handle to a [`Database`].
///
/// Must not be used from inside an async context; use [`Database`] there.
#[derive(Clone)]
pub struct BlockingDatabase {
    runtime: Arc<Runtime>,
    db: Database,
}

impl BlockingDatabase {
    /// Connect using a `[id=]url` string, registering in the process-wide registry.
    pub fn connect(url: &str) -> DbResult<Self> {
        let parsed = DatabaseUrl::parse(url).map_err(DbError::invalid_input)?;
        Self::connect_with(parsed, TransactionManagerRegistry::global())
    }

    pub fn connect_with(
        url: DatabaseUrl,
        registry: Arc<TransactionManagerRegistry>,
    ) -> DbResult<Self> {
        let runtime = build_runtime()?;
        let db = runtime.block_on(Database::connect_with(url, registry))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            db,
        })
    }

    /// Wrap an existing handle. `db` must have been connected on `runtime`.
    pub fn from_parts(runtime: Runtime, db: Database) -> Self {
        Self {
            runtime: Arc::new(runtime),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Run `block` in a transaction with the database defaults.
    pub fn transaction<T, F>(&self, block: F) -> DbResult<T>
    where
        F: FnMut(&BlockingTransaction) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        self.transaction_with(TransactionOptions::default(), block)
    }

    pub fn transaction_with<T, F>(&self, options: TransactionOptions, block: F) -> DbResult<T>
    where
        F: FnMut(&BlockingTransaction) -> DbResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let block = Arc::new(Mutex::new(block));
        let handle = self.handle().clone();
        self.handle()
            .block_on(self.db.transaction_with(options, move |tx| {
                let block = Arc::clone(&block);
                let handle = handle.clone();
                Box::pin(async move {
                    let joined = tokio::task::spawn_blocking(move || {
                        let blocking = BlockingTransaction {
                            tx: tx.clone(),
                            handle,
                        };
                        context::with_blocking_binding(tx, || {
                            let mut block = block.lock().unwrap_or_else(PoisonError::into_inner);
                            block(&blocking)
                        })
                    })
                    .await;
                    match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                        Err(e) => Err(DbError::internal(format!(
                            "Transaction block did not complete: {e}"
                        ))),
                    }
                })
            }))
    }

    pub fn close(&self) -> DbResult<()> {
        self.handle().block_on(self.db.close())
    }
}

impl std::fmt::Debug for BlockingDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingDatabase")
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

fn build_runtime() -> DbResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dbtx-blocking")
        .build()
        .map_err(|e| DbError::internal(format!("Failed to start runtime: {e}")))
}

/// Transaction handle passed to synchronous blocks.
pub struct BlockingTransaction {
    tx: Transaction,
    handle: Handle,
}

impl BlockingTransaction {
    /// The underlying async handle.
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    pub fn id(&self) -> &str {
        self.tx.id()
    }

    pub fn status(&self) -> TransactionStatus {
        self.tx.status()
    }

    pub fn exec(&self, sql: &str) -> DbResult<u64> {
        self.handle.block_on(self.tx.exec(sql))
    }

    pub fn exec_with(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        self.handle.block_on(self.tx.exec_with(sql, params))
    }

    pub fn fetch_all(&self, sql: &str) -> DbResult<Vec<Row>> {
        self.handle.block_on(self.tx.fetch_all(sql))
    }

    pub fn fetch_all_with(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        self.handle.block_on(self.tx.fetch_all_with(sql, params))
    }

    pub fn fetch_one_i64(&self, sql: &str) -> DbResult<i64> {
        self.handle.block_on(self.tx.fetch_one_i64(sql))
    }

    pub fn commit(&self) -> DbResult<()> {
        self.handle.block_on(self.tx.commit())
    }

    pub fn rollback(&self) -> DbResult<()> {
        self.handle.block_on(self.tx.rollback())
    }

    pub fn max_attempts(&self) -> u32 {
        self.tx.max_attempts()
    }

    pub fn set_max_attempts(&self, max_attempts: u32) -> DbResult<()> {
        self.tx.set_max_attempts(max_attempts)
    }

    pub fn register_interceptor(&self, interceptor: SharedInterceptor) -> bool {
        self.tx.register_interceptor(interceptor)
    }

    pub fn unregister_interceptor(&self, interceptor: &SharedInterceptor) -> bool {
        self.tx.unregister_interceptor(interceptor)
    }

    pub fn user_data(&self, key: &str) -> Option<JsonValue> {
        self.tx.user_data(key)
    }

    pub fn insert_user_data(&self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.tx.insert_user_data(key, value)
    }
}
