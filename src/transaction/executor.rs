//! The retry executor.
//!
//! [`run_transactional`] runs a block inside a transaction and retries the
//! whole attempt on transient failures. Each attempt gets a fresh state from
//! the manager, ends in exactly one commit or rollback, and closes its state
//! whatever happens. Only the triggering error of the last attempt reaches
//! the caller; rollback and close failures during cleanup are logged.

use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, TransactionStatus};
use crate::transaction::context;
use crate::transaction::manager::TransactionManager;
use crate::transaction::state::{Transaction, truncate_statement};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Run `block` in a transaction managed by `manager`.
///
/// The outer transaction is `outer_override` if given, else the innermost
/// transaction of the same database bound to the calling context. With an
/// outer transaction the block runs nested in it and is never retried on its
/// own; otherwise it runs top-level with up to `max_attempts` attempts.
pub async fn run_transactional<'a, T, F>(
    manager: Arc<dyn TransactionManager>,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    outer_override: Option<Transaction>,
    block: F,
) -> DbResult<T>
where
    F: FnMut(Transaction) -> BoxFuture<'a, DbResult<T>> + Send + 'a,
    T: Send + 'a,
{
    let outer = outer_override.or_else(|| context::current_for(manager.database()));
    match outer {
        Some(outer) => run_nested(manager.as_ref(), isolation, read_only, outer, block).await,
        None => run_with_retry(manager.as_ref(), isolation, read_only, block).await,
    }
}

async fn run_with_retry<'a, T, F>(
    manager: &dyn TransactionManager,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    mut block: F,
) -> DbResult<T>
where
    F: FnMut(Transaction) -> BoxFuture<'a, DbResult<T>> + Send + 'a,
    T: Send + 'a,
{
    let mut attempt: u32 = 1;
    loop {
        let started = Instant::now();
        let tx = manager.new_transaction(isolation, read_only, None).await?;
        let mut guard = AttemptGuard::new(tx.clone());

        let outcome = async {
            let value = context::scope(tx.clone(), block(tx.clone())).await?;
            tx.commit().await?;
            Ok::<T, DbError>(value)
        }
        .await;

        match outcome {
            Ok(value) => {
                if let Err(e) = tx.close().await {
                    warn!(transaction_id = %tx.id(), error = %e, "Close failed after commit");
                }
                guard.disarm();
                debug!(
                    transaction_id = %tx.id(),
                    attempt,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Transaction completed"
                );
                return Ok(value);
            }
            Err(err) => {
                // Read after the block ran; it may have changed the budget
                let max_attempts = tx.max_attempts();
                let retry = err.is_retryable() && attempt < max_attempts;
                let interval = tx.retry_interval();

                rollback_quietly(&tx).await;
                close_quietly(&tx).await;
                guard.disarm();

                let statement = tx
                    .last_statement()
                    .map(|sql| truncate_statement(&sql))
                    .unwrap_or_default();
                warn!(
                    transaction_id = %tx.id(),
                    attempt,
                    max_attempts,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    statement = %statement,
                    error = %err,
                    retrying = retry,
                    "Transaction attempt failed"
                );

                if !retry {
                    return Err(err);
                }
                tokio::time::sleep(interval).await;
                attempt += 1;
            }
        }
    }
}

async fn run_nested<'a, T, F>(
    manager: &dyn TransactionManager,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    outer: Transaction,
    mut block: F,
) -> DbResult<T>
where
    F: FnMut(Transaction) -> BoxFuture<'a, DbResult<T>> + Send + 'a,
    T: Send + 'a,
{
    if !manager.config().use_nested_transactions {
        // Same state, same connection: nothing to commit or release here.
        // An outer already bound in this context is not pushed a second time.
        let bound = context::current_for(outer.database()).is_some_and(|tx| tx.is_same(&outer));
        let result = if bound {
            block(outer.clone()).await
        } else {
            context::scope(outer.clone(), block(outer.clone())).await
        };
        if let Err(err) = &result {
            if err.is_driver_error() {
                rollback_quietly(outer.root()).await;
            }
        }
        return result;
    }

    let inner = manager
        .new_transaction(isolation, read_only, Some(outer.clone()))
        .await?;
    let result = async {
        let value = context::scope(inner.clone(), block(inner.clone())).await?;
        inner.commit().await?;
        Ok::<T, DbError>(value)
    }
    .await;

    if let Err(err) = &result {
        if err.is_driver_error() {
            // A driver failure abandons the whole enclosing transaction
            debug!(
                transaction_id = %inner.id(),
                error = %err,
                "Driver error in nested transaction; rolling back outermost transaction"
            );
            rollback_quietly(outer.root()).await;
        } else {
            rollback_quietly(&inner).await;
        }
    }
    close_quietly(&inner).await;
    result
}

async fn rollback_quietly(tx: &Transaction) {
    if tx.status() == TransactionStatus::RolledBack {
        return;
    }
    if let Err(e) = tx.rollback().await {
        warn!(transaction_id = %tx.id(), error = %e, "Rollback failed");
    }
}

async fn close_quietly(tx: &Transaction) {
    if let Err(e) = tx.close().await {
        warn!(transaction_id = %tx.id(), error = %e, "Close failed");
    }
}

/// Cleans up an attempt whose future was dropped before it finished.
struct AttemptGuard {
    tx: Option<Transaction>,
}

impl AttemptGuard {
    fn new(tx: Transaction) -> Self {
        Self { tx: Some(tx) }
    }

    fn disarm(&mut self) {
        self.tx = None;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(transaction_id = %tx.id(), "Attempt cancelled; scheduling cleanup");
                handle.spawn(async move {
                    rollback_quietly(&tx).await;
                    close_quietly(&tx).await;
                });
            }
            Err(_) => {
                warn!(
                    transaction_id = %tx.id(),
                    "Attempt cancelled outside a runtime; connection dropped without rollback"
                );
                tx.abandon();
            }
        }
    }
}
