//! Ambient "current transaction" binding.
//!
//! Async code carries an immutable stack of transactions in a tokio
//! task-local, so the binding follows the task across worker threads, is not
//! inherited by spawned tasks and disappears when the scope ends. Synchronous
//! blocks run by [`BlockingDatabase`](super::BlockingDatabase) use a
//! thread-local stack instead.

use crate::error::{DbError, DbResult};
use crate::transaction::state::Transaction;
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT: Arc<Vec<Transaction>>;
}

thread_local! {
    static BLOCKING_CURRENT: RefCell<Vec<Transaction>> = const { RefCell::new(Vec::new()) };
}

fn task_stack() -> Option<Arc<Vec<Transaction>>> {
    CURRENT.try_with(Arc::clone).ok()
}

/// Run `fut` with `tx` bound as the current transaction.
pub async fn scope<F: Future>(tx: Transaction, fut: F) -> F::Output {
    let mut stack = task_stack()
        .map(|s| s.as_ref().clone())
        .unwrap_or_default();
    stack.push(tx);
    CURRENT.scope(Arc::new(stack), fut).await
}

/// The innermost transaction bound to this task or thread.
pub fn current_or_none() -> Option<Transaction> {
    if let Some(stack) = task_stack() {
        if let Some(tx) = stack.last() {
            return Some(tx.clone());
        }
    }
    BLOCKING_CURRENT.with(|stack| stack.borrow().last().cloned())
}

/// Like [`current_or_none`], failing when nothing is bound.
pub fn current() -> DbResult<Transaction> {
    current_or_none().ok_or(DbError::NoCurrentTransaction)
}

/// The innermost bound transaction belonging to `database`.
pub fn current_for(database: &str) -> Option<Transaction> {
    if let Some(stack) = task_stack() {
        if let Some(tx) = stack.iter().rev().find(|tx| tx.database() == database) {
            return Some(tx.clone());
        }
    }
    BLOCKING_CURRENT.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|tx| tx.database() == database)
            .cloned()
    })
}

/// Number of transactions bound to this task or thread.
pub fn depth() -> usize {
    let task_depth = task_stack().map(|s| s.len()).unwrap_or(0);
    task_depth + BLOCKING_CURRENT.with(|stack| stack.borrow().len())
}

/// Pops the thread-local binding even if the block panics.
struct BlockingBinding;

impl Drop for BlockingBinding {
    fn drop(&mut self) {
        BLOCKING_CURRENT.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run synchronous `f` with `tx` bound in this thread.
pub(crate) fn with_blocking_binding<R>(tx: Transaction, f: impl FnOnce() -> R) -> R {
    BLOCKING_CURRENT.with(|stack| stack.borrow_mut().push(tx));
    let _binding = BlockingBinding;
    f()
}
