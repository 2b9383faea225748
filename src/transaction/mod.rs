//! Transaction core.
//!
//! - `state`: per-attempt transaction state and its lifecycle
//! - `executor`: the retry loop and nested execution
//! - `manager`: managers and the database-to-manager registry
//! - `interceptor`: commit/rollback hooks
//! - `context`: the ambient current-transaction binding
//! - `blocking`: synchronous facade over the async core

pub mod blocking;
pub mod context;
pub mod executor;
pub mod interceptor;
pub mod manager;
pub mod state;

pub use blocking::{BlockingDatabase, BlockingTransaction};
pub use executor::run_transactional;
pub use interceptor::{
    FnInterceptor, HookContext, InterceptorChain, LifecycleEvent, SharedInterceptor,
    TransactionInterceptor,
};
pub use manager::{DefaultTransactionManager, TransactionManager, TransactionManagerRegistry};
pub use state::{RetryPolicy, Transaction, TransactionBuilder};
