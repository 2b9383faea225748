//! Lifecycle interceptors.
//!
//! Interceptors observe commit and rollback. Global interceptors are fixed when
//! the [`TransactionManagerRegistry`](super::TransactionManagerRegistry) is
//! built; per-transaction interceptors are registered on a live
//! [`Transaction`](super::Transaction). For every event, globals run first,
//! then per-transaction ones, each in registration order.

use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Points in a transaction's lifecycle at which interceptors run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforeCommit => "before_commit",
            Self::AfterCommit => "after_commit",
            Self::BeforeRollback => "before_rollback",
            Self::AfterRollback => "after_rollback",
        })
    }
}

/// What an interceptor sees of the transaction it is observing.
#[derive(Debug)]
pub struct HookContext<'a> {
    pub transaction_id: &'a str,
    pub database: &'a str,
    /// True for savepoint-backed nested transactions
    pub nested: bool,
    pub user_data: &'a mut HashMap<String, JsonValue>,
}

/// Observer of transaction lifecycle events.
///
/// Returning an error from `on_event` fails the commit or rollback that
/// triggered it.
pub trait TransactionInterceptor: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn on_event(&self, event: LifecycleEvent, ctx: &mut HookContext<'_>) -> DbResult<()>;

    /// User-data keys that survive the clear that follows a commit.
    fn keep_user_data_on_commit(&self) -> Vec<String> {
        Vec::new()
    }
}

pub type SharedInterceptor = Arc<dyn TransactionInterceptor>;

/// Interceptor built from a closure.
pub struct FnInterceptor<F> {
    name: String,
    f: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(LifecycleEvent, &mut HookContext<'_>) -> DbResult<()> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }

    pub fn shared(name: impl Into<String>, f: F) -> SharedInterceptor {
        Arc::new(Self::new(name, f))
    }
}

impl<F> TransactionInterceptor for FnInterceptor<F>
where
    F: Fn(LifecycleEvent, &mut HookContext<'_>) -> DbResult<()> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_event(&self, event: LifecycleEvent, ctx: &mut HookContext<'_>) -> DbResult<()> {
        (self.f)(event, ctx)
    }
}

fn same_interceptor(a: &SharedInterceptor, b: &SharedInterceptor) -> bool {
    // Compare data addresses only; vtable pointers are not unique
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Ordered interceptor list with set semantics.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    items: Vec<SharedInterceptor>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor. Returns false if it is already registered.
    pub fn register(&mut self, interceptor: SharedInterceptor) -> bool {
        if self.contains(&interceptor) {
            return false;
        }
        self.items.push(interceptor);
        true
    }

    /// Remove an interceptor. Returns false if it was not registered.
    pub fn unregister(&mut self, interceptor: &SharedInterceptor) -> bool {
        let before = self.items.len();
        self.items.retain(|i| !same_interceptor(i, interceptor));
        self.items.len() != before
    }

    pub fn contains(&self, interceptor: &SharedInterceptor) -> bool {
        self.items.iter().any(|i| same_interceptor(i, interceptor))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedInterceptor> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.items.iter().map(|i| i.name()))
            .finish()
    }
}

impl FromIterator<SharedInterceptor> for InterceptorChain {
    fn from_iter<I: IntoIterator<Item = SharedInterceptor>>(iter: I) -> Self {
        let mut chain = Self::new();
        for interceptor in iter {
            chain.register(interceptor);
        }
        chain
    }
}

/// Run `event` through the global chain, then the local one.
///
/// The first failing interceptor stops the dispatch. Driver errors pass
/// through unchanged so they keep their retry class, as if the commit or
/// rollback itself had failed. Other errors that are not already interceptor
/// or application errors are wrapped with the interceptor's name.
pub(crate) fn dispatch(
    event: LifecycleEvent,
    global: &InterceptorChain,
    local: &InterceptorChain,
    ctx: &mut HookContext<'_>,
) -> DbResult<()> {
    for interceptor in global.iter().chain(local.iter()) {
        interceptor.on_event(event, ctx).map_err(|err| {
            warn!(
                interceptor = %interceptor.name(),
                event = %event,
                transaction_id = %ctx.transaction_id,
                error = %err,
                "Interceptor failed"
            );
            match err {
                DbError::Interceptor { .. } | DbError::Application(_) => err,
                err if err.is_driver_error() => err,
                other => DbError::interceptor(interceptor.name(), event, other.to_string()),
            }
        })?;
    }
    Ok(())
}

/// Keys preserved across the post-commit user-data clear.
pub(crate) fn kept_keys(global: &InterceptorChain, local: &InterceptorChain) -> HashSet<String> {
    global
        .iter()
        .chain(local.iter())
        .flat_map(|i| i.keep_user_data_on_commit())
        .collect()
}
