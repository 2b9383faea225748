//! Transaction state for a single attempt.
//!
//! A [`Transaction`] is a cheap cloneable handle. The executor creates one per
//! attempt and hands clones to the user block; the connection behind it is
//! acquired lazily on the first statement and is owned by this state (or, for
//! a nested state, by its outermost ancestor) until [`Transaction::close`].

use crate::config::TransactionConfig;
use crate::db::{Connection, ConnectionProvider};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, QueryParam, Row, TransactionMetadata, TransactionStatus};
use crate::transaction::interceptor::{
    self, HookContext, InterceptorChain, LifecycleEvent, SharedInterceptor,
};
use crate::transaction::manager::ActiveTransactions;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Retry bounds of a transaction and the interval derived from them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransactionConfig) -> Self {
        Self {
            max_attempts: config.default_max_attempts,
            min_retry_delay: Duration::from_millis(config.default_min_retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.default_max_retry_delay_ms),
        }
    }

    /// Constant pause between attempts:
    /// `max((max_delay - min_delay) / (max_attempts + 1), 1ms)`.
    pub fn retry_interval(&self) -> Duration {
        let spread = self
            .max_retry_delay
            .saturating_sub(self.min_retry_delay)
            .as_millis() as u64;
        let interval = spread / (u64::from(self.max_attempts) + 1);
        Duration::from_millis(interval.max(1))
    }
}

/// Connection shared by a top-level state and all states nested in it.
#[derive(Default)]
pub(crate) struct ConnectionSlot {
    conn: Option<Box<dyn Connection>>,
    /// Incremented every time the top-level state begins a database transaction
    generation: u64,
}

type SharedSlot = Arc<tokio::sync::Mutex<ConnectionSlot>>;

/// Mutable bookkeeping. Never held across an await point.
struct Settings {
    status: TransactionStatus,
    retry: RetryPolicy,
    statement_count: u64,
    total_duration: Duration,
    open_result_sets: usize,
    last_statement: Option<String>,
    interceptors: InterceptorChain,
    user_data: HashMap<String, JsonValue>,
    /// Slot generation the savepoint was created in (nested states only)
    savepoint_generation: Option<u64>,
}

struct Inner {
    id: String,
    database: String,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    started_at: DateTime<Utc>,
    created: Instant,
    outer: Option<Transaction>,
    savepoint: Option<String>,
    provider: Arc<dyn ConnectionProvider>,
    slot: SharedSlot,
    global_interceptors: Arc<InterceptorChain>,
    statement_timeout: Option<Duration>,
    warn_long_queries: Option<Duration>,
    tracker: Option<Weak<ActiveTransactions>>,
    settings: Mutex<Settings>,
}

/// Handle to the state of one transaction attempt.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

enum StatementKind {
    Execute,
    Fetch,
}

enum StatementOutput {
    Affected(u64),
    Rows(Vec<Row>),
}

/// Builder for [`Transaction`]; used by transaction managers.
pub struct TransactionBuilder {
    database: String,
    provider: Arc<dyn ConnectionProvider>,
    config: TransactionConfig,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    outer: Option<Transaction>,
    global_interceptors: Arc<InterceptorChain>,
    tracker: Option<Weak<ActiveTransactions>>,
}

impl TransactionBuilder {
    /// Take retry bounds, statement timeout and slow-statement threshold from `config`.
    pub fn config(mut self, config: &TransactionConfig) -> Self {
        self.config = config.clone();
        self
    }

    pub fn isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Nest the new state inside `outer`; it will use a savepoint on the outer connection.
    pub fn outer(mut self, outer: Option<Transaction>) -> Self {
        self.outer = outer;
        self
    }

    pub fn global_interceptors(mut self, interceptors: Arc<InterceptorChain>) -> Self {
        self.global_interceptors = interceptors;
        self
    }

    pub(crate) fn tracker(mut self, tracker: Weak<ActiveTransactions>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn build(self) -> DbResult<Transaction> {
        self.config.validate()?;
        let id = generate_transaction_id();
        let (slot, savepoint, provider) = match &self.outer {
            Some(outer) => (
                Arc::clone(&outer.inner.slot),
                Some(format!("sp_{}", &id[3..19])),
                Arc::clone(&outer.inner.provider),
            ),
            None => (SharedSlot::default(), None, self.provider),
        };

        Ok(Transaction {
            inner: Arc::new(Inner {
                id,
                database: self.database,
                isolation: self.isolation,
                read_only: self.read_only,
                started_at: Utc::now(),
                created: Instant::now(),
                outer: self.outer,
                savepoint,
                provider,
                slot,
                global_interceptors: self.global_interceptors,
                statement_timeout: self.config.statement_timeout(),
                warn_long_queries: self.config.warn_long_queries_duration(),
                tracker: self.tracker,
                settings: Mutex::new(Settings {
                    status: TransactionStatus::NotStarted,
                    retry: RetryPolicy::from_config(&self.config),
                    statement_count: 0,
                    total_duration: Duration::ZERO,
                    open_result_sets: 0,
                    last_statement: None,
                    interceptors: InterceptorChain::new(),
                    user_data: HashMap::new(),
                    savepoint_generation: None,
                }),
            }),
        })
    }
}

impl Transaction {
    pub fn builder(
        database: impl Into<String>,
        provider: Arc<dyn ConnectionProvider>,
    ) -> TransactionBuilder {
        TransactionBuilder {
            database: database.into(),
            provider,
            config: TransactionConfig::default(),
            isolation: None,
            read_only: false,
            outer: None,
            global_interceptors: Arc::new(InterceptorChain::new()),
            tracker: None,
        }
    }

    fn settings(&self) -> MutexGuard<'_, Settings> {
        self.inner
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn database(&self) -> &str {
        &self.inner.database
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.inner.isolation
    }

    pub fn read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn outer(&self) -> Option<&Transaction> {
        self.inner.outer.as_ref()
    }

    /// The outermost state this one is nested in, or itself.
    pub fn root(&self) -> &Transaction {
        let mut current = self;
        while let Some(outer) = current.outer() {
            current = outer;
        }
        current
    }

    pub fn is_nested(&self) -> bool {
        self.inner.outer.is_some()
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.inner.savepoint.as_deref()
    }

    pub fn status(&self) -> TransactionStatus {
        self.settings().status
    }

    pub fn is_same(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -------------------------------------------------------------------------
    // Retry settings
    // -------------------------------------------------------------------------

    pub fn max_attempts(&self) -> u32 {
        self.settings().retry.max_attempts
    }

    /// Override the attempt budget for the running `transaction` call.
    pub fn set_max_attempts(&self, max_attempts: u32) -> DbResult<()> {
        if max_attempts == 0 {
            return Err(DbError::invalid_input(format!(
                "max_attempts must be greater than 0, got {max_attempts}"
            )));
        }
        self.settings().retry.max_attempts = max_attempts;
        Ok(())
    }

    pub fn min_retry_delay(&self) -> Duration {
        self.settings().retry.min_retry_delay
    }

    pub fn set_min_retry_delay(&self, delay: Duration) {
        self.settings().retry.min_retry_delay = delay;
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.settings().retry.max_retry_delay
    }

    pub fn set_max_retry_delay(&self, delay: Duration) {
        self.settings().retry.max_retry_delay = delay;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.settings().retry
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_policy().retry_interval()
    }

    // -------------------------------------------------------------------------
    // Interceptors and user data
    // -------------------------------------------------------------------------

    pub fn register_interceptor(&self, interceptor: SharedInterceptor) -> bool {
        self.settings().interceptors.register(interceptor)
    }

    pub fn unregister_interceptor(&self, interceptor: &SharedInterceptor) -> bool {
        self.settings().interceptors.unregister(interceptor)
    }

    pub fn user_data(&self, key: &str) -> Option<JsonValue> {
        self.settings().user_data.get(key).cloned()
    }

    pub fn insert_user_data(&self, key: impl Into<String>, value: JsonValue) -> Option<JsonValue> {
        self.settings().user_data.insert(key.into(), value)
    }

    pub fn remove_user_data(&self, key: &str) -> Option<JsonValue> {
        self.settings().user_data.remove(key)
    }

    // -------------------------------------------------------------------------
    // Statistics
    // -------------------------------------------------------------------------

    pub fn statement_count(&self) -> u64 {
        self.settings().statement_count
    }

    /// Time spent executing statements.
    pub fn statements_duration(&self) -> Duration {
        self.settings().total_duration
    }

    pub fn open_result_sets(&self) -> usize {
        self.settings().open_result_sets
    }

    pub fn last_statement(&self) -> Option<String> {
        self.settings().last_statement.clone()
    }

    pub fn metadata(&self) -> TransactionMetadata {
        let settings = self.settings();
        TransactionMetadata {
            transaction_id: self.inner.id.clone(),
            database: self.inner.database.clone(),
            started_at: self.inner.started_at,
            duration_ms: self.inner.created.elapsed().as_millis() as u64,
            statement_count: settings.statement_count,
            status: settings.status,
            nested: self.is_nested(),
        }
    }

    // -------------------------------------------------------------------------
    // Statements
    // -------------------------------------------------------------------------

    /// Execute a statement and return the number of affected rows.
    pub async fn exec(&self, sql: &str) -> DbResult<u64> {
        self.exec_with(sql, &[]).await
    }

    pub async fn exec_with(&self, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
        match self.run_statement(sql, params, StatementKind::Execute).await? {
            StatementOutput::Affected(n) => Ok(n),
            StatementOutput::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    pub async fn fetch_all(&self, sql: &str) -> DbResult<Vec<Row>> {
        self.fetch_all_with(sql, &[]).await
    }

    pub async fn fetch_all_with(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        match self.run_statement(sql, params, StatementKind::Fetch).await? {
            StatementOutput::Rows(rows) => Ok(rows),
            StatementOutput::Affected(_) => Ok(Vec::new()),
        }
    }

    /// Fetch the first column of the first row as an integer.
    pub async fn fetch_one_i64(&self, sql: &str) -> DbResult<i64> {
        let rows = self.fetch_all(sql).await?;
        rows.first()
            .and_then(|row| row.values().next())
            .and_then(JsonValue::as_i64)
            .ok_or_else(|| {
                DbError::database(
                    "Query did not return an integer",
                    None,
                    "Check that the query selects a single integer column",
                )
                .with_statement(sql)
            })
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.status().is_closed() {
            return Err(DbError::transaction(
                "Transaction is closed",
                self.inner.id.clone(),
            ));
        }
        Ok(())
    }

    async fn run_statement(
        &self,
        sql: &str,
        params: &[QueryParam],
        kind: StatementKind,
    ) -> DbResult<StatementOutput> {
        self.ensure_open()?;
        let mut slot = self.inner.slot.lock().await;
        self.begin_if_needed(&mut slot).await?;

        {
            let mut settings = self.settings();
            settings.statement_count += 1;
            settings.last_statement = Some(sql.to_string());
            if matches!(kind, StatementKind::Fetch) {
                settings.open_result_sets += 1;
            }
        }

        let conn = slot.conn.as_mut().ok_or_else(|| {
            DbError::transaction("Connection is not available", self.inner.id.clone())
        })?;
        let started = Instant::now();
        let work = async {
            match kind {
                StatementKind::Execute => conn.execute(sql, params).await.map(StatementOutput::Affected),
                StatementKind::Fetch => conn.fetch_all(sql, params).await.map(StatementOutput::Rows),
            }
        };
        let result = match self.inner.statement_timeout {
            Some(limit) => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(
                    truncate_statement(sql),
                    limit.as_millis() as u64,
                )),
            },
            None => work.await,
        };
        let elapsed = started.elapsed();

        {
            let mut settings = self.settings();
            settings.total_duration += elapsed;
            if let StatementKind::Fetch = kind {
                settings.open_result_sets = settings.open_result_sets.saturating_sub(1);
            }
        }

        if let Some(threshold) = self.inner.warn_long_queries {
            if elapsed > threshold {
                warn!(
                    transaction_id = %self.inner.id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    threshold_ms = threshold.as_millis() as u64,
                    statement = %truncate_statement(sql),
                    "Long query"
                );
            }
        }

        result
    }

    /// True while this state's database transaction or savepoint is open.
    fn is_db_active(&self, slot: &ConnectionSlot) -> bool {
        let (status, generation) = {
            let settings = self.settings();
            (settings.status, settings.savepoint_generation)
        };
        if status != TransactionStatus::Active {
            return false;
        }
        match &self.inner.outer {
            // Ending an ancestor discards the savepoint
            Some(outer) => generation == Some(slot.generation) && outer.is_db_active(slot),
            None => true,
        }
    }

    fn set_status(&self, status: TransactionStatus) {
        self.settings().status = status;
    }

    /// Open the database transaction (or savepoint) if this state has none.
    fn begin_if_needed<'a>(
        &'a self,
        slot: &'a mut ConnectionSlot,
    ) -> BoxFuture<'a, DbResult<()>> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.is_db_active(slot) {
                return Ok(());
            }

            match (&self.inner.outer, &self.inner.savepoint) {
                (Some(outer), Some(name)) => {
                    outer.begin_if_needed(slot).await?;
                    let conn = slot.conn.as_mut().ok_or_else(|| {
                        DbError::transaction("Connection is not available", self.inner.id.clone())
                    })?;
                    conn.savepoint(name).await?;
                    let generation = slot.generation;
                    let mut settings = self.settings();
                    settings.savepoint_generation = Some(generation);
                    settings.status = TransactionStatus::Active;
                    debug!(transaction_id = %self.inner.id, savepoint = %name, "Savepoint created");
                }
                _ => {
                    if slot.conn.is_none() {
                        slot.conn = Some(self.inner.provider.create().await?);
                    }
                    let conn = slot.conn.as_mut().ok_or_else(|| {
                        DbError::transaction("Connection is not available", self.inner.id.clone())
                    })?;
                    conn.begin(self.inner.isolation, self.inner.read_only)
                        .await?;
                    slot.generation += 1;
                    self.set_status(TransactionStatus::Active);
                    debug!(
                        transaction_id = %self.inner.id,
                        isolation = ?self.inner.isolation,
                        read_only = self.inner.read_only,
                        "Transaction started"
                    );
                }
            }
            Ok(())
        })
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    fn fire(&self, event: LifecycleEvent) -> DbResult<()> {
        let (local, mut user_data) = {
            let mut settings = self.settings();
            (
                settings.interceptors.clone(),
                std::mem::take(&mut settings.user_data),
            )
        };
        let mut ctx = HookContext {
            transaction_id: &self.inner.id,
            database: &self.inner.database,
            nested: self.is_nested(),
            user_data: &mut user_data,
        };
        let result = interceptor::dispatch(
            event,
            &self.inner.global_interceptors,
            &local,
            &mut ctx,
        );
        let mut settings = self.settings();
        // Entries written through the handle while hooks ran win
        user_data.extend(settings.user_data.drain());
        settings.user_data = user_data;
        result
    }

    /// Commit this state.
    ///
    /// A nested state releases its savepoint; the enclosing transaction stays
    /// open. After an explicit rollback with no new work, this is a no-op.
    pub async fn commit(&self) -> DbResult<()> {
        self.ensure_open()?;
        if self.status() == TransactionStatus::RolledBack {
            debug!(transaction_id = %self.inner.id, "Commit skipped after rollback");
            return Ok(());
        }

        self.fire(LifecycleEvent::BeforeCommit)?;
        {
            let mut slot = self.inner.slot.lock().await;
            if self.is_db_active(&slot) {
                let conn = slot.conn.as_mut().ok_or_else(|| {
                    DbError::transaction("Connection is not available", self.inner.id.clone())
                })?;
                match &self.inner.savepoint {
                    Some(name) => conn.release_savepoint(name).await?,
                    None => conn.commit().await?,
                }
            }
            self.set_status(TransactionStatus::Committed);
        }
        self.fire(LifecycleEvent::AfterCommit)?;

        let keep = {
            let local = self.settings().interceptors.clone();
            interceptor::kept_keys(&self.inner.global_interceptors, &local)
        };
        self.settings().user_data.retain(|key, _| keep.contains(key));
        debug!(transaction_id = %self.inner.id, "Transaction committed");
        Ok(())
    }

    /// Roll back this state.
    ///
    /// A nested state rolls back to its savepoint; work done by enclosing
    /// states before the savepoint is kept.
    pub async fn rollback(&self) -> DbResult<()> {
        self.ensure_open()?;
        if self.status() == TransactionStatus::RolledBack {
            return Ok(());
        }

        self.fire(LifecycleEvent::BeforeRollback)?;
        {
            let mut slot = self.inner.slot.lock().await;
            if self.is_db_active(&slot) {
                let conn = slot.conn.as_mut().ok_or_else(|| {
                    DbError::transaction("Connection is not available", self.inner.id.clone())
                })?;
                match &self.inner.savepoint {
                    Some(name) => {
                        conn.rollback_to_savepoint(name).await?;
                        conn.release_savepoint(name).await?;
                    }
                    None => conn.rollback().await?,
                }
            }
            self.set_status(TransactionStatus::RolledBack);
        }
        self.fire(LifecycleEvent::AfterRollback)?;

        self.settings().user_data.clear();
        debug!(transaction_id = %self.inner.id, "Transaction rolled back");
        Ok(())
    }

    /// Release this state. Top-level states close their connection; an open
    /// database transaction is rolled back by the connection first.
    ///
    /// The state cannot run statements afterwards. Closing twice is a no-op.
    pub async fn close(&self) -> DbResult<()> {
        {
            let mut settings = self.settings();
            if settings.status.is_closed() {
                return Ok(());
            }
            settings.status = TransactionStatus::Closed;
        }

        if let Some(tracker) = self.inner.tracker.as_ref().and_then(Weak::upgrade) {
            tracker.write().await.remove(&self.inner.id);
        }

        if self.is_nested() {
            return Ok(());
        }

        let conn = self.inner.slot.lock().await.conn.take();
        debug!(transaction_id = %self.inner.id, "Transaction closed");
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// Close without awaiting, for when no runtime can drive [`close`](Self::close).
    ///
    /// The connection is dropped in place instead of being rolled back.
    pub(crate) fn abandon(&self) {
        {
            let mut settings = self.settings();
            if settings.status.is_closed() {
                return;
            }
            settings.status = TransactionStatus::Closed;
        }

        if let Some(tracker) = self.inner.tracker.as_ref().and_then(Weak::upgrade) {
            match tracker.try_write() {
                Ok(mut active) => {
                    active.remove(&self.inner.id);
                }
                Err(_) => warn!(
                    transaction_id = %self.inner.id,
                    "Active transaction list is locked; entry not removed"
                ),
            }
        }

        if !self.is_nested() {
            if let Ok(mut slot) = self.inner.slot.try_lock() {
                drop(slot.conn.take());
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("database", &self.inner.database)
            .field("isolation", &self.inner.isolation)
            .field("read_only", &self.inner.read_only)
            .field("nested", &self.is_nested())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

const MAX_LOGGED_STATEMENT_CHARS: usize = 256;

/// Shorten a statement for logging, respecting char boundaries.
pub(crate) fn truncate_statement(sql: &str) -> String {
    match sql.char_indices().nth(MAX_LOGGED_STATEMENT_CHARS) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}
