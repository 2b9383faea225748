//! Shared test helpers: a scripted connection provider that counts every
//! call, and SQLite fixtures.

#![allow(dead_code)]

use dbtx::config::{DatabaseUrl, TransactionConfig};
use dbtx::database::Database;
use dbtx::db::{Connection, ConnectionProvider, ProviderMetadata};
use dbtx::error::{DbError, DbResult};
use dbtx::models::{IsolationLevel, QueryParam, Row};
use dbtx::transaction::TransactionManagerRegistry;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Call counts observed by a [`MockProvider`].
#[derive(Default)]
pub struct Counters {
    pub creates: AtomicUsize,
    pub begins: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub closes: AtomicUsize,
    pub statements: AtomicUsize,
    pub savepoints: AtomicUsize,
    pub releases: AtomicUsize,
    pub rollbacks_to_savepoint: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Failures to inject. Counters are "fail the next N calls".
#[derive(Default)]
pub struct Script {
    pub create_failures: AtomicUsize,
    pub commit_failures: AtomicUsize,
    pub statement_failures: AtomicUsize,
    pub fail_rollback: AtomicBool,
    pub fail_close: AtomicBool,
    /// Every statement takes this long
    pub statement_delay_ms: AtomicU64,
}

fn take_failure(remaining: &AtomicUsize) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn serialization_failure() -> DbError {
    DbError::database(
        "could not serialize access",
        Some("40001".to_string()),
        "Retry the transaction",
    )
}

pub fn syntax_error() -> DbError {
    DbError::database(
        "syntax error at or near \"SELEC\"",
        Some("42601".to_string()),
        "Check the SQL syntax",
    )
}

/// Provider whose connections only record what was asked of them.
#[derive(Clone, Default)]
pub struct MockProvider {
    pub counters: Arc<Counters>,
    pub script: Arc<Script>,
    /// Every control call and statement, in order
    pub log: Arc<Mutex<Vec<String>>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

struct MockConnection {
    provider: MockProvider,
}

impl MockConnection {
    fn record(&self, entry: impl Into<String>) {
        self.provider.log.lock().unwrap().push(entry.into());
    }

    async fn statement(&self, sql: &str) -> DbResult<()> {
        let delay = self.provider.script.statement_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.provider.counters.statements.fetch_add(1, Ordering::SeqCst);
        self.record(sql);
        if take_failure(&self.provider.script.statement_failures) {
            return Err(serialization_failure().with_statement(sql));
        }
        if sql.contains("SELEC ") {
            return Err(syntax_error().with_statement(sql));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn begin(
        &mut self,
        _isolation: Option<IsolationLevel>,
        _read_only: bool,
    ) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            self.provider.counters.begins.fetch_add(1, Ordering::SeqCst);
            self.record("BEGIN");
            Ok(())
        })
    }

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            self.provider.counters.commits.fetch_add(1, Ordering::SeqCst);
            self.record("COMMIT");
            if take_failure(&self.provider.script.commit_failures) {
                return Err(serialization_failure());
            }
            Ok(())
        })
    }

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>> {
        Box::pin(async move {
            self.provider.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.record("ROLLBACK");
            if self.provider.script.fail_rollback.load(Ordering::SeqCst) {
                return Err(DbError::connection("connection reset", "Reconnect"));
            }
            Ok(())
        })
    }

    fn savepoint<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DbResult<()>> {
        Box::pin(async move {
            self.provider.counters.savepoints.fetch_add(1, Ordering::SeqCst);
            self.record(format!("SAVEPOINT {name}"));
            Ok(())
        })
    }

    fn release_savepoint<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DbResult<()>> {
        Box::pin(async move {
            self.provider.counters.releases.fetch_add(1, Ordering::SeqCst);
            self.record(format!("RELEASE SAVEPOINT {name}"));
            Ok(())
        })
    }

    fn rollback_to_savepoint<'a>(&'a mut self, name: &'a str) -> BoxFuture<'a, DbResult<()>> {
        Box::pin(async move {
            self.provider
                .counters
                .rollbacks_to_savepoint
                .fetch_add(1, Ordering::SeqCst);
            self.record(format!("ROLLBACK TO SAVEPOINT {name}"));
            Ok(())
        })
    }

    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        _params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<u64>> {
        Box::pin(async move {
            self.statement(sql).await?;
            Ok(1)
        })
    }

    fn fetch_all<'a>(
        &'a mut self,
        sql: &'a str,
        _params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<Vec<Row>>> {
        Box::pin(async move {
            self.statement(sql).await?;
            let mut row = Row::new();
            row.insert("value".to_string(), json!(1));
            Ok(vec![row])
        })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, DbResult<()>> {
        Box::pin(async move {
            self.provider.counters.closes.fetch_add(1, Ordering::SeqCst);
            self.record("CLOSE");
            if self.provider.script.fail_close.load(Ordering::SeqCst) {
                return Err(DbError::connection("socket already closed", "Reconnect"));
            }
            Ok(())
        })
    }
}

impl ConnectionProvider for MockProvider {
    fn create(&self) -> BoxFuture<'_, DbResult<Box<dyn Connection>>> {
        Box::pin(async move {
            self.counters.creates.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.script.create_failures) {
                return Err(DbError::connection("connection refused", "Check the server"));
            }
            Ok(Box::new(MockConnection {
                provider: self.clone(),
            }) as Box<dyn Connection>)
        })
    }

    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            database_type: None,
            url: None,
            max_connections: None,
        }
    }
}

/// Register a manager over `provider` in a private registry.
pub async fn mock_database(
    id: &str,
    provider: &MockProvider,
    config: TransactionConfig,
) -> Database {
    Database::with_provider(
        id,
        Arc::new(provider.clone()),
        config,
        Arc::new(TransactionManagerRegistry::new()),
    )
    .await
    .expect("mock database")
}

/// A fresh SQLite database file with a `users` table.
pub async fn sqlite_database(
    id: &str,
    registry: Arc<TransactionManagerRegistry>,
    config: TransactionConfig,
) -> (Database, NamedTempFile) {
    let file = NamedTempFile::new().expect("temp file");
    let mut url = DatabaseUrl::parse(&format!("{id}=sqlite:{}", file.path().display()))
        .expect("sqlite url");
    url.transaction = config;
    let db = Database::connect_with(url, registry)
        .await
        .expect("connect sqlite");

    db.transaction(|tx| {
        Box::pin(async move {
            tx.exec("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
                .await
        })
    })
    .await
    .expect("create table");

    (db, file)
}

pub async fn user_names(db: &Database) -> Vec<String> {
    db.transaction(|tx| {
        Box::pin(async move {
            let rows = tx.fetch_all("SELECT name FROM users ORDER BY id").await?;
            let names = rows
                .iter()
                .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(String::from))
                .collect::<Vec<_>>();
            Ok::<_, DbError>(names)
        })
    })
    .await
    .expect("read users")
}
