//! Integration tests for the retry loop and per-attempt connection lifecycle.

mod common;

use common::{Counters, MockProvider, mock_database};
use dbtx::config::TransactionConfig;
use dbtx::database::Database;
use dbtx::error::{DbError, DbResult};
use dbtx::models::IsolationLevel;
use dbtx::transaction::{Transaction, TransactionManager, TransactionManagerRegistry};
use futures_util::future::BoxFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn count(counter: &AtomicUsize) -> usize {
    Counters::get(counter)
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(2, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let result = db
        .transaction({
            let calls = Arc::clone(&calls);
            move |tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tx.exec("UPDATE orders SET state = 'paid'").await
                })
            }
        })
        .await;

    assert_eq!(result.unwrap(), 1);
    let c = &provider.counters;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // One fresh connection per attempt, each closed exactly once
    assert_eq!(count(&c.creates), 3);
    assert_eq!(count(&c.closes), 3);
    assert_eq!(count(&c.rollbacks), 2);
    assert_eq!(count(&c.commits), 1);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(100, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let result = db
        .transaction(|tx| Box::pin(async move { tx.exec("DELETE FROM carts").await }))
        .await;

    let err = result.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.statement(), Some("DELETE FROM carts"));

    let c = &provider.counters;
    assert_eq!(count(&c.creates), 3);
    assert_eq!(count(&c.rollbacks), 3);
    assert_eq!(count(&c.closes), 3);
    assert_eq!(count(&c.commits), 0);
}

#[tokio::test]
async fn test_commit_failure_is_retried() {
    let provider = MockProvider::new();
    provider.script.commit_failures.store(1, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    db.transaction(|tx| Box::pin(async move { tx.exec("INSERT INTO audit VALUES (1)").await }))
        .await
        .unwrap();

    let c = &provider.counters;
    assert_eq!(count(&c.creates), 2);
    assert_eq!(count(&c.commits), 2);
    assert_eq!(count(&c.rollbacks), 1);
    assert_eq!(count(&c.closes), 2);
}

#[tokio::test]
async fn test_connection_failure_is_retried() {
    let provider = MockProvider::new();
    provider.script.create_failures.store(1, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    db.transaction(|tx| Box::pin(async move { tx.exec("SELECT 1").await }))
        .await
        .unwrap();

    let c = &provider.counters;
    assert_eq!(count(&c.creates), 2);
    // The failed attempt never got a connection to close
    assert_eq!(count(&c.closes), 1);
    assert_eq!(count(&c.commits), 1);
}

#[tokio::test]
async fn test_fatal_error_is_not_retried() {
    let provider = MockProvider::new();
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let result = db
        .transaction(|tx| Box::pin(async move { tx.exec("SELEC 1").await }))
        .await;

    assert!(matches!(result, Err(DbError::Database { .. })));
    assert_eq!(count(&provider.counters.creates), 1);
    assert_eq!(count(&provider.counters.rollbacks), 1);
}

#[tokio::test]
async fn test_application_error_is_not_retried() {
    let provider = MockProvider::new();
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let result: Result<(), DbError> = db
        .transaction({
            let calls = Arc::clone(&calls);
            move |tx| {
                let calls = Arc::clone(&calls);
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tx.exec("INSERT INTO orders VALUES (1)").await?;
                    Err::<(), _>(DbError::application(std::io::Error::other("out of stock")))
                })
            }
        })
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, DbError::Application(_)));
    assert_eq!(err.to_string(), "out of stock");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let c = &provider.counters;
    assert_eq!(count(&c.rollbacks), 1);
    assert_eq!(count(&c.commits), 0);
    assert_eq!(count(&c.closes), 1);
}

#[tokio::test]
async fn test_single_attempt_budget() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(1, Ordering::SeqCst);
    let config = TransactionConfig::default().with_max_attempts(1);
    let db = mock_database("orders", &provider, config).await;

    let result = db
        .transaction(|tx| Box::pin(async move { tx.exec("UPDATE stock SET n = n - 1").await }))
        .await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(count(&provider.counters.creates), 1);
}

#[tokio::test]
async fn test_block_can_raise_attempt_budget() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(4, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let result = db
        .transaction(|tx| {
            Box::pin(async move {
                tx.set_max_attempts(5)?;
                tx.exec("UPDATE stock SET n = n - 1").await
            })
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(count(&provider.counters.creates), 5);
}

#[tokio::test]
async fn test_zero_attempt_budget_is_rejected() {
    let provider = MockProvider::new();
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let result = db
        .transaction(|tx| Box::pin(async move { tx.set_max_attempts(0) }))
        .await;

    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    // Validation errors are not retried
    assert_eq!(count(&provider.counters.creates), 0);
}

#[tokio::test]
async fn test_cleanup_failures_do_not_mask_error() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(100, Ordering::SeqCst);
    provider.script.fail_rollback.store(true, Ordering::SeqCst);
    provider.script.fail_close.store(true, Ordering::SeqCst);
    let config = TransactionConfig::default().with_max_attempts(2);
    let db = mock_database("orders", &provider, config).await;

    let err = db
        .transaction(|tx| Box::pin(async move { tx.exec("UPDATE t SET x = 1").await }))
        .await
        .unwrap_err();

    // The serialization failure, not the rollback or close failure
    assert!(matches!(err, DbError::Database { .. }));
    assert!(err.is_retryable());

    let c = &provider.counters;
    assert_eq!(count(&c.rollbacks), 2);
    assert_eq!(count(&c.closes), 2);
}

#[tokio::test]
async fn test_close_failure_after_commit_is_logged() {
    let provider = MockProvider::new();
    provider.script.fail_close.store(true, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let result = db
        .transaction(|tx| Box::pin(async move { tx.exec("INSERT INTO t VALUES (1)").await }))
        .await;

    assert_eq!(result.unwrap(), 1);
    assert_eq!(count(&provider.counters.creates), 1);
}

#[tokio::test]
async fn test_block_without_statements_opens_no_connection() {
    let provider = MockProvider::new();
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let value = db
        .transaction(|_tx| Box::pin(async move { Ok::<_, DbError>(42) }))
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(count(&provider.counters.creates), 0);
    assert_eq!(count(&provider.counters.commits), 0);
}

#[tokio::test]
async fn test_retry_interval_between_attempts() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(2, Ordering::SeqCst);
    // (400 - 0) / (3 + 1) = 100ms between attempts
    let config = TransactionConfig::default().with_retry_delays(0, 400);
    let db = mock_database("orders", &provider, config).await;

    let started = Instant::now();
    db.transaction(|tx| Box::pin(async move { tx.exec("UPDATE t SET x = 1").await }))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_finished_states_are_not_tracked() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(1, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let during = db
        .transaction({
            let db = db.clone();
            move |tx| {
                let db = db.clone();
                Box::pin(async move {
                    tx.exec("UPDATE t SET x = 1").await?;
                    db.list_active().await
                })
            }
        })
        .await
        .unwrap();

    assert_eq!(during.len(), 1);
    assert!(db.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failing_provider_is_asked_once_per_attempt() {
    let provider = MockProvider::new();
    provider.script.create_failures.store(usize::MAX, Ordering::SeqCst);
    let config = TransactionConfig::default().with_max_attempts(4);
    let db = mock_database("orders", &provider, config).await;

    let err = db
        .transaction(|tx| Box::pin(async move { tx.exec("SELECT 1").await }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Connection { .. }));
    assert_eq!(count(&provider.counters.creates), 4);
    assert_eq!(count(&provider.counters.closes), 0);
}

#[tokio::test]
async fn test_every_commit_failing_exhausts_attempts() {
    let provider = MockProvider::new();
    provider.script.commit_failures.store(usize::MAX, Ordering::SeqCst);
    let config = TransactionConfig::default().with_max_attempts(4);
    let db = mock_database("orders", &provider, config).await;

    let err = db
        .transaction(|tx| Box::pin(async move { tx.exec("INSERT INTO t VALUES (1)").await }))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    let c = &provider.counters;
    assert_eq!(count(&c.creates), 4);
    assert_eq!(count(&c.commits), 4);
    assert_eq!(count(&c.closes), 4);
}

#[tokio::test]
async fn test_close_failure_does_not_mask_error() {
    let provider = MockProvider::new();
    provider.script.fail_close.store(true, Ordering::SeqCst);
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let err = db
        .transaction(|tx| Box::pin(async move { tx.exec("SELEC * FROM t").await }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Database { .. }));
    assert!(err.to_string().contains("syntax error"));
    assert_eq!(count(&provider.counters.closes), 1);
}

#[tokio::test]
async fn test_statement_timeout_is_retried() {
    let provider = MockProvider::new();
    provider.script.statement_delay_ms.store(500, Ordering::SeqCst);
    let config = TransactionConfig::default()
        .with_max_attempts(2)
        .with_statement_timeout(Some(Duration::from_millis(20)));
    let db = mock_database("orders", &provider, config).await;

    let err = db
        .transaction(|tx| Box::pin(async move { tx.exec("SELECT pg_sleep(1)").await }))
        .await
        .unwrap_err();

    assert!(matches!(err, DbError::Timeout { .. }));
    assert_eq!(count(&provider.counters.creates), 2);
    assert_eq!(count(&provider.counters.closes), 2);
}

#[tokio::test]
async fn test_cancelled_attempt_is_cleaned_up() {
    let provider = MockProvider::new();
    let db = mock_database("orders", &provider, TransactionConfig::default()).await;

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        db.transaction(|tx| {
            Box::pin(async move {
                tx.exec("UPDATE t SET x = 1").await?;
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<_, DbError>(())
            })
        }),
    )
    .await;
    assert!(outcome.is_err());

    // Cleanup runs on a spawned task
    for _ in 0..50 {
        if count(&provider.counters.closes) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(count(&provider.counters.rollbacks), 1);
    assert_eq!(count(&provider.counters.closes), 1);
    assert!(db.list_active().await.unwrap().is_empty());
}

/// Manager that builds states itself instead of going through the default one.
struct CannedManager {
    config: TransactionConfig,
    provider: MockProvider,
    handed_out: AtomicUsize,
}

impl TransactionManager for CannedManager {
    fn database(&self) -> &str {
        "canned"
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
            self.handed_out.fetch_add(1, Ordering::SeqCst);
            Transaction::builder("canned", Arc::new(self.provider.clone()))
                .config(&self.config)
                .isolation(isolation)
                .read_only(read_only)
                .outer(outer)
                .build()
        })
    }
}

#[tokio::test]
async fn test_custom_manager_supplies_every_attempt() {
    let provider = MockProvider::new();
    provider.script.statement_failures.store(1, Ordering::SeqCst);
    let manager = Arc::new(CannedManager {
        config: TransactionConfig::default(),
        provider: provider.clone(),
        handed_out: AtomicUsize::new(0),
    });
    let db = Database::with_manager(
        manager.clone(),
        Arc::new(TransactionManagerRegistry::new()),
    )
    .await;
    assert_eq!(db.id(), "canned");

    db.transaction(|tx| Box::pin(async move { tx.exec("UPDATE t SET x = 1").await }))
        .await
        .unwrap();

    assert_eq!(manager.handed_out.load(Ordering::SeqCst), 2);
    assert_eq!(count(&provider.counters.creates), 2);
    assert_eq!(count(&provider.counters.closes), 2);
}
