//! dbtx - Main entry point.
//!
//! Runs the given SQL statements in one retrying transaction and prints the
//! result of each statement as JSON.

use dbtx::config::Config;
use dbtx::database::{Database, TransactionOptions};
use dbtx::transaction::TransactionManagerRegistry;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Statements whose rows are printed rather than their affected-row count.
fn returns_rows(sql: &str) -> bool {
    let head = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(
        head.as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "PRAGMA" | "EXPLAIN" | "DESCRIBE"
    )
}

async fn run(db: &Database, config: &Config) -> Result<Vec<JsonValue>, dbtx::DbError> {
    let statements = Arc::new(config.statements.clone());
    let options = TransactionOptions::default();
    db.transaction_with(options, move |tx| {
        let statements = Arc::clone(&statements);
        Box::pin(async move {
            let mut results = Vec::with_capacity(statements.len());
            for sql in statements.iter() {
                if returns_rows(sql) {
                    let rows = tx.fetch_all(sql).await?;
                    results.push(json!({ "statement": sql, "rows": rows }));
                } else {
                    let affected = tx.exec(sql).await?;
                    results.push(json!({ "statement": sql, "rows_affected": affected }));
                }
            }
            Ok::<_, dbtx::DbError>(results)
        })
    })
    .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse_args();

    // Initialize logging
    init_tracing(&config);

    let url = config.database_url()?;
    info!(
        database = %url.id,
        statements = config.statements.len(),
        "Starting dbtx v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Database::connect_with(url, TransactionManagerRegistry::global()).await?;

    let outcome = tokio::select! {
        result = run(&db, &config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; rolling back");
            db.close().await?;
            return Err("interrupted".into());
        }
    };

    let closed = db.close().await;
    match outcome {
        Ok(results) => {
            println!("{}", serde_json::to_string_pretty(&results)?);
            closed?;
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Transaction failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {suggestion}");
            }
            Err(e.into())
        }
    }
}
