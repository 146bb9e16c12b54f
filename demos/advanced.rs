//! Advanced Example
//!
//! This example demonstrates:
//! 1. Running request handlers inside correlation scopes
//! 2. Writing to a database atomically with the transaction engine
//! 3. Retrying a transaction that lost a deadlock
//! 4. Guarding a flaky remote dependency with a circuit breaker and hooks

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience_core::{
    correlation, BreakerError, CircuitBreaker, Connection, ConnectionPool, DbError,
    HookRegistry, QueryResult, RemoteError, RetryPolicy, SqlValue, TransactionEngine,
    TransactionOptions,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// A toy pool that prints statements and injects one deadlock.
#[derive(Clone, Default)]
struct InMemoryPool {
    statements: Arc<Mutex<Vec<String>>>,
    deadlocks_left: Arc<AtomicU32>,
}

struct InMemoryConnection {
    statements: Arc<Mutex<Vec<String>>>,
    deadlocks_left: Arc<AtomicU32>,
}

#[async_trait]
impl ConnectionPool for InMemoryPool {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, DbError> {
        Ok(InMemoryConnection {
            statements: Arc::clone(&self.statements),
            deadlocks_left: Arc::clone(&self.deadlocks_left),
        })
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        println!("    SQL: {sql} {params:?}");
        self.statements.lock().push(sql.to_owned());

        if sql.starts_with("UPDATE")
            && self
                .deadlocks_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(DbError::deadlock("deadlock detected"));
        }

        Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: 1,
        })
    }

    fn release(&self) {
        println!("    connection released");
    }
}

// A remote SMS gateway that fails every call after the third
async fn send_sms(calls: &AtomicU32, to: &str) -> Result<String, RemoteError> {
    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
    if n > 3 {
        Err(RemoteError::status(503, "gateway unavailable"))
    } else {
        Ok(format!("queued sms to {to}"))
    }
}

async fn handle_order(
    engine: &TransactionEngine<InMemoryPool>,
    sms: &CircuitBreaker<RemoteError>,
    gateway_calls: &AtomicU32,
    order_id: u32,
) {
    correlation::add_context("orderId", order_id);
    println!(
        "\n--- order {order_id} (correlation {}) ---",
        correlation::get().map(|id| id.to_string()).unwrap_or_default()
    );

    let stored = engine
        .execute_with_retry(
            |conn| async move {
                conn.execute("INSERT INTO orders (id) VALUES ($1)", &[json!(order_id)])
                    .await?;
                conn.execute("UPDATE stock SET n = n - 1 WHERE sku = $1", &[json!("sku-1")])
                    .await?;
                Ok::<_, DbError>(order_id)
            },
            TransactionOptions::new().timeout(Duration::from_secs(5)),
            RetryPolicy::new(3, Duration::from_millis(50)),
        )
        .await;

    match stored {
        Ok(id) => println!("order {id} stored"),
        Err(err) => {
            println!("order failed: {}", err.to_json());
            return;
        }
    }

    match sms.call(|| send_sms(gateway_calls, "+15550100")).await {
        Ok(receipt) => println!("notification: {receipt}"),
        Err(BreakerError::Open { retry_after, .. }) => {
            println!("notification skipped, gateway circuit open for {retry_after:?}")
        }
        Err(err) => println!("notification failed: {}", err.to_json()),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Advanced Example ===");

    let pool = InMemoryPool::default();
    pool.deadlocks_left.store(1, Ordering::SeqCst);
    let engine = TransactionEngine::new(pool.clone());

    // Hooks for observability
    let hooks = HookRegistry::new();
    hooks.set_on_open(|name| println!("📢 circuit {name} OPENED"));
    hooks.set_on_half_open(|name| println!("📢 circuit {name} HALF-OPEN"));
    hooks.set_on_close(|name| println!("📢 circuit {name} CLOSED"));
    hooks.set_on_rejected(|name| println!("⛔ circuit {name} rejected a call"));

    let sms = CircuitBreaker::<RemoteError>::builder("sms-gateway")
        .failure_threshold(2)
        .reset_timeout(Duration::from_secs(1))
        .timeout(Duration::from_secs(2))
        .hooks(hooks)
        .build();

    let gateway_calls = AtomicU32::new(0);
    for order_id in 1..=7 {
        correlation::run(None, handle_order(&engine, &sms, &gateway_calls, order_id)).await;
    }

    println!("\ntransactions: {:#?}", engine.metrics());
    println!(
        "breaker: {}",
        serde_json::to_string_pretty(&sms.status()).unwrap_or_default()
    );
    println!("statements issued: {}", pool.statements.lock().len());

    println!("\n=== Example Completed ===");
}
