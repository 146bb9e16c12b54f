//! # resilience-core
//!
//! Fault-tolerance building blocks for services that call remote dependencies
//! and relational databases.
//!
//! The crate provides three pieces that are designed to be combined:
//!
//! - [`CircuitBreaker`]: guards a named dependency and fails fast once it
//!   looks unhealthy.
//! - [`TransactionEngine`]: runs a unit of work atomically on a pooled
//!   connection, with savepoint sequences, deadlock retry and an
//!   active-transaction registry.
//! - [`correlation`]: carries a correlation id across `.await` points and
//!   spawned tasks so every log line of one request can be joined up.
//!
//! ## What is a Circuit Breaker?
//!
//! The Circuit Breaker pattern prevents cascading failures by temporarily
//! refusing calls to a dependency that keeps failing. It operates in three
//! states:
//!
//! - **Closed**: Normal operation. Calls pass through; failures are counted in
//!   a rolling window.
//! - **Open**: Calls are rejected immediately without reaching the dependency.
//! - **Half-Open**: After the reset timeout, probe calls are admitted. Enough
//!   successes close the circuit; one failure re-opens it.
//!
//! ## Basic Usage
//!
//! ```rust
//! use resilience_core::{BreakerError, CircuitBreaker, RemoteError};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let breaker = CircuitBreaker::<RemoteError>::builder("payments")
//!     .failure_threshold(3)
//!     .reset_timeout(Duration::from_secs(10))
//!     .timeout(Duration::from_secs(2))
//!     .build();
//!
//! match breaker.call(|| async { Ok::<_, RemoteError>("charged") }).await {
//!     Ok(result) => println!("call succeeded: {result}"),
//!     Err(BreakerError::Open { retry_after, .. }) => {
//!         println!("circuit is open, retry in {retry_after:?}")
//!     }
//!     Err(err) => println!("call failed: {err}"),
//! }
//! # });
//! ```
//!
//! ## Transactions
//!
//! ```rust,ignore
//! let engine = TransactionEngine::new(pool);
//!
//! let order_id = engine
//!     .execute(
//!         |conn| async move {
//!             conn.execute("INSERT INTO orders (id) VALUES ($1)", &[json!(42)]).await?;
//!             conn.execute("UPDATE stock SET n = n - 1 WHERE id = $1", &[json!(7)]).await?;
//!             Ok::<_, DbError>(42)
//!         },
//!         TransactionOptions::new(),
//!     )
//!     .await?;
//! ```
//!
//! ## Features
//!
//! - `prometheus` - Prometheus metrics integration via [`PrometheusSink`]

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod breaker;
mod config;
pub mod correlation;
mod error;
mod hook;
mod metrics;
mod policy;
mod pool;
pub mod prelude;
mod registry;
mod retry;
mod state;
mod status;
mod transaction;

// Re-exports
pub use breaker::{CallContext, CircuitBreaker};
pub use config::{BreakerBuilder, BreakerConfig};
pub use correlation::{CorrelationContext, CorrelationId};
pub use error::{
    BoxError, BreakerError, BreakerResult, DbError, RemoteError, SavepointError,
    TransactionError, TransactionStage,
};
pub use hook::HookRegistry;
#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
pub use metrics::PrometheusSink;
pub use metrics::{CallOutcome, MetricSink, NullMetricSink};
pub use policy::{default_is_failure, is_retryable_db_error, FailurePredicate};
pub use pool::{Connection, ConnectionPool, IsolationLevel, QueryResult, Row, SqlValue};
pub use registry::ActiveTransactionInfo;
pub use retry::RetryPolicy;
pub use state::{State, StateTransition, TransitionCause};
pub use status::{BreakerHealth, BreakerStatus, ConfigSnapshot, MetricsSnapshot};
pub use transaction::{
    savepoint_op, EngineConfig, KillReport, SavepointOp, TransactionEngine, TransactionId,
    TransactionMetrics, TransactionOptions, TxConnection,
};
