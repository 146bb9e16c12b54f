//! Transactional execution engine.
//!
//! [`TransactionEngine::execute`] runs a unit of work on one connection inside
//! `BEGIN`/`COMMIT`, rolls back on any failure and always hands the connection
//! back to the pool. On top of it sit savepoint sequences
//! ([`execute_with_savepoints`](TransactionEngine::execute_with_savepoints)) and
//! deadlock retry ([`execute_with_retry`](TransactionEngine::execute_with_retry)).
//!
//! The per-transaction timeout is observational: when it elapses a watchdog
//! logs the overrun, but the transaction keeps running. The only way to
//! forcibly end a transaction is
//! [`kill_long_running_transactions`](TransactionEngine::kill_long_running_transactions).

use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::correlation::{self, CorrelationId};
use crate::error::{BoxError, DbError, SavepointError, TransactionError, TransactionStage};
use crate::pool::{Connection, ConnectionPool, IsolationLevel, QueryResult, SqlValue};
use crate::registry::{ActiveRegistry, ActiveTransaction, ActiveTransactionInfo};
use crate::retry::RetryPolicy;

/// Identifier of one `execute` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    /// `txn_<unix millis>_<7 random hex chars>`.
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!(
            "txn_{}_{}",
            Utc::now().timestamp_millis(),
            &random[..7]
        ))
    }

    /// Borrows the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Watchdog timeout used when a call does not set one. Zero disables it.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
    /// Isolation level connections start transactions with. Requests for any
    /// other level issue `SET TRANSACTION ISOLATION LEVEL`.
    pub connection_isolation: IsolationLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            connection_isolation: IsolationLevel::ReadCommitted,
        }
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Correlation id for logs and errors; defaults to the ambient one.
    pub correlation_id: Option<CorrelationId>,
    /// Watchdog timeout; defaults to [`EngineConfig::default_timeout`].
    pub timeout: Option<Duration>,
    /// Isolation level; defaults to [`EngineConfig::connection_isolation`].
    pub isolation_level: Option<IsolationLevel>,
}

impl TransactionOptions {
    /// Options with every field defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the correlation id.
    pub fn correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Sets the watchdog timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the isolation level.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }
}

/// Cumulative transaction counters plus the active set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMetrics {
    /// Transactions started.
    pub total: u64,
    /// Transactions committed.
    pub successful: u64,
    /// Transactions that failed and were rolled back.
    pub rolled_back: u64,
    /// Committed share of all started transactions, in percent.
    pub success_rate: Option<f64>,
    /// Transactions currently holding a connection.
    pub active: usize,
    /// The active transactions, oldest first.
    pub active_transactions: Vec<ActiveTransactionInfo>,
}

/// Outcome of [`TransactionEngine::kill_long_running_transactions`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KillReport {
    /// Transactions rolled back and released.
    pub killed: Vec<TransactionId>,
    /// Transactions whose ROLLBACK failed. Their connection was still released.
    pub failed: Vec<TransactionId>,
}

/// One step of a savepoint sequence.
pub type SavepointOp<C, T> =
    Box<dyn FnOnce(TxConnection<C>) -> BoxFuture<'static, Result<T, BoxError>> + Send>;

/// Boxes a closure into a [`SavepointOp`].
pub fn savepoint_op<C, T, E, F, Fut>(operation: F) -> SavepointOp<C, T>
where
    C: Connection,
    F: FnOnce(TxConnection<C>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError> + Send + 'static,
{
    Box::new(move |conn| async move { operation(conn).await.map_err(Into::into) }.boxed())
}

/// A checked-out connection shared by the owning transaction and the kill
/// switch.
///
/// Whoever revokes the lease first owns the connection from then on and must
/// [`finish`](Lease::finish) it. Revocation is immediate, so no statement of
/// the owner can reach the connection after a kill has started.
pub(crate) struct Lease<C> {
    conn: C,
    revoked: AtomicBool,
}

impl<C: Connection> Lease<C> {
    fn new(conn: C) -> Self {
        Self {
            conn,
            revoked: AtomicBool::new(false),
        }
    }

    pub(crate) async fn query(
        &self,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<QueryResult, DbError> {
        if self.is_released() {
            return Err(DbError::connection_released());
        }
        self.conn.query(sql, params).await
    }

    /// Shuts the owner out. Returns true for the one caller that revoked it.
    pub(crate) fn revoke(&self) -> bool {
        !self.revoked.swap(true, Ordering::AcqRel)
    }

    /// The connection, bypassing the revocation check. Only for the revoker.
    pub(crate) fn connection(&self) -> &C {
        &self.conn
    }

    /// Hands the connection back to the pool. Only for the revoker.
    pub(crate) fn finish(&self) {
        self.conn.release();
    }

    /// Revokes and finishes in one step. Returns true if this call did both.
    pub(crate) fn release(&self) -> bool {
        let revoked = self.revoke();
        if revoked {
            self.finish();
        }
        revoked
    }

    pub(crate) fn is_released(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }
}

/// Finishes a revoked lease even if the kill switch is dropped mid-ROLLBACK.
struct Revoked<'a, C: Connection>(&'a Lease<C>);

impl<C: Connection> Drop for Revoked<'_, C> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// The connection handed to a unit of work.
///
/// Statements run in the order they are awaited. Once the transaction ends,
/// every further query fails with SQLSTATE `08003`.
pub struct TxConnection<C> {
    lease: Arc<Lease<C>>,
    transaction_id: TransactionId,
    correlation_id: Option<CorrelationId>,
}

impl<C> Clone for TxConnection<C> {
    fn clone(&self) -> Self {
        Self {
            lease: Arc::clone(&self.lease),
            transaction_id: self.transaction_id.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

impl<C: Connection> TxConnection<C> {
    /// Runs a statement inside the transaction.
    pub async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        self.lease.query(sql, params).await
    }

    /// Runs a statement and returns the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        Ok(self.lease.query(sql, params).await?.rows_affected)
    }

    /// Id of the enclosing transaction.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Correlation id of the enclosing transaction.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// True once the connection went back to the pool.
    pub fn is_released(&self) -> bool {
        self.lease.is_released()
    }
}

#[derive(Debug, Default)]
struct TransactionStats {
    started: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

/// Releases everything a transaction holds, on every exit path including the
/// caller dropping the future.
struct TransactionGuard<'a, C: Connection> {
    registry: &'a ActiveRegistry<C>,
    id: TransactionId,
    lease: Arc<Lease<C>>,
    watchdog: Option<JoinHandle<()>>,
    started_at: Instant,
}

impl<'a, C: Connection> TransactionGuard<'a, C> {
    fn register(
        registry: &'a ActiveRegistry<C>,
        id: TransactionId,
        lease: Arc<Lease<C>>,
        correlation_id: Option<CorrelationId>,
        isolation_level: IsolationLevel,
        started_at: Instant,
    ) -> Self {
        registry.insert(
            id.clone(),
            ActiveTransaction {
                lease: Arc::clone(&lease),
                correlation_id,
                isolation_level,
                started_at,
                start_time: Utc::now(),
            },
        );

        Self {
            registry,
            id,
            lease,
            watchdog: None,
            started_at,
        }
    }

    /// Logs once if the transaction outlives `timeout`. Never cancels anything.
    fn arm_watchdog(&mut self, timeout: Duration, correlation_id: Option<CorrelationId>) {
        if timeout.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let id = self.id.clone();
        let started_at = self.started_at;
        self.watchdog = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::error!(
                transaction_id = %id,
                correlation_id = correlation_id.as_ref().map(CorrelationId::as_str),
                timeout_ms = timeout.as_millis() as u64,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "transaction timeout exceeded, transaction still running"
            );
        }));
    }
}

impl<C: Connection> Drop for TransactionGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        self.lease.release();
        self.registry.remove(&self.id);

        tracing::debug!(
            transaction_id = %self.id,
            duration_ms = self.started_at.elapsed().as_millis() as u64,
            "transaction resources released"
        );
    }
}

struct EngineInner<P: ConnectionPool> {
    pool: P,
    config: EngineConfig,
    registry: ActiveRegistry<P::Connection>,
    stats: TransactionStats,
}

/// Runs units of work atomically against connections from one pool.
///
/// Construct one per pool and share it; clones share counters and the
/// active-transaction registry.
pub struct TransactionEngine<P: ConnectionPool> {
    inner: Arc<EngineInner<P>>,
}

impl<P: ConnectionPool> Clone for TransactionEngine<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn at<E: Into<BoxError>>(
    stage: TransactionStage,
) -> impl FnOnce(E) -> (TransactionStage, BoxError) {
    move |error| (stage, error.into())
}

impl<P: ConnectionPool> TransactionEngine<P> {
    /// Creates an engine with default settings.
    pub fn new(pool: P) -> Self {
        Self::with_config(pool, EngineConfig::default())
    }

    /// Creates an engine with explicit settings.
    pub fn with_config(pool: P, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                pool,
                config,
                registry: ActiveRegistry::new(),
                stats: TransactionStats::default(),
            }),
        }
    }

    /// The pool this engine draws connections from.
    pub fn pool(&self) -> &P {
        &self.inner.pool
    }

    /// Runs `unit_of_work` inside a transaction.
    ///
    /// Commits when it returns `Ok`. On any failure of BEGIN, the unit of work
    /// or COMMIT, issues a best-effort ROLLBACK and returns a
    /// [`TransactionError`] wrapping the original cause; a failing ROLLBACK is
    /// attached to the error but never replaces the cause.
    pub async fn execute<F, Fut, T, E>(
        &self,
        unit_of_work: F,
        options: TransactionOptions,
    ) -> Result<T, TransactionError>
    where
        F: FnOnce(TxConnection<P::Connection>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let transaction_id = TransactionId::generate();
        let correlation_id = options.correlation_id.clone().or_else(correlation::get);
        let span = tracing::info_span!(
            "transaction",
            transaction_id = %transaction_id,
            correlation_id = correlation_id.as_ref().map(CorrelationId::as_str),
        );

        self.run(transaction_id, correlation_id, unit_of_work, options)
            .instrument(span)
            .await
    }

    async fn run<F, Fut, T, E>(
        &self,
        transaction_id: TransactionId,
        correlation_id: Option<CorrelationId>,
        unit_of_work: F,
        options: TransactionOptions,
    ) -> Result<T, TransactionError>
    where
        F: FnOnce(TxConnection<P::Connection>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let inner = &*self.inner;
        let isolation_level = options
            .isolation_level
            .unwrap_or(inner.config.connection_isolation);
        let timeout = options.timeout.unwrap_or(inner.config.default_timeout);
        let started_at = Instant::now();

        inner.stats.started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(isolation_level = %isolation_level, "transaction started");

        let connection = match inner.pool.connect().await {
            Ok(connection) => connection,
            Err(error) => {
                inner.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %error,
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "transaction failed to acquire a connection"
                );
                return Err(TransactionError::new(
                    transaction_id,
                    correlation_id,
                    TransactionStage::Acquire,
                    error.into(),
                ));
            }
        };

        let lease = Arc::new(Lease::new(connection));
        let mut guard = TransactionGuard::register(
            &inner.registry,
            transaction_id.clone(),
            Arc::clone(&lease),
            correlation_id.clone(),
            isolation_level,
            started_at,
        );
        guard.arm_watchdog(timeout, correlation_id.clone());

        let handle = TxConnection {
            lease: Arc::clone(&lease),
            transaction_id: transaction_id.clone(),
            correlation_id: correlation_id.clone(),
        };

        let outcome = async {
            lease.query("BEGIN", &[]).await.map_err(at(TransactionStage::Begin))?;
            if isolation_level != inner.config.connection_isolation {
                let sql = format!("SET TRANSACTION ISOLATION LEVEL {}", isolation_level.as_sql());
                lease.query(&sql, &[]).await.map_err(at(TransactionStage::Begin))?;
            }

            let value = unit_of_work(handle)
                .await
                .map_err(at(TransactionStage::UnitOfWork))?;

            lease.query("COMMIT", &[]).await.map_err(at(TransactionStage::Commit))?;
            Ok::<T, (TransactionStage, BoxError)>(value)
        }
        .await;

        match outcome {
            Ok(value) => {
                inner.stats.committed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "transaction committed"
                );
                Ok(value)
            }
            Err((stage, cause)) => {
                inner.stats.rolled_back.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    stage = %stage,
                    error = %cause,
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "transaction failed, rolling back"
                );

                let rollback_error = match lease.query("ROLLBACK", &[]).await {
                    Ok(_) => {
                        tracing::info!("transaction rolled back");
                        None
                    }
                    Err(error) => {
                        tracing::error!(error = %error, "rollback failed");
                        Some(error)
                    }
                };

                Err(
                    TransactionError::new(transaction_id, correlation_id, stage, cause)
                        .with_rollback_error(rollback_error),
                )
            }
        }
    }

    /// Runs `operations` in one transaction, each behind its own savepoint.
    ///
    /// Savepoints are named `sp_<index>`. When operation *k* fails, the
    /// transaction rolls back to its savepoint, operations after *k* never run,
    /// and the whole transaction is rolled back. The error's cause is a
    /// [`SavepointError`] naming the failed step.
    pub async fn execute_with_savepoints<T>(
        &self,
        operations: Vec<SavepointOp<P::Connection, T>>,
        options: TransactionOptions,
    ) -> Result<Vec<T>, TransactionError>
    where
        T: Send + 'static,
    {
        self.execute(
            move |conn| async move {
                let mut results = Vec::with_capacity(operations.len());

                for (index, operation) in operations.into_iter().enumerate() {
                    let savepoint = format!("sp_{index}");

                    conn.query(&format!("SAVEPOINT {savepoint}"), &[])
                        .await
                        .map_err(|e| SavepointError::new(index, savepoint.clone(), e.into()))?;
                    tracing::debug!(savepoint = %savepoint, "savepoint created");

                    match operation(conn.clone()).await {
                        Ok(value) => {
                            conn.query(&format!("RELEASE SAVEPOINT {savepoint}"), &[])
                                .await
                                .map_err(|e| {
                                    SavepointError::new(index, savepoint.clone(), e.into())
                                })?;
                            results.push(value);
                        }
                        Err(cause) => {
                            tracing::error!(
                                savepoint = %savepoint,
                                operation = index,
                                error = %cause,
                                "operation failed, rolling back to savepoint"
                            );
                            let rollback = format!("ROLLBACK TO SAVEPOINT {savepoint}");
                            if let Err(error) = conn.query(&rollback, &[]).await {
                                tracing::error!(
                                    savepoint = %savepoint,
                                    error = %error,
                                    "rollback to savepoint failed"
                                );
                            }
                            return Err(SavepointError::new(index, savepoint, cause));
                        }
                    }
                }

                Ok::<_, SavepointError>(results)
            },
            options,
        )
        .await
    }

    /// Runs `unit_of_work` in a fresh transaction, retrying deadlocks and
    /// serialization failures.
    ///
    /// Retries at most `retry.max_retries` times, waiting
    /// [`RetryPolicy::delay_for`] before each. Any other failure is returned
    /// immediately.
    pub async fn execute_with_retry<F, Fut, T, E>(
        &self,
        mut unit_of_work: F,
        options: TransactionOptions,
        retry: RetryPolicy,
    ) -> Result<T, TransactionError>
    where
        F: FnMut(TxConnection<P::Connection>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut attempt: u32 = 1;
        loop {
            match self.execute(&mut unit_of_work, options.clone()).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt <= retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    tracing::warn!(
                        transaction_id = %error.transaction_id(),
                        correlation_id = error.correlation_id().map(CorrelationId::as_str),
                        attempt,
                        max_retries = retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "deadlock detected, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Counters and the current active set.
    pub fn metrics(&self) -> TransactionMetrics {
        let stats = &self.inner.stats;
        let total = stats.started.load(Ordering::Relaxed);
        let successful = stats.committed.load(Ordering::Relaxed);

        TransactionMetrics {
            total,
            successful,
            rolled_back: stats.rolled_back.load(Ordering::Relaxed),
            success_rate: (total > 0).then(|| {
                let percent = successful as f64 * 100.0 / total as f64;
                (percent * 100.0).round() / 100.0
            }),
            active: self.inner.registry.len(),
            active_transactions: self.inner.registry.infos(),
        }
    }

    /// Zeroes the counters. The active set is untouched.
    pub fn reset_metrics(&self) {
        let stats = &self.inner.stats;
        stats.started.store(0, Ordering::Relaxed);
        stats.committed.store(0, Ordering::Relaxed);
        stats.rolled_back.store(0, Ordering::Relaxed);
        tracing::info!("transaction metrics reset");
    }

    /// Active transactions running for longer than `threshold`, oldest first.
    pub fn long_running_transactions(&self, threshold: Duration) -> Vec<ActiveTransactionInfo> {
        self.inner
            .registry
            .older_than(threshold)
            .into_iter()
            .map(|(info, _)| info)
            .collect()
    }

    /// Rolls back and releases every transaction older than `threshold`.
    ///
    /// Emergency tool. Each victim's connection is taken away from its unit of
    /// work before the ROLLBACK is sent, so the owner fails with SQLSTATE
    /// `08003` on its next statement and can never commit. The connection goes
    /// back to the pool either way; a transaction whose ROLLBACK failed is
    /// reported in [`KillReport::failed`].
    pub async fn kill_long_running_transactions(&self, threshold: Duration) -> KillReport {
        let candidates = self.inner.registry.older_than(threshold);
        tracing::warn!(
            count = candidates.len(),
            threshold_ms = threshold.as_millis() as u64,
            "killing long-running transactions"
        );

        let mut report = KillReport::default();
        for (info, lease) in candidates {
            // Lost the race against the owner finishing on its own.
            if !lease.revoke() {
                continue;
            }
            let finish = Revoked(&lease);
            let outcome = lease.connection().query("ROLLBACK", &[]).await;
            drop(finish);
            self.inner.registry.remove(&info.id);

            match outcome {
                Ok(_) => {
                    tracing::warn!(
                        transaction_id = %info.id,
                        correlation_id = info.correlation_id.as_ref().map(CorrelationId::as_str),
                        duration_ms = info.duration_ms,
                        "long-running transaction killed"
                    );
                    report.killed.push(info.id);
                }
                Err(error) => {
                    tracing::error!(
                        transaction_id = %info.id,
                        error = %error,
                        "failed to roll back killed transaction, connection released"
                    );
                    report.failed.push(info.id);
                }
            }
        }
        report
    }
}
