//! Error types for the circuit breaker and the transaction engine.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use ahash::AHashSet;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use thiserror::Error;

use crate::correlation::CorrelationId;
use crate::transaction::TransactionId;

/// Boxed, thread-safe error used wherever the cause type is open-ended.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Result type for circuit breaker operations.
pub type BreakerResult<T, E> = Result<T, BreakerError<E>>;

/// Error codes a remote dependency uses to reject malformed input.
static VALIDATION_CODES: Lazy<AHashSet<&'static str>> = Lazy::new(|| {
    [
        "VALIDATION_ERROR",
        "INVALID_INPUT",
        "INVALID_MESSAGE",
        "EMPTY_MESSAGE",
        "INVALID_TO_NUMBER",
        "INVALID_FROM_NUMBER",
    ]
    .into_iter()
    .collect()
});

/// Error type for circuit breaker operations.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open, the operation was not invoked.
    #[error("circuit breaker {breaker} is OPEN")]
    Open {
        /// Name of the breaker that refused the call.
        breaker: String,
        /// Correlation id active when the call was refused.
        correlation_id: Option<CorrelationId>,
        /// Time left until the breaker admits a probe call.
        retry_after: Duration,
    },

    /// The operation did not settle before the breaker's timeout.
    #[error("circuit breaker {breaker} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Name of the breaker that timed the call out.
        breaker: String,
        /// The timeout that elapsed.
        timeout: Duration,
        /// Correlation id active when the call was made.
        correlation_id: Option<CorrelationId>,
    },

    /// The underlying operation failed.
    #[error("operation failed: {0}")]
    Operation(#[source] E),
}

impl<E> BreakerError<E> {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            BreakerError::Open { .. } => "CIRCUIT_OPEN",
            BreakerError::Timeout { .. } => "TIMEOUT",
            BreakerError::Operation(_) => "OPERATION_FAILED",
        }
    }

    /// Returns true if the call was refused because the circuit is open.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Returns true if the call timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }

    /// Name of the breaker for errors raised by the breaker itself.
    pub fn breaker_name(&self) -> Option<&str> {
        match self {
            BreakerError::Open { breaker, .. } | BreakerError::Timeout { breaker, .. } => {
                Some(breaker)
            }
            BreakerError::Operation(_) => None,
        }
    }

    /// Correlation id captured when the breaker rejected or timed out the call.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        match self {
            BreakerError::Open { correlation_id, .. }
            | BreakerError::Timeout { correlation_id, .. } => correlation_id.as_ref(),
            BreakerError::Operation(_) => None,
        }
    }

    /// Borrows the operation's own error, if that is what failed.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }

    /// Consumes the error, returning the operation's own error if present.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            BreakerError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

impl<E: Display> BreakerError<E> {
    /// Structured representation for logs and API error bodies.
    pub fn to_json(&self) -> Value {
        json!({
            "name": "CircuitBreakerError",
            "code": self.code(),
            "message": self.to_string(),
            "breakerName": self.breaker_name(),
            "correlationId": self.correlation_id().map(CorrelationId::as_str),
        })
    }
}

/// Failure reported by a network-dependent operation such as a remote API call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    code: Option<String>,
    status: Option<u16>,
    message: String,
}

impl RemoteError {
    /// Code used for explicit rate-limit signals.
    pub const RATE_LIMITED: &'static str = "RATE_LIMITED";

    /// Creates an error with only a message, e.g. a connection reset.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    /// A network-level failure (connect refused, reset, DNS).
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message).with_code("NETWORK_ERROR")
    }

    /// A response with the given HTTP-style status.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    /// The dependency rejected the request's input.
    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(message).with_code(code)
    }

    /// The dependency asked us to slow down.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_code(Self::RATE_LIMITED)
            .with_status(429)
    }

    /// Attaches a machine-readable code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attaches an HTTP-style status.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Machine-readable code, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// HTTP-style status, if any.
    pub fn http_status(&self) -> Option<u16> {
        self.status
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True when the failure was caused by the caller rather than the dependency:
    /// input validation, explicit rate limiting, or a 4xx response other than 408.
    pub fn is_caller_fault(&self) -> bool {
        if let Some(code) = self.code() {
            if code == Self::RATE_LIMITED || VALIDATION_CODES.contains(code) {
                return true;
            }
        }

        matches!(self.status, Some(s) if (400..500).contains(&s) && s != 408)
    }
}

/// An error reported by the relational store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct DbError {
    code: Option<String>,
    message: String,
}

impl DbError {
    /// SQLSTATE raised when the server broke a deadlock.
    pub const DEADLOCK_DETECTED: &'static str = "40P01";
    /// SQLSTATE raised when a serializable transaction could not be ordered.
    pub const SERIALIZATION_FAILURE: &'static str = "40001";
    /// SQLSTATE for unique constraint violations.
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    /// SQLSTATE for statements issued on a connection that no longer exists.
    pub const CONNECTION_DOES_NOT_EXIST: &'static str = "08003";

    /// Creates an error carrying a SQLSTATE code.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Creates an error without a SQLSTATE code.
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// A deadlock detected by the server.
    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::new(Self::DEADLOCK_DETECTED, message)
    }

    /// A serialization failure under REPEATABLE READ or SERIALIZABLE.
    pub fn serialization_failure(message: impl Into<String>) -> Self {
        Self::new(Self::SERIALIZATION_FAILURE, message)
    }

    pub(crate) fn connection_released() -> Self {
        Self::new(
            Self::CONNECTION_DOES_NOT_EXIST,
            "connection was already released back to the pool",
        )
    }

    /// SQLSTATE code, if the driver reported one.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The two-character SQLSTATE class.
    pub fn class(&self) -> Option<&str> {
        self.code().and_then(|c| c.get(..2))
    }

    /// Deadlocks and serialization failures succeed when retried from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            Some(Self::DEADLOCK_DETECTED) | Some(Self::SERIALIZATION_FAILURE)
        )
    }

    /// Data exceptions (class 22) and integrity violations (class 23) are caused by
    /// the statement's input, not by the database being unhealthy.
    pub fn is_caller_fault(&self) -> bool {
        matches!(self.class(), Some("22") | Some("23"))
    }
}

/// The step of a transaction at which it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    /// Checking a connection out of the pool.
    Acquire,
    /// Issuing BEGIN or setting the isolation level.
    Begin,
    /// Running the caller's unit of work.
    UnitOfWork,
    /// Issuing COMMIT.
    Commit,
}

impl Display for TransactionStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStage::Acquire => write!(f, "acquire"),
            TransactionStage::Begin => write!(f, "begin"),
            TransactionStage::UnitOfWork => write!(f, "unit of work"),
            TransactionStage::Commit => write!(f, "commit"),
        }
    }
}

/// A transactional unit of work failed and was rolled back.
#[derive(Debug, Error)]
#[error("transaction {transaction_id} failed during {stage}")]
pub struct TransactionError {
    transaction_id: TransactionId,
    correlation_id: Option<CorrelationId>,
    stage: TransactionStage,
    #[source]
    source: BoxError,
    rollback_error: Option<DbError>,
}

impl TransactionError {
    pub(crate) fn new(
        transaction_id: TransactionId,
        correlation_id: Option<CorrelationId>,
        stage: TransactionStage,
        source: BoxError,
    ) -> Self {
        Self {
            transaction_id,
            correlation_id,
            stage,
            source,
            rollback_error: None,
        }
    }

    pub(crate) fn with_rollback_error(mut self, error: Option<DbError>) -> Self {
        self.rollback_error = error;
        self
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        "TRANSACTION_FAILED"
    }

    /// Id of the failed transaction.
    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    /// Correlation id the transaction ran under.
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    /// Step at which the transaction failed.
    pub fn stage(&self) -> TransactionStage {
        self.stage
    }

    /// The original failure.
    pub fn cause(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.source.as_ref()
    }

    /// Set when ROLLBACK itself failed after the original failure.
    pub fn rollback_error(&self) -> Option<&DbError> {
        self.rollback_error.as_ref()
    }

    /// The first database error in the cause chain.
    pub fn db_error(&self) -> Option<&DbError> {
        find_in_chain::<DbError>(self.source.as_ref())
    }

    /// True when the cause chain holds a deadlock or serialization failure.
    pub fn is_retryable(&self) -> bool {
        self.db_error().is_some_and(DbError::is_retryable)
    }

    /// Structured representation for logs and API error bodies.
    pub fn to_json(&self) -> Value {
        let db = self.db_error();
        json!({
            "name": "TransactionError",
            "code": self.code(),
            "message": self.to_string(),
            "transactionId": self.transaction_id.as_str(),
            "correlationId": self.correlation_id.as_ref().map(CorrelationId::as_str),
            "stage": self.stage.to_string(),
            "originalMessage": self.source.to_string(),
            "originalCode": db.and_then(DbError::code),
            "rollbackError": self.rollback_error.as_ref().map(ToString::to_string),
        })
    }
}

/// A sub-operation of a savepoint sequence failed.
#[derive(Debug, Error)]
#[error("operation {index} failed inside savepoint {savepoint}")]
pub struct SavepointError {
    index: usize,
    savepoint: String,
    #[source]
    source: BoxError,
}

impl SavepointError {
    pub(crate) fn new(index: usize, savepoint: impl Into<String>, source: BoxError) -> Self {
        Self {
            index,
            savepoint: savepoint.into(),
            source,
        }
    }

    /// Zero-based position of the failed operation.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name of the savepoint that was rolled back to.
    pub fn savepoint(&self) -> &str {
        &self.savepoint
    }
}

/// Walks an error's `source()` chain looking for a concrete error type.
pub(crate) fn find_in_chain<'a, T>(error: &'a (dyn StdError + 'static)) -> Option<&'a T>
where
    T: StdError + 'static,
{
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}
