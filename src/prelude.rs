//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use resilience_core::prelude::*;
//! ```

pub use crate::breaker::{CallContext, CircuitBreaker};
pub use crate::config::{BreakerBuilder, BreakerConfig};
pub use crate::correlation::{self, CorrelationId};
pub use crate::error::{
    BoxError, BreakerError, BreakerResult, DbError, RemoteError, TransactionError,
};
pub use crate::pool::{Connection, ConnectionPool, IsolationLevel, QueryResult};
pub use crate::retry::RetryPolicy;
pub use crate::state::State;
pub use crate::transaction::{TransactionEngine, TransactionOptions, TxConnection};
