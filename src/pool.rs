//! Connection-pool abstraction the transaction engine runs on.
//!
//! The engine never talks to a database driver directly. A deployment adapts
//! its driver's pool to [`ConnectionPool`] and its checked-out client to
//! [`Connection`].

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DbError;

/// A bind parameter.
pub type SqlValue = Value;

/// A result row keyed by column name.
pub type Row = Map<String, Value>;

/// Rows returned by a statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Returned rows, empty for statements without a result set.
    pub rows: Vec<Row>,
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
}

/// A connection checked out of a pool.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Runs one statement.
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError>;

    /// Returns the connection to its pool. Called exactly once per checkout.
    fn release(&self);
}

/// A pool handing out exclusively-owned connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// Connection type handed out by this pool.
    type Connection: Connection;

    /// Checks a connection out, waiting while the pool is exhausted.
    async fn connect(&self) -> Result<Self::Connection, DbError>;
}

/// Standard SQL isolation levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// READ UNCOMMITTED.
    ReadUncommitted,
    /// READ COMMITTED, the usual connection default.
    #[default]
    ReadCommitted,
    /// REPEATABLE READ.
    RepeatableRead,
    /// SERIALIZABLE.
    Serializable,
}

impl IsolationLevel {
    /// The level as it appears in `SET TRANSACTION ISOLATION LEVEL`.
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl Display for IsolationLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}
