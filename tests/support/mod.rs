//! In-memory connection pool that simulates transactional statements.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience_core::{Connection, ConnectionPool, DbError, QueryResult, SqlValue};

struct FailRule {
    pattern: String,
    error: DbError,
    remaining: usize,
}

#[derive(Default)]
struct Shared {
    statements: Mutex<Vec<String>>,
    committed: Mutex<BTreeSet<String>>,
    rules: Mutex<Vec<FailRule>>,
    delays: Mutex<Vec<(String, Duration)>>,
    connect_error: Mutex<Option<DbError>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl Shared {
    fn take_failure(&self, sql: &str) -> Option<DbError> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.remaining > 0 && sql.contains(&r.pattern))?;
        rule.remaining -= 1;
        Some(rule.error.clone())
    }

    fn delay_for(&self, sql: &str) -> Option<Duration> {
        self.delays
            .lock()
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, delay)| *delay)
    }
}

/// Pool whose connections keep uncommitted inserts per connection and apply
/// them to a shared committed set on `COMMIT`. Inserts outside `BEGIN`
/// autocommit.
#[derive(Clone, Default)]
pub struct MockPool {
    shared: Arc<Shared>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-commits a row key.
    pub fn seed(&self, key: &str) {
        self.shared.committed.lock().insert(key.to_owned());
    }

    /// Makes the next `times` statements containing `pattern` fail with `error`.
    pub fn fail_on(&self, pattern: &str, error: DbError, times: usize) {
        self.shared.rules.lock().push(FailRule {
            pattern: pattern.to_owned(),
            error,
            remaining: times,
        });
    }

    /// Makes every statement containing `pattern` wait `delay` before replying.
    pub fn delay_on(&self, pattern: &str, delay: Duration) {
        self.shared.delays.lock().push((pattern.to_owned(), delay));
    }

    pub fn fail_connect(&self, error: DbError) {
        *self.shared.connect_error.lock() = Some(error);
    }

    pub fn statements(&self) -> Vec<String> {
        self.shared.statements.lock().clone()
    }

    pub fn committed(&self) -> Vec<String> {
        self.shared.committed.lock().iter().cloned().collect()
    }

    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    type Connection = MockConnection;

    async fn connect(&self) -> Result<MockConnection, DbError> {
        if let Some(error) = self.shared.connect_error.lock().clone() {
            return Err(error);
        }
        self.shared.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            shared: Arc::clone(&self.shared),
            tx: Mutex::new(TxState::default()),
        })
    }
}

#[derive(Default)]
struct TxState {
    open: bool,
    pending: Vec<String>,
    savepoints: Vec<(String, usize)>,
}

pub struct MockConnection {
    shared: Arc<Shared>,
    tx: Mutex<TxState>,
}

fn key_of(params: &[SqlValue]) -> String {
    match params.first() {
        Some(SqlValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, params: &[SqlValue]) -> Result<QueryResult, DbError> {
        self.shared.statements.lock().push(sql.to_owned());
        if let Some(delay) = self.shared.delay_for(sql) {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.shared.take_failure(sql) {
            return Err(error);
        }

        let mut tx = self.tx.lock();
        let mut rows_affected = 0;

        if sql == "BEGIN" || sql == "ROLLBACK" {
            tx.open = sql == "BEGIN";
            tx.pending.clear();
            tx.savepoints.clear();
        } else if sql == "COMMIT" {
            tx.open = false;
            let pending = std::mem::take(&mut tx.pending);
            self.shared.committed.lock().extend(pending);
            tx.savepoints.clear();
        } else if let Some(name) = sql.strip_prefix("ROLLBACK TO SAVEPOINT ") {
            if let Some(pos) = tx.savepoints.iter().position(|(n, _)| n == name) {
                let mark = tx.savepoints[pos].1;
                tx.pending.truncate(mark);
                tx.savepoints.truncate(pos + 1);
            }
        } else if let Some(name) = sql.strip_prefix("RELEASE SAVEPOINT ") {
            if let Some(pos) = tx.savepoints.iter().position(|(n, _)| n == name) {
                tx.savepoints.truncate(pos);
            }
        } else if let Some(name) = sql.strip_prefix("SAVEPOINT ") {
            let mark = tx.pending.len();
            tx.savepoints.push((name.to_owned(), mark));
        } else if sql.starts_with("INSERT") {
            let key = key_of(params);
            if tx.pending.contains(&key) || self.shared.committed.lock().contains(&key) {
                return Err(DbError::new(
                    DbError::UNIQUE_VIOLATION,
                    format!("duplicate key value violates unique constraint: {key}"),
                ));
            }
            if tx.open {
                tx.pending.push(key);
            } else {
                self.shared.committed.lock().insert(key);
            }
            rows_affected = 1;
        }

        Ok(QueryResult {
            rows: Vec::new(),
            rows_affected,
        })
    }

    fn release(&self) {
        self.shared.released.fetch_add(1, Ordering::SeqCst);
    }
}
