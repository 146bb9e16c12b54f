//! Registry of transactions whose connection is currently checked out.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::correlation::CorrelationId;
use crate::pool::IsolationLevel;
use crate::transaction::{Lease, TransactionId};

/// Introspection view of one active transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTransactionInfo {
    /// Transaction id.
    pub id: TransactionId,
    /// Correlation id the transaction runs under.
    pub correlation_id: Option<CorrelationId>,
    /// Isolation level requested for the transaction.
    pub isolation_level: IsolationLevel,
    /// Wall-clock start time.
    pub start_time: DateTime<Utc>,
    /// Time since start, in milliseconds.
    pub duration_ms: u64,
}

pub(crate) struct ActiveTransaction<C> {
    pub(crate) lease: Arc<Lease<C>>,
    pub(crate) correlation_id: Option<CorrelationId>,
    pub(crate) isolation_level: IsolationLevel,
    pub(crate) started_at: Instant,
    pub(crate) start_time: DateTime<Utc>,
}

impl<C> ActiveTransaction<C> {
    fn info(&self, id: &TransactionId, now: Instant) -> ActiveTransactionInfo {
        ActiveTransactionInfo {
            id: id.clone(),
            correlation_id: self.correlation_id.clone(),
            isolation_level: self.isolation_level,
            start_time: self.start_time,
            duration_ms: now.saturating_duration_since(self.started_at).as_millis() as u64,
        }
    }
}

/// An entry is present exactly while its connection is checked out.
pub(crate) struct ActiveRegistry<C> {
    entries: Mutex<AHashMap<TransactionId, ActiveTransaction<C>>>,
}

impl<C> ActiveRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(AHashMap::new()),
        }
    }

    pub(crate) fn insert(&self, id: TransactionId, entry: ActiveTransaction<C>) {
        self.entries.lock().insert(id, entry);
    }

    pub(crate) fn remove(&self, id: &TransactionId) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// All entries, oldest first.
    pub(crate) fn infos(&self) -> Vec<ActiveTransactionInfo> {
        let now = Instant::now();
        let mut infos: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| entry.info(id, now))
            .collect();
        infos.sort_by_key(|info| std::cmp::Reverse(info.duration_ms));
        infos
    }

    /// Entries running for longer than `threshold`, oldest first.
    pub(crate) fn older_than(
        &self,
        threshold: Duration,
    ) -> Vec<(ActiveTransactionInfo, Arc<Lease<C>>)> {
        let now = Instant::now();
        let mut found: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.started_at) > threshold)
            .map(|(id, entry)| (entry.info(id, now), Arc::clone(&entry.lease)))
            .collect();
        found.sort_by_key(|(info, _)| std::cmp::Reverse(info.duration_ms));
        found
    }
}
