//! Failure tracking and metrics for circuit breaker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::time::Instant;

/// How a call through the breaker settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The operation returned `Ok`.
    Success,
    /// The operation failed with an error that counts against the dependency.
    Failure,
    /// The operation failed with an error the failure predicate excluded.
    Ignored,
    /// The operation did not settle before the timeout.
    Timeout,
}

impl CallOutcome {
    /// Lower-case label used by metric sinks.
    pub fn as_str(self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Ignored => "ignored",
            CallOutcome::Timeout => "timeout",
        }
    }
}

/// Trait for metrics sinks that can receive circuit breaker events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition event.
    fn record_state_transition(&self, breaker: &str, from: &str, to: &str);

    /// Records a call that was admitted and settled.
    fn record_call(&self, breaker: &str, outcome: CallOutcome, duration: Duration);

    /// Records a call refused by an open circuit.
    fn record_rejection(&self, breaker: &str);
}

/// A null metrics sink that discards all events.
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _breaker: &str, _from: &str, _to: &str) {}
    fn record_call(&self, _breaker: &str, _outcome: CallOutcome, _duration: Duration) {}
    fn record_rejection(&self, _breaker: &str) {}
}

/// Cumulative counters for one breaker. They only ever grow.
#[derive(Debug, Default)]
pub(crate) struct BreakerStats {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    ignored_count: AtomicU64,
    rejected_count: AtomicU64,
    timeout_count: AtomicU64,
    last_failure_time: Mutex<Option<DateTime<Utc>>>,
    last_success_time: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`BreakerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StatsSnapshot {
    pub(crate) total_calls: u64,
    pub(crate) success_count: u64,
    pub(crate) failure_count: u64,
    pub(crate) ignored_count: u64,
    pub(crate) rejected_count: u64,
    pub(crate) timeout_count: u64,
    pub(crate) last_failure_time: Option<DateTime<Utc>>,
    pub(crate) last_success_time: Option<DateTime<Utc>>,
}

impl BreakerStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_call(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejection(&self) {
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => {
                self.success_count.fetch_add(1, Ordering::Relaxed);
                *self.last_success_time.lock() = Some(Utc::now());
            }
            CallOutcome::Failure => {
                self.failure_count.fetch_add(1, Ordering::Relaxed);
                *self.last_failure_time.lock() = Some(Utc::now());
            }
            CallOutcome::Ignored => {
                self.ignored_count.fetch_add(1, Ordering::Relaxed);
            }
            CallOutcome::Timeout => {
                self.timeout_count.fetch_add(1, Ordering::Relaxed);
                *self.last_failure_time.lock() = Some(Utc::now());
            }
        }
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            ignored_count: self.ignored_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            last_failure_time: *self.last_failure_time.lock(),
            last_success_time: *self.last_success_time.lock(),
        }
    }
}

/// One qualifying failure held in the rolling window.
#[derive(Debug, Clone)]
pub(crate) struct FailureRecord {
    pub(crate) at: Instant,
    pub(crate) summary: String,
}

/// Failures within the monitoring period, oldest first.
///
/// Not synchronized on its own: the breaker keeps it behind its core lock.
#[derive(Debug)]
pub(crate) struct FailureWindow {
    records: SmallVec<[FailureRecord; 8]>,
    period: Duration,
}

impl FailureWindow {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            records: SmallVec::new(),
            period,
        }
    }

    /// Appends a record and prunes, so the window never outgrows the period.
    pub(crate) fn push(&mut self, at: Instant, summary: String) {
        self.records.push(FailureRecord { at, summary });
        self.prune(at);
    }

    /// Drops records that fell out of the monitoring period.
    pub(crate) fn prune(&mut self, now: Instant) {
        while let Some(record) = self.records.first() {
            if now.saturating_duration_since(record.at) >= self.period {
                self.records.remove(0);
            } else {
                break;
            }
        }
    }

    /// Number of records inside the period, without pruning.
    pub(crate) fn count_recent(&self, now: Instant) -> usize {
        self.records
            .iter()
            .filter(|r| now.saturating_duration_since(r.at) < self.period)
            .count()
    }

    pub(crate) fn last(&self) -> Option<&FailureRecord> {
        self.records.last()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_stays_bounded_by_the_period() {
        let period = Duration::from_secs(120);
        let mut window = FailureWindow::new(period);
        let start = Instant::now();

        // One failure every 100ms for far longer than the period
        for i in 0..5000u64 {
            window.push(start + Duration::from_millis(i * 100), format!("failure {i}"));
        }

        let now = start + Duration::from_millis(4999 * 100);
        assert_eq!(window.len(), 1200);
        assert_eq!(window.len(), window.count_recent(now));
        assert_eq!(window.last().map(|r| r.summary.as_str()), Some("failure 4999"));
    }
}

#[cfg(feature = "prometheus")]
pub use self::prometheus::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus {
    use std::time::Duration;

    use prometheus_client::encoding::EncodeLabelSet;
    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;

    use super::{CallOutcome, MetricSink};

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct CallLabels {
        breaker: String,
        outcome: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct BreakerLabels {
        breaker: String,
    }

    #[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
    struct TransitionLabels {
        breaker: String,
        from: String,
        to: String,
    }

    fn duration_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    /// Metric sink exporting breaker events through `prometheus-client`.
    #[derive(Debug, Clone)]
    pub struct PrometheusSink {
        calls: Family<CallLabels, Counter>,
        durations: Family<BreakerLabels, Histogram>,
        rejections: Family<BreakerLabels, Counter>,
        transitions: Family<TransitionLabels, Counter>,
    }

    impl PrometheusSink {
        /// Creates the sink and registers its metric families.
        pub fn register(registry: &mut Registry) -> Self {
            let calls = Family::<CallLabels, Counter>::default();
            let durations: Family<BreakerLabels, Histogram> =
                Family::new_with_constructor(duration_histogram as fn() -> Histogram);
            let rejections = Family::<BreakerLabels, Counter>::default();
            let transitions = Family::<TransitionLabels, Counter>::default();

            registry.register(
                "circuit_breaker_calls",
                "Calls admitted by a circuit breaker, by outcome",
                calls.clone(),
            );
            registry.register(
                "circuit_breaker_call_duration_seconds",
                "Duration of calls admitted by a circuit breaker",
                durations.clone(),
            );
            registry.register(
                "circuit_breaker_rejections",
                "Calls refused by an open circuit",
                rejections.clone(),
            );
            registry.register(
                "circuit_breaker_transitions",
                "Circuit breaker state transitions",
                transitions.clone(),
            );

            Self {
                calls,
                durations,
                rejections,
                transitions,
            }
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, breaker: &str, from: &str, to: &str) {
            self.transitions
                .get_or_create(&TransitionLabels {
                    breaker: breaker.to_owned(),
                    from: from.to_owned(),
                    to: to.to_owned(),
                })
                .inc();
        }

        fn record_call(&self, breaker: &str, outcome: CallOutcome, duration: Duration) {
            self.calls
                .get_or_create(&CallLabels {
                    breaker: breaker.to_owned(),
                    outcome: outcome.as_str().to_owned(),
                })
                .inc();
            self.durations
                .get_or_create(&BreakerLabels {
                    breaker: breaker.to_owned(),
                })
                .observe(duration.as_secs_f64());
        }

        fn record_rejection(&self, breaker: &str) {
            self.rejections
                .get_or_create(&BreakerLabels {
                    breaker: breaker.to_owned(),
                })
                .inc();
        }
    }
}
