//! Serializable status snapshots for health endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::BreakerConfig;
use crate::metrics::StatsSnapshot;
use crate::state::{State, StateTransition};

/// Number of transitions included in a status snapshot.
pub(crate) const RECENT_TRANSITIONS: usize = 5;

/// Full status of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: State,
    /// Shorthand for `state == Open`.
    pub is_open: bool,
    /// When an open circuit admits its next probe.
    pub next_attempt_time: Option<DateTime<Utc>>,
    /// Failures currently inside the monitoring period.
    pub recent_failures: usize,
    /// Effective configuration.
    pub config: ConfigSnapshot,
    /// Cumulative counters.
    pub metrics: MetricsSnapshot,
}

/// Effective configuration in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// Failures within the monitoring period that open the circuit.
    pub failure_threshold: u32,
    /// Half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Open duration before a probe is admitted.
    pub reset_timeout_ms: u64,
    /// Per-call timeout.
    pub timeout_ms: u64,
    /// Rolling failure window length.
    pub monitoring_period_ms: u64,
}

impl From<&BreakerConfig> for ConfigSnapshot {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            reset_timeout_ms: config.reset_timeout.as_millis() as u64,
            timeout_ms: config.timeout.as_millis() as u64,
            monitoring_period_ms: config.monitoring_period.as_millis() as u64,
        }
    }
}

/// Cumulative call counters and derived rates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Every call attempt, including rejected ones.
    pub total_requests: u64,
    /// Calls whose operation returned `Ok`.
    pub successful_requests: u64,
    /// Calls whose operation failed with a qualifying error.
    pub failed_requests: u64,
    /// Calls whose error was excluded by the failure predicate.
    pub ignored_errors: u64,
    /// Calls refused by an open circuit.
    pub rejected_requests: u64,
    /// Calls that exceeded the timeout.
    pub timeouts: u64,
    /// Time of the last failure or timeout.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Time of the last success.
    pub last_success_time: Option<DateTime<Utc>>,
    /// Successful share of all requests, in percent.
    pub success_rate: Option<f64>,
    /// Failed share of all requests, in percent.
    pub failure_rate: Option<f64>,
    /// Rejected share of all requests, in percent.
    pub rejection_rate: Option<f64>,
    /// Most recent transitions, oldest first.
    pub recent_state_changes: Vec<StateTransition>,
}

impl MetricsSnapshot {
    pub(crate) fn new(stats: StatsSnapshot, recent_state_changes: Vec<StateTransition>) -> Self {
        let rate = |count: u64| {
            (stats.total_calls > 0).then(|| {
                let percent = count as f64 * 100.0 / stats.total_calls as f64;
                (percent * 100.0).round() / 100.0
            })
        };

        Self {
            total_requests: stats.total_calls,
            successful_requests: stats.success_count,
            failed_requests: stats.failure_count,
            ignored_errors: stats.ignored_count,
            rejected_requests: stats.rejected_count,
            timeouts: stats.timeout_count,
            last_failure_time: stats.last_failure_time,
            last_success_time: stats.last_success_time,
            success_rate: rate(stats.success_count),
            failure_rate: rate(stats.failure_count),
            rejection_rate: rate(stats.rejected_count),
            recent_state_changes,
        }
    }
}

/// Condensed view for health checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerHealth {
    /// The circuit is closed.
    pub healthy: bool,
    /// Current state.
    pub state: State,
    /// The circuit is probing recovery.
    pub degraded: bool,
    /// The circuit is open.
    pub down: bool,
    /// Failures currently inside the monitoring period.
    pub recent_failures: usize,
    /// Cumulative counters.
    pub metrics: MetricsSnapshot,
}

impl From<BreakerStatus> for BreakerHealth {
    fn from(status: BreakerStatus) -> Self {
        Self {
            healthy: status.state == State::Closed,
            state: status.state,
            degraded: status.state == State::HalfOpen,
            down: status.state == State::Open,
            recent_failures: status.recent_failures,
            metrics: status.metrics,
        }
    }
}
