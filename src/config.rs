//! Configuration for circuit breakers.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::hook::HookRegistry;
use crate::metrics::{MetricSink, NullMetricSink};
use crate::policy::{default_is_failure, FailurePredicate};
use crate::state::StateTransition;

/// Tunables of a single breaker.
///
/// Deserializable so it can live in the service's config file; durations use
/// humantime notation (`"30s"`, `"2m"`). A zero value falls back to its default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within `monitoring_period` that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Per-call timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Length of the rolling failure window.
    #[serde(with = "humantime_serde")]
    pub monitoring_period: Duration,
}

impl BreakerConfig {
    const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
    const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_secs(60);
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
    const DEFAULT_MONITORING_PERIOD: Duration = Duration::from_secs(120);

    /// Replaces zero values with their defaults.
    pub fn normalized(self) -> Self {
        fn or_count(value: u32, default: u32) -> u32 {
            if value == 0 {
                default
            } else {
                value
            }
        }
        fn or_duration(value: Duration, default: Duration) -> Duration {
            if value.is_zero() {
                default
            } else {
                value
            }
        }

        Self {
            failure_threshold: or_count(self.failure_threshold, Self::DEFAULT_FAILURE_THRESHOLD),
            success_threshold: or_count(self.success_threshold, Self::DEFAULT_SUCCESS_THRESHOLD),
            reset_timeout: or_duration(self.reset_timeout, Self::DEFAULT_RESET_TIMEOUT),
            timeout: or_duration(self.timeout, Self::DEFAULT_TIMEOUT),
            monitoring_period: or_duration(
                self.monitoring_period,
                Self::DEFAULT_MONITORING_PERIOD,
            ),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::DEFAULT_FAILURE_THRESHOLD,
            success_threshold: Self::DEFAULT_SUCCESS_THRESHOLD,
            reset_timeout: Self::DEFAULT_RESET_TIMEOUT,
            timeout: Self::DEFAULT_TIMEOUT,
            monitoring_period: Self::DEFAULT_MONITORING_PERIOD,
        }
    }
}

/// Builder for creating circuit breakers with custom configurations.
pub struct BreakerBuilder<E>
where
    E: StdError + 'static,
{
    name: String,
    config: BreakerConfig,
    is_failure: Option<FailurePredicate<E>>,
    metric_sink: Arc<dyn MetricSink>,
    hook_registry: Arc<HookRegistry>,
}

impl<E> BreakerBuilder<E>
where
    E: StdError + 'static,
{
    /// Creates a new builder with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            is_failure: None,
            metric_sink: Arc::new(NullMetricSink),
            hook_registry: Arc::new(HookRegistry::new()),
        }
    }

    /// Replaces every tunable with the values from `config`.
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of failures within the monitoring period that trips the circuit.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Sets the number of half-open successes required to close the circuit.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Sets how long the circuit stays open before admitting a probe.
    pub fn reset_timeout(mut self, duration: Duration) -> Self {
        self.config.reset_timeout = duration;
        self
    }

    /// Sets the per-call timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    /// Sets the length of the rolling failure window.
    pub fn monitoring_period(mut self, duration: Duration) -> Self {
        self.config.monitoring_period = duration;
        self
    }

    /// Overrides which operation errors count toward the failure window.
    pub fn is_failure<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.is_failure = Some(Arc::new(predicate));
        self
    }

    /// Registers a callback for every state transition.
    pub fn on_state_change<F>(self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.hook_registry.set_on_state_change(f);
        self
    }

    /// Registers the alerting callback invoked when the circuit opens.
    pub fn on_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hook_registry.set_on_open(f);
        self
    }

    /// Sets a metric sink for the circuit breaker.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Adds the hooks set in `hooks`.
    ///
    /// Merges with callbacks registered earlier through
    /// [`on_state_change`](Self::on_state_change) or [`on_open`](Self::on_open);
    /// a hook set in both places is taken from `hooks`.
    pub fn hooks(self, hooks: HookRegistry) -> Self {
        self.hook_registry.merge(hooks);
        self
    }

    /// Builds the circuit breaker.
    pub fn build(self) -> CircuitBreaker<E> {
        let is_failure: FailurePredicate<E> = match self.is_failure {
            Some(predicate) => predicate,
            None => Arc::new(default_is_failure::<E>),
        };

        CircuitBreaker::new(
            self.name,
            self.config.normalized(),
            is_failure,
            self.metric_sink,
            self.hook_registry,
        )
    }
}
