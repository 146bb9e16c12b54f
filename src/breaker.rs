//! Core circuit breaker implementation.

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::config::{BreakerBuilder, BreakerConfig};
use crate::correlation::{self, CorrelationId};
use crate::error::{BreakerError, BreakerResult};
use crate::hook::HookRegistry;
use crate::metrics::{BreakerStats, CallOutcome, FailureWindow, MetricSink};
use crate::policy::FailurePredicate;
use crate::state::{State, StateManager, StateTransition, TransitionCause};
use crate::status::{
    BreakerHealth, BreakerStatus, ConfigSnapshot, MetricsSnapshot, RECENT_TRANSITIONS,
};

/// Transitions kept in memory per breaker.
const TRANSITION_LOG_CAPACITY: usize = 20;

/// Free-form context attached to a call, used only for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallContext(Map<String, Value>);

impl CallContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Reads an entry.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// True when no entries were added.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for CallContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Value::Object(self.0.clone()))
    }
}

/// Mutable bookkeeping guarded by a single lock. Never held across an await.
struct BreakerCore {
    window: FailureWindow,
    half_open_successes: u32,
    next_attempt_at: Instant,
    next_attempt_time: Option<DateTime<Utc>>,
    transitions: VecDeque<StateTransition>,
}

/// Inner state of the circuit breaker, shared between clones.
struct BreakerInner<E> {
    name: String,
    config: BreakerConfig,
    state_manager: StateManager,
    core: Mutex<BreakerCore>,
    stats: BreakerStats,
    is_failure: FailurePredicate<E>,
    metric_sink: Arc<dyn MetricSink>,
    hooks: Arc<HookRegistry>,
}

/// A transition decided under the lock, reported after it is released.
struct PendingTransition {
    transition: StateTransition,
    recent_failures: usize,
}

enum Admission {
    Admit(Option<PendingTransition>),
    Reject {
        retry_after: Duration,
        recent_failures: usize,
    },
}

/// Guards one named dependency against cascading failure.
///
/// Cloning is cheap and every clone shares the same state, so one breaker per
/// dependency can be handed to every caller that talks to it.
pub struct CircuitBreaker<E>
where
    E: StdError + 'static,
{
    inner: Arc<BreakerInner<E>>,
}

impl<E> CircuitBreaker<E>
where
    E: StdError + 'static,
{
    pub(crate) fn new(
        name: String,
        config: BreakerConfig,
        is_failure: FailurePredicate<E>,
        metric_sink: Arc<dyn MetricSink>,
        hooks: Arc<HookRegistry>,
    ) -> Self {
        tracing::info!(
            breaker = %name,
            failure_threshold = config.failure_threshold,
            success_threshold = config.success_threshold,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            timeout_ms = config.timeout.as_millis() as u64,
            "circuit breaker initialized"
        );

        let core = BreakerCore {
            window: FailureWindow::new(config.monitoring_period),
            half_open_successes: 0,
            next_attempt_at: Instant::now(),
            next_attempt_time: None,
            transitions: VecDeque::with_capacity(TRANSITION_LOG_CAPACITY),
        };

        let inner = BreakerInner {
            name,
            config,
            state_manager: StateManager::new(),
            core: Mutex::new(core),
            stats: BreakerStats::new(),
            is_failure,
            metric_sink,
            hooks,
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// Creates a new builder for customizing a circuit breaker.
    pub fn builder(name: impl Into<String>) -> BreakerBuilder<E> {
        BreakerBuilder::new(name)
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The effective configuration.
    pub fn config(&self) -> &BreakerConfig {
        &self.inner.config
    }

    /// Gets the current state of the circuit breaker.
    pub fn current_state(&self) -> State {
        self.inner.state_manager.current()
    }

    /// Executes `operation` with no call context.
    pub async fn call<F, Fut, T>(&self, operation: F) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute(operation, &CallContext::default()).await
    }

    /// Executes `operation` under the breaker's protection.
    ///
    /// Refused with [`BreakerError::Open`] while the circuit is open, in which
    /// case `operation` is never invoked. Otherwise the operation races the
    /// configured timeout; on expiry its future is dropped and the call fails
    /// with [`BreakerError::Timeout`].
    pub async fn execute<F, Fut, T>(
        &self,
        operation: F,
        context: &CallContext,
    ) -> BreakerResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.inner.stats.record_call();
        let correlation_id = correlation::get();

        self.admit(context, correlation_id.as_ref())?;

        let started = Instant::now();
        match tokio::time::timeout(self.inner.config.timeout, operation()).await {
            Ok(Ok(value)) => {
                self.on_success(started.elapsed());
                Ok(value)
            }
            Ok(Err(error)) => {
                if (self.inner.is_failure)(&error) {
                    self.on_failure(
                        error.to_string(),
                        CallOutcome::Failure,
                        started.elapsed(),
                        context,
                        correlation_id.as_ref(),
                    );
                } else {
                    self.on_ignored(&error, started.elapsed(), correlation_id.as_ref());
                }
                Err(BreakerError::Operation(error))
            }
            Err(_elapsed) => {
                let timeout = self.inner.config.timeout;
                self.on_failure(
                    format!("timed out after {}ms", timeout.as_millis()),
                    CallOutcome::Timeout,
                    started.elapsed(),
                    context,
                    correlation_id.as_ref(),
                );
                Err(BreakerError::Timeout {
                    breaker: self.inner.name.clone(),
                    timeout,
                    correlation_id,
                })
            }
        }
    }

    /// Decides whether a call may run, moving an expired open circuit to half-open.
    fn admit(
        &self,
        context: &CallContext,
        correlation_id: Option<&CorrelationId>,
    ) -> Result<(), BreakerError<E>> {
        let now = Instant::now();
        let admission = {
            let mut core = self.inner.core.lock();
            match self.inner.state_manager.current() {
                State::Open if now < core.next_attempt_at => Admission::Reject {
                    retry_after: core.next_attempt_at - now,
                    recent_failures: core.window.count_recent(now),
                },
                State::Open => Admission::Admit(Some(self.transition_locked(
                    &mut core,
                    State::HalfOpen,
                    TransitionCause::ResetTimeoutElapsed,
                    now,
                ))),
                State::Closed | State::HalfOpen => Admission::Admit(None),
            }
        };

        match admission {
            Admission::Admit(pending) => {
                if let Some(pending) = pending {
                    self.after_transition(pending);
                }
                Ok(())
            }
            Admission::Reject {
                retry_after,
                recent_failures,
            } => {
                self.inner.stats.record_rejection();
                self.inner.metric_sink.record_rejection(&self.inner.name);

                tracing::warn!(
                    breaker = %self.inner.name,
                    context = %context,
                    correlation_id = ?correlation_id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    recent_failures,
                    "circuit breaker is OPEN, request rejected"
                );
                self.inner.hooks.execute_rejected_hook(&self.inner.name);

                Err(BreakerError::Open {
                    breaker: self.inner.name.clone(),
                    correlation_id: correlation_id.cloned(),
                    retry_after,
                })
            }
        }
    }

    fn on_success(&self, duration: Duration) {
        self.inner.stats.record_outcome(CallOutcome::Success);
        self.inner
            .metric_sink
            .record_call(&self.inner.name, CallOutcome::Success, duration);

        let now = Instant::now();
        let (successes, pending) = {
            let mut core = self.inner.core.lock();
            match self.inner.state_manager.current() {
                State::HalfOpen => {
                    core.half_open_successes += 1;
                    let successes = core.half_open_successes;
                    let pending = (successes >= self.inner.config.success_threshold).then(|| {
                        self.transition_locked(
                            &mut core,
                            State::Closed,
                            TransitionCause::ProbesSucceeded,
                            now,
                        )
                    });
                    (Some(successes), pending)
                }
                State::Closed => {
                    core.window.prune(now);
                    (None, None)
                }
                // A probe that settled after another probe re-opened the circuit.
                State::Open => (None, None),
            }
        };

        if let Some(successes) = successes {
            tracing::info!(
                breaker = %self.inner.name,
                successes,
                threshold = self.inner.config.success_threshold,
                "circuit breaker success in HALF_OPEN"
            );
        }
        if let Some(pending) = pending {
            self.after_transition(pending);
        }
    }

    fn on_failure(
        &self,
        summary: String,
        outcome: CallOutcome,
        duration: Duration,
        context: &CallContext,
        correlation_id: Option<&CorrelationId>,
    ) {
        self.inner.stats.record_outcome(outcome);
        self.inner
            .metric_sink
            .record_call(&self.inner.name, outcome, duration);

        let now = Instant::now();
        let (state, recent_failures, pending) = {
            let mut core = self.inner.core.lock();
            let state = self.inner.state_manager.current();
            core.window.push(now, summary.clone());

            let pending = match state {
                State::HalfOpen => Some(self.transition_locked(
                    &mut core,
                    State::Open,
                    TransitionCause::ProbeFailed,
                    now,
                )),
                State::Closed => {
                    (core.window.len() >= self.inner.config.failure_threshold as usize).then(
                        || {
                            self.transition_locked(
                                &mut core,
                                State::Open,
                                TransitionCause::FailureThreshold,
                                now,
                            )
                        },
                    )
                }
                // Late failure of a call admitted before the circuit opened.
                State::Open => None,
            };
            (state, core.window.count_recent(now), pending)
        };

        tracing::error!(
            breaker = %self.inner.name,
            state = %state,
            outcome = outcome.as_str(),
            error = %summary,
            recent_failures,
            context = %context,
            correlation_id = ?correlation_id,
            "circuit breaker recorded failure"
        );

        if let Some(pending) = pending {
            if pending.transition.cause == TransitionCause::FailureThreshold {
                tracing::warn!(
                    breaker = %self.inner.name,
                    recent_failures,
                    threshold = self.inner.config.failure_threshold,
                    "failure threshold reached"
                );
            }
            self.after_transition(pending);
        }
    }

    fn on_ignored(&self, error: &E, duration: Duration, correlation_id: Option<&CorrelationId>) {
        self.inner.stats.record_outcome(CallOutcome::Ignored);
        self.inner
            .metric_sink
            .record_call(&self.inner.name, CallOutcome::Ignored, duration);

        tracing::debug!(
            breaker = %self.inner.name,
            error = %error,
            correlation_id = ?correlation_id,
            "error excluded from failure window"
        );
    }

    /// Applies a transition and its entry actions. Caller holds the core lock.
    fn transition_locked(
        &self,
        core: &mut BreakerCore,
        to: State,
        cause: TransitionCause,
        now: Instant,
    ) -> PendingTransition {
        let from = self.inner.state_manager.replace(to);

        match to {
            State::Open => {
                let reset_timeout = self.inner.config.reset_timeout;
                core.next_attempt_at = now + reset_timeout;
                core.next_attempt_time = chrono::Duration::from_std(reset_timeout)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
                core.half_open_successes = 0;
            }
            State::HalfOpen => {
                core.half_open_successes = 0;
            }
            State::Closed => {
                core.window.clear();
                core.half_open_successes = 0;
                core.next_attempt_time = None;
            }
        }

        let transition = StateTransition {
            breaker: self.inner.name.clone(),
            from,
            to,
            cause,
            timestamp: Utc::now(),
        };

        if core.transitions.len() == TRANSITION_LOG_CAPACITY {
            core.transitions.pop_front();
        }
        core.transitions.push_back(transition.clone());

        PendingTransition {
            transition,
            recent_failures: core.window.count_recent(now),
        }
    }

    /// Logs and dispatches a transition. Runs outside the core lock.
    fn after_transition(&self, pending: PendingTransition) {
        let PendingTransition {
            transition,
            recent_failures,
        } = pending;

        tracing::warn!(
            breaker = %self.inner.name,
            from = %transition.from,
            to = %transition.to,
            cause = ?transition.cause,
            recent_failures,
            "circuit breaker state changed"
        );

        match transition.to {
            State::Open => tracing::error!(
                breaker = %self.inner.name,
                reset_timeout_ms = self.inner.config.reset_timeout.as_millis() as u64,
                recent_failures,
                "circuit breaker OPENED"
            ),
            State::HalfOpen => tracing::info!(
                breaker = %self.inner.name,
                "circuit breaker HALF_OPEN, testing dependency"
            ),
            State::Closed => tracing::info!(
                breaker = %self.inner.name,
                "circuit breaker CLOSED, dependency recovered"
            ),
        }

        self.inner.metric_sink.record_state_transition(
            &self.inner.name,
            transition.from.as_str(),
            transition.to.as_str(),
        );
        self.inner.hooks.execute_state_transition_hook(&transition);
    }

    fn force(&self, to: State) -> State {
        let now = Instant::now();
        let pending = {
            let mut core = self.inner.core.lock();
            self.transition_locked(&mut core, to, TransitionCause::Manual, now)
        };
        let previous = pending.transition.from;
        self.after_transition(pending);
        previous
    }

    /// Forces the circuit closed and clears the failure window.
    ///
    /// Returns the state the breaker was in.
    pub fn reset(&self) -> State {
        tracing::info!(
            breaker = %self.inner.name,
            previous_state = %self.current_state(),
            "circuit breaker manually reset"
        );
        self.force(State::Closed)
    }

    /// Forces the circuit open, re-arming the reset timeout.
    ///
    /// Returns the state the breaker was in.
    pub fn open(&self) -> State {
        tracing::warn!(
            breaker = %self.inner.name,
            previous_state = %self.current_state(),
            "circuit breaker manually opened"
        );
        self.force(State::Open)
    }

    /// Snapshot of state, configuration and counters. Changes nothing.
    pub fn status(&self) -> BreakerStatus {
        let now = Instant::now();
        let (state, recent_failures, next_attempt_time, recent) = {
            let core = self.inner.core.lock();
            let state = self.inner.state_manager.current();
            let skip = core.transitions.len().saturating_sub(RECENT_TRANSITIONS);
            (
                state,
                core.window.count_recent(now),
                if state == State::Open {
                    core.next_attempt_time
                } else {
                    None
                },
                core.transitions.iter().skip(skip).cloned().collect(),
            )
        };

        BreakerStatus {
            name: self.inner.name.clone(),
            state,
            is_open: state == State::Open,
            next_attempt_time,
            recent_failures,
            config: ConfigSnapshot::from(&self.inner.config),
            metrics: MetricsSnapshot::new(self.inner.stats.snapshot(), recent),
        }
    }

    /// Condensed health view derived from [`status`](Self::status).
    pub fn health(&self) -> BreakerHealth {
        BreakerHealth::from(self.status())
    }

    /// The most recent failure still inside the monitoring period.
    pub fn last_failure(&self) -> Option<String> {
        let now = Instant::now();
        let core = self.inner.core.lock();
        core.window
            .last()
            .filter(|r| now.saturating_duration_since(r.at) < self.inner.config.monitoring_period)
            .map(|r| r.summary.clone())
    }
}

// Allow cloning of circuit breakers - cheap because inner state is Arc'd
impl<E> Clone for CircuitBreaker<E>
where
    E: StdError + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
