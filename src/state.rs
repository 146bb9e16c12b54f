//! Circuit breaker state machine implementation.

use std::fmt::{self, Display, Formatter};
use std::sync::atomic::Ordering;

use atomic::Atomic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Represents the possible states of a circuit breaker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Circuit is closed and operations are allowed.
    Closed = 0,

    /// Circuit is open and operations are rejected.
    Open = 1,

    /// Circuit is admitting calls to test whether the dependency recovered.
    HalfOpen = 2,
}

impl State {
    /// Upper-case label used in logs, metrics and status snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Closed => "CLOSED",
            State::Open => "OPEN",
            State::HalfOpen => "HALF_OPEN",
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionCause {
    /// The rolling failure window reached the failure threshold.
    FailureThreshold,
    /// The reset timeout elapsed and a call was admitted as a probe.
    ResetTimeoutElapsed,
    /// A call failed while half-open.
    ProbeFailed,
    /// Enough calls succeeded while half-open.
    ProbesSucceeded,
    /// An operator called `open()` or `reset()`.
    Manual,
}

/// A recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    /// Name of the breaker that transitioned.
    pub breaker: String,
    /// State before the transition.
    pub from: State,
    /// State after the transition.
    pub to: State,
    /// What triggered it.
    pub cause: TransitionCause,
    /// Wall-clock time of the transition.
    pub timestamp: DateTime<Utc>,
}

/// Lock-free mirror of the breaker's state.
///
/// Writes happen only while the breaker's core lock is held, so readers never
/// see a state that disagrees with the failure window for longer than one call.
pub(crate) struct StateManager {
    state: Atomic<State>,
}

impl StateManager {
    /// Creates a new state manager with the default closed state.
    pub(crate) fn new() -> Self {
        Self {
            state: Atomic::new(State::Closed),
        }
    }

    /// Gets the current state.
    pub(crate) fn current(&self) -> State {
        self.state.load(Ordering::Acquire)
    }

    /// Stores `to`, returning the state it replaced.
    pub(crate) fn replace(&self, to: State) -> State {
        self.state.swap(to, Ordering::AcqRel)
    }
}
