//! Hook registry for circuit breaker events.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::state::{State, StateTransition};

type TransitionHookFn = Arc<dyn Fn(&StateTransition) + Send + Sync + 'static>;
type NamedHookFn = Arc<dyn Fn(&str) + Send + Sync + 'static>;

/// A registry for circuit breaker event hooks.
///
/// Hooks run after the breaker has released its internal lock. A panicking
/// hook is caught and logged; it never disturbs the call that triggered it.
pub struct HookRegistry {
    on_state_change: RwLock<Option<TransitionHookFn>>,
    on_open: RwLock<Option<NamedHookFn>>,
    on_close: RwLock<Option<NamedHookFn>>,
    on_half_open: RwLock<Option<NamedHookFn>>,
    on_rejected: RwLock<Option<NamedHookFn>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    /// Creates a new empty hook registry.
    pub fn new() -> Self {
        Self {
            on_state_change: RwLock::new(None),
            on_open: RwLock::new(None),
            on_close: RwLock::new(None),
            on_half_open: RwLock::new(None),
            on_rejected: RwLock::new(None),
        }
    }

    /// Sets the hook called for every transition, automatic or manual.
    pub fn set_on_state_change<F>(&self, f: F)
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        *self.on_state_change.write() = Some(Arc::new(f));
    }

    /// Sets the alerting hook called with the breaker name when it opens.
    pub fn set_on_open<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the circuit breaker closes.
    pub fn set_on_close<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_close.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when the circuit breaker half-opens.
    pub fn set_on_half_open<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_half_open.write() = Some(Arc::new(f));
    }

    /// Sets the hook to call when a call is refused by an open circuit.
    pub fn set_on_rejected<F>(&self, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        *self.on_rejected.write() = Some(Arc::new(f));
    }

    /// Copies every hook set in `other` into this registry. Slots `other`
    /// leaves empty keep their current hook.
    pub(crate) fn merge(&self, other: HookRegistry) {
        fn take<T>(slot: &RwLock<Option<T>>, from: RwLock<Option<T>>) {
            if let Some(hook) = from.into_inner() {
                *slot.write() = Some(hook);
            }
        }

        take(&self.on_state_change, other.on_state_change);
        take(&self.on_open, other.on_open);
        take(&self.on_close, other.on_close);
        take(&self.on_half_open, other.on_half_open);
        take(&self.on_rejected, other.on_rejected);
    }

    /// Executes the hooks registered for a state transition.
    pub(crate) fn execute_state_transition_hook(&self, transition: &StateTransition) {
        let generic = self.on_state_change.read().clone();
        if let Some(hook) = generic {
            guarded(&transition.breaker, "on_state_change", || hook(transition));
        }

        let specific = match transition.to {
            State::Open => self.on_open.read().clone(),
            State::Closed => self.on_close.read().clone(),
            State::HalfOpen => self.on_half_open.read().clone(),
        };
        if let Some(hook) = specific {
            guarded(&transition.breaker, "state", || hook(&transition.breaker));
        }
    }

    /// Executes the rejection hook.
    pub(crate) fn execute_rejected_hook(&self, breaker: &str) {
        let hook = self.on_rejected.read().clone();
        if let Some(hook) = hook {
            guarded(breaker, "on_rejected", || hook(breaker));
        }
    }
}

fn guarded(breaker: &str, hook: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::error!(breaker, hook, "circuit breaker hook panicked");
    }
}
