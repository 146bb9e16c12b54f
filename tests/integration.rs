use parking_lot::Mutex;
use proptest::prelude::*;
use resilience_core::{
    correlation, BreakerConfig, BreakerError, CallContext, CircuitBreaker, CorrelationId,
    DbError, HookRegistry, RemoteError, State, TransitionCause,
};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_breaker(name: &str) -> CircuitBreaker<RemoteError> {
    CircuitBreaker::<RemoteError>::builder(name)
        .failure_threshold(3)
        .success_threshold(2)
        .reset_timeout(Duration::from_millis(1000))
        .timeout(Duration::from_millis(500))
        .build()
}

async fn fail(breaker: &CircuitBreaker<RemoteError>) -> BreakerError<RemoteError> {
    breaker
        .call(|| async { Err::<(), _>(RemoteError::status(503, "service unavailable")) })
        .await
        .unwrap_err()
}

async fn succeed(
    breaker: &CircuitBreaker<RemoteError>,
) -> Result<&'static str, BreakerError<RemoteError>> {
    breaker.call(|| async { Ok::<_, RemoteError>("ok") }).await
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_basic_functionality() {
    let breaker = test_breaker("sms");
    assert_eq!(breaker.current_state(), State::Closed);

    // Two failures stay below the threshold
    assert!(matches!(fail(&breaker).await, BreakerError::Operation(_)));
    assert!(matches!(fail(&breaker).await, BreakerError::Operation(_)));
    assert_eq!(breaker.current_state(), State::Closed);

    // Third failure trips the breaker
    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Open);

    // Call while open fails immediately without invoking the operation
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let err = breaker
        .call(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, RemoteError>(())
        })
        .await
        .unwrap_err();
    assert!(err.is_open());
    assert_eq!(err.code(), "CIRCUIT_OPEN");
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // After the reset timeout the next call is a probe
    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(succeed(&breaker).await.unwrap(), "ok");
    assert_eq!(breaker.current_state(), State::HalfOpen);

    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.current_state(), State::Closed);

    let status = breaker.status();
    assert_eq!(status.recent_failures, 0);
    assert_eq!(status.metrics.total_requests, 6);
    assert_eq!(status.metrics.successful_requests, 2);
    assert_eq!(status.metrics.failed_requests, 3);
    assert_eq!(status.metrics.rejected_requests, 1);

    let path: Vec<(State, State)> = status
        .metrics
        .recent_state_changes
        .iter()
        .map(|t| (t.from, t.to))
        .collect();
    assert_eq!(
        path,
        vec![
            (State::Closed, State::Open),
            (State::Open, State::HalfOpen),
            (State::HalfOpen, State::Closed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_half_open_failure() {
    let breaker = test_breaker("email");
    for _ in 0..3 {
        fail(&breaker).await;
    }
    assert_eq!(breaker.current_state(), State::Open);

    tokio::time::advance(Duration::from_millis(1001)).await;

    // A failing probe re-opens the circuit immediately
    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Open);

    let status = breaker.status();
    let last = status.metrics.recent_state_changes.last().unwrap();
    assert_eq!(last.cause, TransitionCause::ProbeFailed);
    assert!(status.next_attempt_time.is_some());

    // The reset timeout is re-armed from the probe failure
    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(succeed(&breaker).await.unwrap_err().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_late_probe_success_does_not_close_reopened_circuit() {
    let breaker = CircuitBreaker::<RemoteError>::builder("concurrent-probes")
        .failure_threshold(1)
        .success_threshold(1)
        .reset_timeout(Duration::from_millis(1000))
        .timeout(Duration::from_millis(500))
        .build();
    fail(&breaker).await;
    tokio::time::advance(Duration::from_millis(1001)).await;

    // Both probes are admitted; the quick one fails while the slow one is pending
    let slow = breaker.call(|| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok::<_, RemoteError>("late")
    });
    let (slow, quick) = tokio::join!(slow, fail(&breaker));

    assert_eq!(slow.unwrap(), "late");
    assert!(matches!(quick, BreakerError::Operation(_)));
    assert_eq!(breaker.current_state(), State::Open);

    let status = breaker.status();
    assert_eq!(status.metrics.successful_requests, 1);
    assert_eq!(status.metrics.failed_requests, 2);
    let changes = &status.metrics.recent_state_changes;
    assert_eq!(changes.last().unwrap().cause, TransitionCause::ProbeFailed);
    assert!(!changes
        .iter()
        .any(|t| t.from == State::HalfOpen && t.to == State::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_reset_timeout_scenario() {
    let breaker = test_breaker("scenario");
    for _ in 0..3 {
        fail(&breaker).await;
    }
    assert_eq!(breaker.current_state(), State::Open);

    tokio::time::advance(Duration::from_millis(500)).await;
    let err = succeed(&breaker).await.unwrap_err();
    assert!(matches!(err, BreakerError::Open { .. }));
    assert_eq!(breaker.current_state(), State::Open);

    tokio::time::advance(Duration::from_millis(600)).await;
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.current_state(), State::HalfOpen);
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_after_successes_reopens() {
    let breaker = CircuitBreaker::<RemoteError>::builder("probe")
        .failure_threshold(1)
        .success_threshold(3)
        .reset_timeout(Duration::from_millis(100))
        .build();

    fail(&breaker).await;
    tokio::time::advance(Duration::from_millis(100)).await;

    succeed(&breaker).await.unwrap();
    succeed(&breaker).await.unwrap();
    assert_eq!(breaker.current_state(), State::HalfOpen);

    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn test_open_error_reports_retry_after() {
    let breaker = test_breaker("push");
    breaker.open();

    tokio::time::advance(Duration::from_millis(400)).await;
    match succeed(&breaker).await.unwrap_err() {
        BreakerError::Open {
            breaker: name,
            retry_after,
            ..
        } => {
            assert_eq!(name, "push");
            assert_eq!(retry_after, Duration::from_millis(600));
        }
        other => panic!("expected open error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_toward_window_but_not_failed() {
    let breaker = test_breaker("slow");

    let err = breaker
        .call(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, RemoteError>(())
        })
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(err.code(), "TIMEOUT");
    assert_eq!(err.breaker_name(), Some("slow"));

    let status = breaker.status();
    assert_eq!(status.metrics.timeouts, 1);
    assert_eq!(status.metrics.failed_requests, 0);
    assert_eq!(status.recent_failures, 1);
    assert_eq!(breaker.last_failure().as_deref(), Some("timed out after 500ms"));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_timeouts_open_the_circuit() {
    let breaker = test_breaker("stuck");
    for _ in 0..3 {
        let err = breaker
            .call(|| futures::future::pending::<Result<(), RemoteError>>())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn test_caller_errors_are_ignored() {
    let breaker = test_breaker("validation");

    for error in [
        RemoteError::validation("INVALID_TO_NUMBER", "bad number"),
        RemoteError::rate_limited("slow down"),
        RemoteError::status(404, "not found"),
        RemoteError::status(400, "bad request"),
    ] {
        let err = breaker
            .call(|| async move { Err::<(), _>(error) })
            .await
            .unwrap_err();
        assert!(matches!(err, BreakerError::Operation(_)));
    }

    assert_eq!(breaker.current_state(), State::Closed);
    let status = breaker.status();
    assert_eq!(status.recent_failures, 0);
    assert_eq!(status.metrics.ignored_errors, 4);
    assert_eq!(status.metrics.failed_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_status_counts() {
    let breaker = test_breaker("gateway");
    for _ in 0..3 {
        breaker
            .call(|| async { Err::<(), _>(RemoteError::status(408, "request timeout")) })
            .await
            .unwrap_err();
    }
    assert_eq!(breaker.current_state(), State::Open);
}

#[tokio::test(start_paused = true)]
async fn test_failures_outside_monitoring_period_expire() {
    let breaker = CircuitBreaker::<RemoteError>::builder("expiring")
        .failure_threshold(3)
        .monitoring_period(Duration::from_secs(10))
        .build();

    fail(&breaker).await;
    fail(&breaker).await;
    tokio::time::advance(Duration::from_secs(11)).await;

    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Closed);
    assert_eq!(breaker.status().recent_failures, 1);
}

#[tokio::test]
async fn test_custom_failure_predicate() {
    #[derive(Debug, thiserror::Error)]
    enum StoreError {
        #[error("db: {0}")]
        Db(#[from] DbError),
        #[error("io: {0}")]
        Io(#[from] io::Error),
    }

    // Default predicate looks through the source chain
    let default = CircuitBreaker::<StoreError>::builder("store")
        .failure_threshold(1)
        .build();
    default
        .call(|| async { Err::<(), _>(StoreError::from(DbError::new("23505", "duplicate"))) })
        .await
        .unwrap_err();
    default
        .call(|| async {
            Err::<(), _>(StoreError::from(io::Error::new(io::ErrorKind::InvalidData, "garbled")))
        })
        .await
        .unwrap_err();
    assert_eq!(default.current_state(), State::Closed);

    // A custom predicate replaces the default entirely
    let strict = CircuitBreaker::<StoreError>::builder("strict")
        .failure_threshold(1)
        .is_failure(|_| true)
        .build();
    strict
        .call(|| async { Err::<(), _>(StoreError::from(DbError::new("23505", "duplicate"))) })
        .await
        .unwrap_err();
    assert_eq!(strict.current_state(), State::Open);
}

#[tokio::test]
async fn test_state_change_hooks() {
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let opened = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&transitions);
    let alerts = Arc::clone(&opened);
    let breaker = CircuitBreaker::<RemoteError>::builder("hooks")
        .failure_threshold(1)
        .on_state_change(move |t| log.lock().push((t.from, t.to)))
        .on_open(move |name| alerts.lock().push(name.to_owned()))
        .build();

    fail(&breaker).await;
    breaker.reset();

    assert_eq!(
        *transitions.lock(),
        vec![(State::Closed, State::Open), (State::Open, State::Closed)]
    );
    assert_eq!(*opened.lock(), vec!["hooks".to_owned()]);
}

#[tokio::test]
async fn test_hook_registry_merges_with_builder_hooks() {
    let transitions = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(AtomicUsize::new(0));
    let rejected = Arc::new(AtomicUsize::new(0));

    let hooks = HookRegistry::new();
    let counter = Arc::clone(&rejected);
    hooks.set_on_rejected(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let log = Arc::clone(&transitions);
    let alerts = Arc::clone(&opened);
    let breaker = CircuitBreaker::<RemoteError>::builder("merged")
        .failure_threshold(1)
        .on_state_change(move |_| {
            log.fetch_add(1, Ordering::SeqCst);
        })
        .on_open(move |_| {
            alerts.fetch_add(1, Ordering::SeqCst);
        })
        .hooks(hooks)
        .build();

    fail(&breaker).await;
    assert!(succeed(&breaker).await.unwrap_err().is_open());

    assert_eq!(transitions.load(Ordering::SeqCst), 1);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_hook_does_not_break_the_call() {
    let hooks = HookRegistry::new();
    hooks.set_on_open(|_| panic!("alerting is down"));
    let rejected = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&rejected);
    hooks.set_on_rejected(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let breaker = CircuitBreaker::<RemoteError>::builder("fragile")
        .failure_threshold(1)
        .hooks(hooks)
        .build();

    assert!(matches!(fail(&breaker).await, BreakerError::Operation(_)));
    assert_eq!(breaker.current_state(), State::Open);
    assert!(succeed(&breaker).await.unwrap_err().is_open());
    assert_eq!(rejected.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_manual_overrides() {
    let breaker = test_breaker("manual");

    assert_eq!(breaker.open(), State::Closed);
    assert_eq!(breaker.current_state(), State::Open);
    assert!(breaker.status().is_open);

    // Forcing the current state still records a transition
    assert_eq!(breaker.open(), State::Open);

    assert_eq!(breaker.reset(), State::Open);
    assert_eq!(breaker.current_state(), State::Closed);
    assert!(breaker.status().next_attempt_time.is_none());

    let causes: Vec<_> = breaker
        .status()
        .metrics
        .recent_state_changes
        .iter()
        .map(|t| t.cause)
        .collect();
    assert_eq!(causes, vec![TransitionCause::Manual; 3]);
}

#[tokio::test]
async fn test_reset_clears_failure_window() {
    let breaker = test_breaker("window");
    fail(&breaker).await;
    fail(&breaker).await;
    breaker.reset();

    fail(&breaker).await;
    fail(&breaker).await;
    assert_eq!(breaker.current_state(), State::Closed);
}

#[tokio::test]
async fn test_status_is_read_only() {
    let breaker = test_breaker("status");
    fail(&breaker).await;
    succeed(&breaker).await.unwrap();

    let first = breaker.status();
    let second = breaker.status();
    assert_eq!(first, second);
    assert_eq!(first.metrics.success_rate, Some(50.0));
    assert_eq!(first.metrics.failure_rate, Some(50.0));
    assert_eq!(first.config.failure_threshold, 3);
    assert_eq!(first.config.reset_timeout_ms, 1000);

    let json = serde_json::to_value(&first).unwrap();
    assert_eq!(json["state"], "CLOSED");
    assert_eq!(json["metrics"]["totalRequests"], 2);
}

#[tokio::test]
async fn test_status_keeps_last_five_transitions() {
    let breaker = test_breaker("churn");
    for _ in 0..4 {
        breaker.open();
        breaker.reset();
    }
    let recent = breaker.status().metrics.recent_state_changes;
    assert_eq!(recent.len(), 5);
    assert_eq!(recent.last().unwrap().to, State::Closed);
}

#[tokio::test]
async fn test_health_view() {
    let breaker = test_breaker("health");
    assert!(breaker.health().healthy);

    breaker.open();
    let health = breaker.health();
    assert!(health.down);
    assert!(!health.healthy);
    assert!(!health.degraded);
}

#[tokio::test]
async fn test_errors_carry_ambient_correlation_id() {
    let breaker = test_breaker("correlated");
    breaker.open();

    let err = correlation::run(Some(CorrelationId::from("req-42")), async {
        breaker
            .execute(
                || async { Ok::<_, RemoteError>(()) },
                &CallContext::new().with("operation", "send_sms"),
            )
            .await
            .unwrap_err()
    })
    .await;

    assert_eq!(err.correlation_id().map(CorrelationId::as_str), Some("req-42"));
    let json = err.to_json();
    assert_eq!(json["code"], "CIRCUIT_OPEN");
    assert_eq!(json["breakerName"], "correlated");
    assert_eq!(json["correlationId"], "req-42");
}

#[tokio::test]
async fn test_clones_share_state() {
    let breaker = test_breaker("shared");
    let clone = breaker.clone();
    clone.open();
    assert_eq!(breaker.current_state(), State::Open);
}

#[test]
fn test_config_from_file_values() {
    let config: BreakerConfig = serde_json::from_str(
        r#"{"failure_threshold": 10, "reset_timeout": "2m", "timeout": "0s"}"#,
    )
    .unwrap();
    assert_eq!(config.failure_threshold, 10);
    assert_eq!(config.reset_timeout, Duration::from_secs(120));

    let breaker = CircuitBreaker::<RemoteError>::builder("configured")
        .config(config)
        .build();
    assert_eq!(breaker.config().timeout, Duration::from_secs(30));
    assert_eq!(breaker.config().success_threshold, 3);
    assert_eq!(breaker.config().monitoring_period, Duration::from_secs(120));
}

proptest! {
    #[test]
    fn breaker_opens_exactly_at_threshold(threshold in 1u32..8, failures in 0u32..12) {
        tokio_test::block_on(async {
            let breaker = CircuitBreaker::<RemoteError>::builder("prop")
                .failure_threshold(threshold)
                .build();
            for _ in 0..failures {
                let _ = fail(&breaker).await;
            }
            let expected = if failures >= threshold { State::Open } else { State::Closed };
            assert_eq!(breaker.current_state(), expected);
        });
    }
}
