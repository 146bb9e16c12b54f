use resilience_core::{BreakerError, CircuitBreaker, RemoteError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");
    rt.block_on(run());
}

async fn call_service(attempt: u32) -> Result<String, RemoteError> {
    if attempt < 10 && attempt % 2 == 0 {
        // Simulate an error on even counts
        Err(RemoteError::status(503, "External service error"))
    } else {
        Ok("Success".to_string())
    }
}

async fn run() {
    let breaker = CircuitBreaker::<RemoteError>::builder("external-service")
        .failure_threshold(3) // 3 failures within the monitoring period trip the circuit
        .success_threshold(2) // 2 successful probes close it again
        .reset_timeout(Duration::from_secs(2))
        .timeout(Duration::from_secs(1))
        .build();

    println!("Circuit initial state: {}", breaker.current_state());

    for i in 1..=15 {
        println!("\nAttempt {i}: ");

        match breaker.call(|| call_service(i)).await {
            Ok(result) => println!("Call succeeded with result: {result}"),
            Err(BreakerError::Open { retry_after, .. }) => {
                println!("Circuit is open, retry in {}ms", retry_after.as_millis());
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(BreakerError::Operation(err)) => println!("Call failed with error: {err}"),
            Err(err) => println!("Other error: {err}"),
        }

        let status = breaker.status();
        println!(
            "Current state: {}, recent failures: {}, failure rate: {:?}%",
            status.state, status.recent_failures, status.metrics.failure_rate
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}
