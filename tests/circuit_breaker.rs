//! Circuit Breaker Integration Tests
//!
//! State transitions, the single half-open probe under concurrency, and the
//! status events published on every transition.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use orderflow::core::{BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitState, EventBus};
use orderflow::domain::EventType;

fn breaker(threshold: u32, reset_ms: u64) -> CircuitBreaker {
    CircuitBreaker::new(
        "binderpos",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            ..Default::default()
        },
    )
}

async fn failing_call(b: &CircuitBreaker) -> Result<(), BreakerError<String>> {
    b.call(Duration::from_secs(1), || async {
        Err::<(), _>("POS unavailable".to_string())
    })
    .await
}

async fn ok_call(b: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
    b.call(Duration::from_secs(1), || async { Ok::<_, String>(7) })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_opens_after_threshold_and_rejects_without_calling() {
    let b = breaker(3, 10_000);
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let result = b
            .call(Duration::from_secs(1), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("down".to_string())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Failed(_))));
    }
    assert_eq!(b.state(), CircuitState::Open);

    let rejected = b
        .call(Duration::from_secs(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;
    assert!(rejected.unwrap_err().is_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let snapshot = b.snapshot();
    assert_eq!(snapshot.consecutive_failures, 3);
    assert_eq!(snapshot.rejected_calls, 1);
    assert_eq!(snapshot.total_calls, 3);
    assert!(snapshot.next_probe_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_consecutive_failures() {
    let b = breaker(3, 10_000);

    failing_call(&b).await.unwrap_err();
    failing_call(&b).await.unwrap_err();
    ok_call(&b).await.unwrap();
    failing_call(&b).await.unwrap_err();
    failing_call(&b).await.unwrap_err();

    assert_eq!(b.state(), CircuitState::Closed);
    assert_eq!(b.snapshot().consecutive_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_counts_as_failure() {
    let b = breaker(1, 10_000);

    let result = b
        .call(Duration::from_millis(50), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        })
        .await;

    assert!(matches!(result, Err(BreakerError::Timeout { .. })));
    assert_eq!(b.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_probe_success_closes() {
    let b = breaker(1, 1_000);
    failing_call(&b).await.unwrap_err();
    assert_eq!(b.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(ok_call(&b).await.unwrap_err().is_open());

    tokio::time::advance(Duration::from_millis(600)).await;
    assert_eq!(ok_call(&b).await.unwrap(), 7);
    assert_eq!(b.state(), CircuitState::Closed);
    assert_eq!(b.snapshot().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failure_reopens() {
    let b = breaker(1, 1_000);
    failing_call(&b).await.unwrap_err();

    tokio::time::advance(Duration::from_millis(1_100)).await;
    failing_call(&b).await.unwrap_err();
    assert_eq!(b.state(), CircuitState::Open);

    // a fresh reset timeout applies
    assert!(ok_call(&b).await.unwrap_err().is_open());
}

#[tokio::test(start_paused = true)]
async fn test_half_open_allows_single_probe() {
    let b = Arc::new(breaker(1, 1_000));
    failing_call(&b).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1_100)).await;

    let probes = Arc::new(AtomicU32::new(0));

    let slow_probe = {
        let b = Arc::clone(&b);
        let probes = Arc::clone(&probes);
        async move {
            b.call(Duration::from_secs(10), || async {
                probes.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, String>(())
            })
            .await
        }
    };
    let concurrent = {
        let b = Arc::clone(&b);
        let probes = Arc::clone(&probes);
        async move {
            // let the probe claim the slot first
            tokio::task::yield_now().await;
            let mut results = Vec::new();
            for _ in 0..3 {
                let result = b
                    .call(Duration::from_secs(10), || async {
                        probes.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(())
                    })
                    .await;
                results.push(result);
            }
            results
        }
    };

    let (probe, others) = tokio::join!(slow_probe, concurrent);
    assert!(probe.is_ok());
    assert!(others.iter().all(|r| matches!(r, Err(e) if e.is_open())));
    assert_eq!(probes.load(Ordering::SeqCst), 1);
    assert_eq!(b.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_probe_releases_slot() {
    let b = breaker(1, 1_000);
    failing_call(&b).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1_100)).await;

    // probe future dropped mid-call
    let cancelled = tokio::time::timeout(
        Duration::from_millis(10),
        b.call(Duration::from_secs(10), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, String>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    // the abandoned probe counted as a failure and the breaker re-opened
    assert_eq!(b.state(), CircuitState::Open);
    assert!(!b.snapshot().probe_in_flight);
}

#[tokio::test(start_paused = true)]
async fn test_reset_forces_closed() {
    let b = breaker(1, 60_000);
    failing_call(&b).await.unwrap_err();
    assert_eq!(b.state(), CircuitState::Open);

    b.reset();
    assert_eq!(b.state(), CircuitState::Closed);
    assert_eq!(ok_call(&b).await.unwrap(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_transitions_publish_status_events() {
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let b = breaker(1, 1_000).with_event_bus(bus.clone());

    failing_call(&b).await.unwrap_err();
    tokio::time::advance(Duration::from_millis(1_100)).await;
    ok_call(&b).await.unwrap();

    let mut states = Vec::new();
    while let Some(event) = events.try_recv() {
        assert_eq!(event.event_type, EventType::CircuitBreakerStatus);
        assert!(event.order_id.is_none());
        states.push(event.payload["state"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(states, vec!["open", "half_open", "closed"]);
}
