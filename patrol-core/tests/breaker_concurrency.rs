use std::sync::Arc;
use std::time::Duration;

use patrol_core::{BreakerRegistry, BreakerSection, CircuitState, NullSink};

fn fixed_backoff_registry() -> BreakerRegistry {
    BreakerRegistry::new(
        BreakerSection {
            failure_threshold: 3,
            open_timeout_ms: 1_000,
            open_timeout_max_ms: 1_000,
            backoff_multiplier: 1.0,
        },
        Arc::new(NullSink),
    )
}

/// The full breaker scenario: threshold 3, fixed 1 s backoff. Three
/// failures open the circuit; after the window exactly one concurrent
/// caller wins the half-open trial; a failed trial re-opens for another
/// second.
#[tokio::test(start_paused = true)]
async fn three_failures_open_then_single_trial_under_contention() {
    let registry = fixed_backoff_registry();
    let breaker = registry.breaker("flaky-site");

    for _ in 0..3 {
        assert!(breaker.allow());
        breaker.record_failure();
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(!breaker.allow(), "must reject immediately after opening");

    tokio::time::advance(Duration::from_millis(1_050)).await;

    // 100 concurrent callers race the half-open trial; exactly one wins.
    let mut callers = Vec::new();
    for _ in 0..100 {
        let breaker = Arc::clone(&breaker);
        callers.push(tokio::spawn(async move { breaker.allow() }));
    }
    let mut admitted = 0;
    for caller in callers {
        if caller.await.unwrap() {
            admitted += 1;
        }
    }
    assert_eq!(admitted, 1, "half-open must admit exactly one trial");

    // The trial fails: open again with the deadline reset to now + 1 s.
    breaker.record_failure();
    assert!(!breaker.allow());
    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(!breaker.allow());
    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(breaker.allow());
}

#[tokio::test(start_paused = true)]
async fn successful_trial_closes_and_clears_failures() {
    let registry = fixed_backoff_registry();
    let breaker = registry.breaker("recovering-site");

    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::advance(Duration::from_millis(1_100)).await;
    assert!(breaker.allow());
    breaker.record_success();
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Two failures stay below threshold after the reset.
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.allow());
}
