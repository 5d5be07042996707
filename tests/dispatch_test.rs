use std::time::{Duration, Instant};

use pagewatch::config::{
    DISPATCH_BREAKER_COOLDOWN_SECS, DISPATCH_BREAKER_FAILURES,
    DISPATCH_BREAKER_NOTICE_INTERVAL_SECS,
};
use pagewatch::dispatch::{build_failure_prompt, DispatchBreaker, READ_ONLY_RULES};

#[test]
fn test_breaker_starts_closed() {
    let mut b = DispatchBreaker::new();
    assert!(b.is_available(Instant::now()));
}

#[test]
fn test_breaker_trips_after_consecutive_failures() {
    let now = Instant::now();
    let mut b = DispatchBreaker::new();

    for i in 1..DISPATCH_BREAKER_FAILURES {
        assert!(!b.record_failure(now), "tripped too early at failure {}", i);
        assert!(b.is_available(now), "open before the threshold");
    }
    // The Nth failure opens the breaker.
    assert!(b.record_failure(now));
    assert!(!b.is_available(now));
}

#[test]
fn test_breaker_reenables_after_cooldown() {
    let now = Instant::now();
    let mut b = DispatchBreaker::new();
    for _ in 0..DISPATCH_BREAKER_FAILURES {
        b.record_failure(now);
    }
    assert!(!b.is_available(now + Duration::from_secs(1)));

    // Past the cooldown the breaker closes and the failure count resets.
    let later = now + Duration::from_secs(DISPATCH_BREAKER_COOLDOWN_SECS + 1);
    assert!(b.is_available(later));
    // A single new failure must not re-trip immediately.
    assert!(!b.record_failure(later));
    assert!(b.is_available(later));
}

#[test]
fn test_breaker_success_resets_failures() {
    let now = Instant::now();
    let mut b = DispatchBreaker::new();
    for _ in 0..DISPATCH_BREAKER_FAILURES - 1 {
        b.record_failure(now);
    }
    b.record_success();
    // The count started over, so the next failure is the first of a new run.
    assert!(!b.record_failure(now));
    assert!(b.is_available(now));
}

#[test]
fn test_breaker_does_not_retrip_while_open() {
    let now = Instant::now();
    let mut b = DispatchBreaker::new();
    for _ in 0..DISPATCH_BREAKER_FAILURES {
        b.record_failure(now);
    }
    // Further failures while open report no new trip (no duplicate notices).
    assert!(!b.record_failure(now + Duration::from_secs(5)));
}

#[test]
fn test_breaker_notice_is_rate_limited() {
    let now = Instant::now();
    let mut b = DispatchBreaker::new();

    assert!(b.should_notify(now));
    assert!(!b.should_notify(now + Duration::from_secs(60)));
    assert!(b.should_notify(
        now + Duration::from_secs(DISPATCH_BREAKER_NOTICE_INTERVAL_SECS + 1)
    ));
}

#[test]
fn test_failure_prompt_embeds_read_only_rules() {
    let prompt = build_failure_prompt(
        "test",
        "login flow",
        "https://app.example.com",
        Some("run-1"),
        Some("TimeoutError"),
        Some("waiting for selector #login"),
    );
    assert!(prompt.contains(READ_ONLY_RULES));
    assert!(prompt.contains("must not mutate the target"));
    assert!(prompt.contains("must not authenticate with real credentials"));
    assert!(prompt.contains("must not perform writes"));
    assert!(prompt.contains("only investigative observations"));
    assert!(prompt.contains("login flow"));
    assert!(prompt.contains("run-1"));
}
