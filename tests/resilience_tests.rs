use std::{sync::Arc, thread::sleep, time::Duration};

use pg_nlq::{
    error::ErrorCode,
    resilience::{BreakerState, CircuitBreaker, MultiRateLimiter, RateLimiter}
};

#[test]
fn breaker_starts_closed() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.allow_request());
}

#[test]
fn breaker_opens_at_threshold() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow_request());
}

#[test]
fn breaker_success_resets_failure_count() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn breaker_half_opens_after_recovery_timeout() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow_request());

    sleep(Duration::from_millis(60));
    assert!(breaker.allow_request());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
}

#[test]
fn half_open_probe_success_closes() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
    breaker.record_failure();
    sleep(Duration::from_millis(20));
    assert!(breaker.allow_request());
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[test]
fn half_open_probe_failure_reopens() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(10));
    breaker.record_failure();
    sleep(Duration::from_millis(20));
    assert!(breaker.allow_request());
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow_request());
}

#[test]
fn breaker_gauge_encoding() {
    assert_eq!(BreakerState::Closed.as_gauge(), 0);
    assert_eq!(BreakerState::HalfOpen.as_gauge(), 1);
    assert_eq!(BreakerState::Open.as_gauge(), 2);
}

#[test]
fn limiter_admits_up_to_max() {
    let limiter = Arc::new(RateLimiter::new("query", 2));
    let first = limiter.acquire().unwrap();
    let _second = limiter.acquire().unwrap();
    assert_eq!(limiter.active(), 2);

    let rejected = limiter.acquire();
    assert!(rejected.is_err());
    assert_eq!(rejected.unwrap_err().code(), ErrorCode::RateLimited);
    assert_eq!(limiter.total_rejections(), 1);

    drop(first);
    assert_eq!(limiter.active(), 1);
    let _third = limiter.acquire().unwrap();
}

#[test]
fn limiter_counts_all_requests() {
    let limiter = Arc::new(RateLimiter::new("llm", 1));
    let permit = limiter.acquire().unwrap();
    let _ = limiter.acquire();
    let _ = limiter.acquire();
    drop(permit);
    assert_eq!(limiter.total_requests(), 3);
    assert_eq!(limiter.total_rejections(), 2);
    assert_eq!(limiter.active(), 0);
}

#[test]
fn multi_limiter_scopes_are_independent() {
    let limiter = MultiRateLimiter::new(1, 1);
    let _query = limiter.query.acquire().unwrap();
    // A saturated query scope does not affect the llm scope.
    assert!(limiter.query.acquire().is_err());
    assert!(limiter.llm.acquire().is_ok());
}
