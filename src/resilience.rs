//! Resilience primitives guarding the pipeline's dependencies.
//!
//! Two mechanisms live here:
//!
//! - [`CircuitBreaker`] - a three-state (closed / open / half-open) gate in
//!   front of the LLM. Consecutive failures open it; after a recovery
//!   timeout one probe request is let through.
//! - [`MultiRateLimiter`] - bounded-concurrency admission control with one
//!   independent scope for query requests and one for LLM calls. Admission
//!   is non-blocking: a full scope rejects instead of queueing.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering}
    },
    time::{Duration, Instant}
};

use crate::error::QueryError;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen
}

impl BreakerState {
    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    pub fn as_gauge(&self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state:     BreakerState,
    failures:  u32,
    opened_at: Option<Instant>
}

/// Failure gate for a single dependency.
///
/// `CLOSED -> OPEN` at `failure_threshold` consecutive failures;
/// `OPEN -> HALF_OPEN` once `recovery_timeout` has elapsed; a half-open
/// probe closes the breaker on success and reopens it on failure.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner:             Arc<Mutex<BreakerInner>>,
    failure_threshold: u32,
    recovery_timeout:  Duration
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakerInner {
                state:     BreakerState::Closed,
                failures:  0,
                opened_at: None
            })),
            failure_threshold,
            recovery_timeout
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// An open breaker whose recovery timeout has elapsed transitions to
    /// half-open and admits exactly this caller as the probe.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if elapsed {
                    inner.state = BreakerState::HalfOpen;
                    tracing::info!("circuit breaker half-open, probing dependency");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        if inner.state == BreakerState::HalfOpen {
            tracing::info!("circuit breaker closed after successful probe");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::warn!("circuit breaker reopened after failed probe");
            }
            BreakerState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        failures = inner.failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }
}

/// One admission scope: a concurrency ceiling plus rejection totals.
#[derive(Debug)]
pub struct RateLimiter {
    scope:            &'static str,
    max:              usize,
    active:           AtomicUsize,
    total_requests:   AtomicU64,
    total_rejections: AtomicU64
}

impl RateLimiter {
    pub fn new(scope: &'static str, max: usize) -> Self {
        Self {
            scope,
            max,
            active: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0)
        }
    }

    /// Try to take a slot. Returns a guard that releases it on drop.
    pub fn acquire(self: &Arc<Self>) -> Result<RateLimiterPermit, QueryError> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut current = self.active.load(Ordering::Acquire);
        loop {
            if current >= self.max {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = self.scope, "rate limiter rejected request");
                return Err(QueryError::RateLimited {
                    scope: self.scope
                });
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire
            ) {
                Ok(_) => {
                    return Ok(RateLimiterPermit {
                        limiter: Arc::clone(self)
                    });
                }
                Err(observed) => current = observed
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }
}

/// Held slot in a [`RateLimiter`] scope.
#[derive(Debug)]
pub struct RateLimiterPermit {
    limiter: Arc<RateLimiter>
}

impl Drop for RateLimiterPermit {
    fn drop(&mut self) {
        self.limiter.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Process-wide admission control: one scope per protected resource.
#[derive(Debug, Clone)]
pub struct MultiRateLimiter {
    pub query: Arc<RateLimiter>,
    pub llm:   Arc<RateLimiter>
}

impl MultiRateLimiter {
    pub fn new(query_limit: usize, llm_limit: usize) -> Self {
        Self {
            query: Arc::new(RateLimiter::new("query", query_limit)),
            llm:   Arc::new(RateLimiter::new("llm", llm_limit))
        }
    }
}
