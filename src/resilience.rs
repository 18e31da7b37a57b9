//! Resilience wrappers for external calls.
//!
//! Every LLM, embedding, and store-open call goes through some combination
//! of these: a [`RetryPolicy`] with exponential backoff, a
//! [`CircuitBreaker`] that fast-fails after repeated errors, a [`Bulkhead`]
//! capping in-flight calls, a shared [`RateLimiter`] pacing request starts,
//! and [`with_timeout`] bounding wall-clock time.
//!
//! Classification is by error kind (`EngineError::is_retryable`), not type
//! identity: validation and auth failures are terminal, transport and
//! rate-limit failures are retried. A rate-limit error carrying
//! `retry_after_ms` overrides the computed backoff for the next attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::ResilienceConfig;
use crate::error::{EngineError, Result};

// ============ Retry ============

/// Exponential-backoff retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_retries: config.retries,
            ..Default::default()
        }
    }

    /// Backoff before attempt `n` (1-based retry count).
    fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails terminally, or the retry budget is
    /// spent. Only retryable error kinds are retried.
    pub async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt > self.max_retries {
                        return Err(err);
                    }
                    let delay = match &err {
                        EngineError::RateLimited {
                            retry_after_ms: Some(ms),
                            ..
                        } => Duration::from_millis(*ms),
                        _ => self.delay_for(attempt),
                    };
                    warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ============ Circuit breaker ============

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen,
}

/// Trips open after `threshold` consecutive failures; rejects calls with a
/// fast-fail [`EngineError::CircuitOpen`] for the cool-down window, then
/// half-opens to probe recovery with a single call.
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cool_down: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, cool_down: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cool_down,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self::new(
            name,
            config.circuit_breaker_threshold,
            Duration::from_millis(config.circuit_breaker_cool_down_ms),
        )
    }

    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut state = self.state.lock().await;
            match &*state {
                BreakerState::Open { until } => {
                    if Instant::now() < *until {
                        return Err(EngineError::CircuitOpen(self.name.clone()));
                    }
                    debug!(breaker = %self.name, "half-opening");
                    *state = BreakerState::HalfOpen;
                }
                BreakerState::Closed { .. } | BreakerState::HalfOpen => {}
            }
        }

        let result = op().await;

        let mut state = self.state.lock().await;
        match &result {
            Ok(_) => {
                *state = BreakerState::Closed {
                    consecutive_failures: 0,
                };
            }
            Err(err) if err.is_retryable() => match &mut *state {
                BreakerState::Closed {
                    consecutive_failures,
                } => {
                    *consecutive_failures += 1;
                    if *consecutive_failures >= self.threshold {
                        warn!(breaker = %self.name, "opening circuit");
                        *state = BreakerState::Open {
                            until: Instant::now() + self.cool_down,
                        };
                    }
                }
                BreakerState::HalfOpen => {
                    *state = BreakerState::Open {
                        until: Instant::now() + self.cool_down,
                    };
                }
                BreakerState::Open { .. } => {}
            },
            // Terminal errors are the caller's problem, not the service's.
            Err(_) => {}
        }
        result
    }
}

// ============ Bulkhead ============

/// Semaphore capping concurrent in-flight calls per external service.
/// Excess callers queue FIFO on the semaphore.
pub struct Bulkhead {
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Dependency("bulkhead closed".to_string()))
    }
}

// ============ Rate limiter ============

/// Metrics snapshot from the shared rate limiter.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimiterMetrics {
    pub total_requests: u64,
    pub avg_wait_ms: f64,
    pub max_wait_ms: u64,
    pub queue_length: usize,
}

struct RateLimiterState {
    next_free: Option<Instant>,
    total_requests: u64,
    total_wait_ms: u64,
    max_wait_ms: u64,
    waiting: usize,
}

/// Token-style limiter enforcing a minimum inter-request interval, shared
/// across all workers hitting a given external dependency.
pub struct RateLimiter {
    min_interval: Duration,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            state: Mutex::new(RateLimiterState {
                next_free: None,
                total_requests: 0,
                total_wait_ms: 0,
                max_wait_ms: 0,
                waiting: 0,
            }),
        }
    }

    /// Wait for a slot. Returns immediately when pacing is disabled.
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            let mut state = self.state.lock().await;
            state.total_requests += 1;
            return;
        }

        let wait_until = {
            let mut state = self.state.lock().await;
            state.total_requests += 1;
            state.waiting += 1;
            let now = Instant::now();
            let start = match state.next_free {
                Some(t) if t > now => t,
                _ => now,
            };
            state.next_free = Some(start + self.min_interval);
            start
        };

        let now = Instant::now();
        let wait_ms = wait_until.saturating_duration_since(now).as_millis() as u64;
        if wait_until > now {
            tokio::time::sleep(wait_until - now).await;
        }

        let mut state = self.state.lock().await;
        state.waiting -= 1;
        state.total_wait_ms += wait_ms;
        state.max_wait_ms = state.max_wait_ms.max(wait_ms);
    }

    /// Push the next slot out by `delay`, honoring a server-sent
    /// `retry_after`.
    pub async fn delay_next(&self, delay: Duration) {
        let mut state = self.state.lock().await;
        let candidate = Instant::now() + delay;
        state.next_free = Some(match state.next_free {
            Some(t) if t > candidate => t,
            _ => candidate,
        });
    }

    pub async fn metrics(&self) -> RateLimiterMetrics {
        let state = self.state.lock().await;
        let avg = if state.total_requests == 0 {
            0.0
        } else {
            state.total_wait_ms as f64 / state.total_requests as f64
        };
        RateLimiterMetrics {
            total_requests: state.total_requests,
            avg_wait_ms: avg,
            max_wait_ms: state.max_wait_ms,
            queue_length: state.waiting,
        }
    }
}

// ============ Timeout ============

/// Bound `fut` by `limit`; a miss becomes a retryable [`EngineError::Timeout`].
pub async fn with_timeout<T, Fut>(limit: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Timeout(limit.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = fast_policy(3)
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::Dependency("flaky".into()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_never_retries_validation() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = fast_policy(5)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Validation("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = fast_policy(2)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::Dependency("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
    }

    #[tokio::test(start_paused = true)]
    async fn retry_honors_retry_after() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let started = Instant::now();
        let result = fast_policy(1)
            .run("test", move || {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(EngineError::RateLimited {
                            message: "slow down".into(),
                            retry_after_ms: Some(5_000),
                        })
                    } else {
                        Ok(7u32)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new("llm", 2, Duration::from_millis(5));

        for _ in 0..2 {
            let _: Result<u32> = breaker
                .call(|| async { Err(EngineError::Dependency("down".into())) })
                .await;
        }

        // Now open: fast-fails without invoking the op.
        let result: Result<u32> = breaker.call(|| async { Ok(1) }).await;
        assert!(matches!(result, Err(EngineError::CircuitOpen(_))));

        tokio::time::sleep(Duration::from_millis(10)).await;

        // Half-open probe succeeds and closes the breaker.
        let result: Result<u32> = breaker.call(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
        let result: Result<u32> = breaker.call(|| async { Ok(2) }).await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn breaker_ignores_terminal_errors() {
        let breaker = CircuitBreaker::new("llm", 1, Duration::from_secs(60));
        let _: Result<u32> = breaker
            .call(|| async { Err(EngineError::Validation("bad".into())) })
            .await;
        // Terminal failure must not trip the breaker.
        let result: Result<u32> = breaker.call(|| async { Ok(1) }).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        let metrics = limiter.metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert!(metrics.max_wait_ms >= 100);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_delay_next_pushes_slot() {
        let limiter = RateLimiter::new(Duration::from_millis(1));
        limiter.acquire().await;
        limiter.delay_next(Duration::from_secs(5)).await;
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_converts_to_engine_error() {
        let result: Result<u32> = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(EngineError::Timeout(_))));
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn bulkhead_limits_concurrency() {
        let bulkhead = Bulkhead::new(1);
        let first = bulkhead.acquire().await.unwrap();
        // Second acquire would block; verify try-style via timeout.
        let second = tokio::time::timeout(Duration::from_millis(10), bulkhead.acquire()).await;
        assert!(second.is_err());
        drop(first);
        let third = tokio::time::timeout(Duration::from_millis(10), bulkhead.acquire()).await;
        assert!(third.is_ok());
    }
}
