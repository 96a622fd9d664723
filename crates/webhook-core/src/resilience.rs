//! Resilience envelope around outbound calls (spec.md §4.7, C7).
//!
//! Nesting order, outside-in: circuit breaker, then retry with backoff and
//! jitter, then a per-attempt time limiter. The breaker decides whether a
//! call is attempted at all; the retry loop decides how many times; the
//! time limiter bounds each individual attempt. Adapted from the teacher's
//! hand-rolled `retry_backoff_seconds` (`forwarder.rs`) generalized with a
//! circuit breaker and jitter, rather than pulling in an unaudited
//! third-party resilience crate.

use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Calls in the sliding window before the failure rate is evaluated.
    pub minimum_calls: usize,
    /// Size of the sliding window of recorded outcomes.
    pub sliding_window_size: usize,
    /// Fraction in `[0.0, 1.0]` of failures in the window that trips the breaker.
    pub failure_rate_threshold: f64,
    /// A call whose duration meets or exceeds this is counted as slow.
    pub slow_call_duration_threshold: Duration,
    /// Fraction in `[0.0, 1.0]` of slow calls in the window that trips the breaker.
    pub slow_call_rate_threshold: f64,
    /// How long the breaker stays OPEN before admitting a half-open trial.
    pub open_state_duration: Duration,
    /// Successful trial calls required in HALF_OPEN before closing again.
    pub half_open_required_successes: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            minimum_calls: 10,
            sliding_window_size: 20,
            failure_rate_threshold: 0.5,
            slow_call_duration_threshold: Duration::from_secs(5),
            slow_call_rate_threshold: 0.5,
            open_state_duration: Duration::from_secs(30),
            half_open_required_successes: 5,
        }
    }
}

/// One recorded outcome in the sliding window: whether the call succeeded
/// and whether it ran at or past `slow_call_duration_threshold`.
#[derive(Debug, Clone, Copy)]
struct CallOutcome {
    ok: bool,
    slow: bool,
}

struct CircuitBreakerInner {
    state: CircuitState,
    outcomes: VecDeque<CallOutcome>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
    half_open_in_flight: bool,
}

/// Count-based sliding-window circuit breaker. One instance guards one
/// logical downstream dependency (e.g. one destination's broker topic, or
/// one DLQ sink).
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
}

pub struct CallPermit {
    is_trial: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpenError;

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitBreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::new(),
                opened_at: None,
                half_open_successes: 0,
                half_open_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Requests permission to make a call. Transitions OPEN -> HALF_OPEN
    /// once `open_state_duration` has elapsed, admitting exactly one trial
    /// call at a time.
    pub fn acquire(&self) -> Result<CallPermit, CircuitOpenError> {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match guard.state {
            CircuitState::Closed => Ok(CallPermit { is_trial: false }),
            CircuitState::HalfOpen => {
                if guard.half_open_in_flight {
                    Err(CircuitOpenError)
                } else {
                    guard.half_open_in_flight = true;
                    Ok(CallPermit { is_trial: true })
                }
            }
            CircuitState::Open => {
                let elapsed = guard
                    .opened_at
                    .map(|opened_at| opened_at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.open_state_duration {
                    guard.state = CircuitState::HalfOpen;
                    guard.half_open_successes = 0;
                    guard.half_open_in_flight = true;
                    Ok(CallPermit { is_trial: true })
                } else {
                    Err(CircuitOpenError)
                }
            }
        }
    }

    /// `elapsed` is the duration of the call just completed, used to
    /// classify it as slow against `slow_call_duration_threshold` (spec.md
    /// §4.7: "slow-call rate above threshold also opens the breaker").
    pub fn record_success(&self, permit: CallPermit, elapsed: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if permit.is_trial {
            guard.half_open_in_flight = false;
            guard.half_open_successes += 1;
            if guard.half_open_successes >= self.config.half_open_required_successes {
                guard.state = CircuitState::Closed;
                guard.outcomes.clear();
                guard.opened_at = None;
            }
            return;
        }
        let slow = elapsed >= self.config.slow_call_duration_threshold;
        push_outcome(&mut guard.outcomes, true, slow, self.config.sliding_window_size);
        self.maybe_trip(&mut guard);
    }

    pub fn record_failure(&self, permit: CallPermit, elapsed: Duration) {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if permit.is_trial {
            guard.half_open_in_flight = false;
            guard.state = CircuitState::Open;
            guard.opened_at = Some(Instant::now());
            guard.half_open_successes = 0;
            return;
        }
        let slow = elapsed >= self.config.slow_call_duration_threshold;
        push_outcome(&mut guard.outcomes, false, slow, self.config.sliding_window_size);
        self.maybe_trip(&mut guard);
    }

    fn maybe_trip(&self, guard: &mut CircuitBreakerInner) {
        if guard.state != CircuitState::Closed {
            return;
        }
        if guard.outcomes.len() < self.config.minimum_calls {
            return;
        }
        let total = guard.outcomes.len() as f64;
        let failures = guard.outcomes.iter().filter(|outcome| !outcome.ok).count() as f64;
        let slow = guard.outcomes.iter().filter(|outcome| outcome.slow).count() as f64;
        let failure_rate = failures / total;
        let slow_call_rate = slow / total;
        if failure_rate >= self.config.failure_rate_threshold || slow_call_rate >= self.config.slow_call_rate_threshold
        {
            guard.state = CircuitState::Open;
            guard.opened_at = Some(Instant::now());
        }
    }
}

fn push_outcome(outcomes: &mut VecDeque<CallOutcome>, ok: bool, slow: bool, window_size: usize) {
    outcomes.push_back(CallOutcome { ok, slow });
    while outcomes.len() > window_size {
        outcomes.pop_front();
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Uniform jitter fraction applied on top of the exponential delay,
    /// e.g. `0.2` spreads each delay over `[delay * 0.8, delay * 1.2]`.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
        }
    }
}

/// Same exponential-capping arithmetic as the teacher's `retry_backoff_seconds`,
/// generalized to sub-second base delays and widened with jitter (spec.md §4.7).
pub fn backoff_with_jitter(config: &RetryConfig, attempt_index: u32) -> Duration {
    let exponent = attempt_index.min(31);
    let scaled_millis = (config.base_delay.as_millis() as u64).saturating_mul(1u64 << exponent);
    let capped_millis = scaled_millis.min(config.max_delay.as_millis() as u64);

    if config.jitter_fraction <= 0.0 || capped_millis == 0 {
        return Duration::from_millis(capped_millis);
    }
    let spread = (capped_millis as f64 * config.jitter_fraction) as i64;
    let jitter = rand::thread_rng().gen_range(-spread..=spread);
    let jittered = (capped_millis as i64 + jitter).max(0) as u64;
    Duration::from_millis(jittered)
}

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError<E> {
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Operation(E),
}

#[derive(Debug, Clone)]
pub struct TimeLimiterConfig {
    pub per_attempt_timeout: Duration,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            per_attempt_timeout: Duration::from_secs(10),
        }
    }
}

/// Composes a `CircuitBreaker`, `RetryConfig` and `TimeLimiterConfig` into
/// the single nested envelope spec.md §4.7 requires around every outbound
/// call (publish, DLQ write, downstream HTTP forward).
pub struct ResilienceExecutor {
    pub breaker: CircuitBreaker,
    pub retry: RetryConfig,
    pub time_limiter: TimeLimiterConfig,
}

impl ResilienceExecutor {
    pub fn new(breaker: CircuitBreaker, retry: RetryConfig, time_limiter: TimeLimiterConfig) -> Self {
        Self {
            breaker,
            retry,
            time_limiter,
        }
    }

    /// Runs `operation` under the full envelope. `is_retryable` classifies
    /// an operation error as worth another attempt; anything else is
    /// surfaced immediately without consuming further attempts.
    pub async fn execute<T, E, F, Fut>(
        &self,
        is_retryable: impl Fn(&E) -> bool,
        mut operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let permit = self.breaker.acquire().map_err(|_| ResilienceError::CircuitOpen)?;

        for attempt in 0..self.retry.max_attempts {
            let attempt_start = Instant::now();
            let attempt_result = timeout(self.time_limiter.per_attempt_timeout, operation()).await;
            let elapsed = attempt_start.elapsed();

            match attempt_result {
                Ok(Ok(value)) => {
                    self.breaker.record_success(permit, elapsed);
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    let retryable = is_retryable(&error);
                    if !retryable || attempt + 1 >= self.retry.max_attempts {
                        self.breaker.record_failure(permit, elapsed);
                        return Err(ResilienceError::Operation(error));
                    }
                    tokio::time::sleep(backoff_with_jitter(&self.retry, attempt)).await;
                }
                Err(_elapsed) => {
                    if attempt + 1 >= self.retry.max_attempts {
                        self.breaker.record_failure(permit, elapsed);
                        return Err(ResilienceError::Timeout(self.time_limiter.per_attempt_timeout));
                    }
                    tokio::time::sleep(backoff_with_jitter(&self.retry, attempt)).await;
                }
            }
        }

        self.breaker.record_failure(permit, self.time_limiter.per_attempt_timeout);
        Err(ResilienceError::Timeout(self.time_limiter.per_attempt_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_scales_and_caps_like_the_unjittered_case() {
        let config = RetryConfig {
            max_attempts: 6,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.0,
        };
        assert_eq!(backoff_with_jitter(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_with_jitter(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_with_jitter(&config, 5), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_configured_spread() {
        let config = RetryConfig {
            max_attempts: 6,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_fraction: 0.2,
        };
        for _ in 0..50 {
            let delay = backoff_with_jitter(&config, 0).as_millis() as i64;
            assert!((800..=1200).contains(&delay), "delay {delay} out of spread");
        }
    }

    fn fast_outcome_config(overrides: CircuitBreakerConfig) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            slow_call_duration_threshold: Duration::from_secs(3600),
            ..overrides
        }
    }

    #[test]
    fn breaker_opens_once_failure_rate_crosses_threshold() {
        let breaker = CircuitBreaker::new(fast_outcome_config(CircuitBreakerConfig {
            minimum_calls: 4,
            sliding_window_size: 4,
            failure_rate_threshold: 0.5,
            open_state_duration: Duration::from_secs(60),
            half_open_required_successes: 1,
            ..CircuitBreakerConfig::default()
        }));

        for _ in 0..2 {
            let permit = breaker.acquire().unwrap();
            breaker.record_failure(permit, Duration::from_millis(1));
        }
        for _ in 0..2 {
            let permit = breaker.acquire().unwrap();
            breaker.record_success(permit, Duration::from_millis(1));
        }
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..2 {
            let permit = breaker.acquire().unwrap();
            breaker.record_failure(permit, Duration::from_millis(1));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.acquire().is_err());
    }

    #[test]
    fn half_open_failure_reopens_the_breaker() {
        let breaker = CircuitBreaker::new(fast_outcome_config(CircuitBreakerConfig {
            minimum_calls: 1,
            sliding_window_size: 1,
            failure_rate_threshold: 0.1,
            open_state_duration: Duration::from_millis(1),
            half_open_required_successes: 1,
            ..CircuitBreakerConfig::default()
        }));
        let permit = breaker.acquire().unwrap();
        breaker.record_failure(permit, Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));
        let trial = breaker.acquire().expect("half-open trial admitted");
        breaker.record_failure(trial, Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn breaker_opens_on_slow_call_rate_even_without_failures() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            minimum_calls: 2,
            sliding_window_size: 2,
            failure_rate_threshold: 1.0,
            slow_call_duration_threshold: Duration::from_millis(50),
            slow_call_rate_threshold: 0.5,
            open_state_duration: Duration::from_secs(60),
            half_open_required_successes: 1,
        });

        for _ in 0..2 {
            let permit = breaker.acquire().unwrap();
            breaker.record_success(permit, Duration::from_millis(100));
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn executor_retries_retryable_errors_until_success() {
        let executor = ResilienceExecutor::new(
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter_fraction: 0.0,
            },
            TimeLimiterConfig {
                per_attempt_timeout: Duration::from_secs(1),
            },
        );

        let attempts = AtomicU32::new(0);
        let result = executor
            .execute(
                |_err: &&str| true,
                || {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if count < 2 {
                            Err("transient")
                        } else {
                            Ok::<_, &str>(42)
                        }
                    }
                },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn executor_stops_immediately_on_non_retryable_error() {
        let executor = ResilienceExecutor::new(
            CircuitBreaker::new(CircuitBreakerConfig::default()),
            RetryConfig::default(),
            TimeLimiterConfig::default(),
        );

        let attempts = AtomicU32::new(0);
        let result = executor
            .execute(
                |_err: &&str| false,
                || {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    async { Err::<i32, _>("permanent") }
                },
            )
            .await;

        assert!(matches!(result, Err(ResilienceError::Operation("permanent"))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
