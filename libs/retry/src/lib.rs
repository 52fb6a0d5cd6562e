//! Retry policy primitives.
//!
//! A [`RetryPolicy`] is a plain value describing how many times an operation
//! may run and how long to wait between runs. It is applied with
//! [`RetryPolicy::run`], which keeps the retry loop out of the operation
//! itself:
//!
//! ```text
//! attempt 1 ── fail ── sleep(backoff(1)) ── attempt 2 ── fail ── sleep(backoff(2)) ── attempt 3
//! ```
//!
//! # Invariants
//!
//! - An operation runs at most `max_attempts` times (and at least once)
//! - The delay before retry `k` is `base * 2^k`, capped at `max`
//! - The last error is always returned, never swallowed

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

/// Default number of attempts per operation.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base interval for exponential backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(225);

/// Default ceiling for a single backoff delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Error returned once a policy has run out of attempts.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct RetryError<E: std::fmt::Display> {
    /// Number of attempts that were made.
    pub attempts: u32,

    /// Error from the final attempt.
    pub last: E,
}

/// Exponential backoff retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Base interval; retry `k` waits `base * 2^k`.
    pub base: Duration,

    /// Maximum delay for a single wait.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0). Zero disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Create a policy without jitter.
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts,
            base,
            ..Default::default()
        }
    }

    /// A policy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Set the jitter factor, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before retry number `retry` (1 for the second attempt).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(exp).min(self.max);

        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }

        let range = delay.as_secs_f64() * self.jitter;
        let offset = rand::rng().random_range(-range..=range);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }

    /// Run `op` until it succeeds or the attempts are exhausted.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_delay(|attempt, _| op(attempt)).await
    }

    /// Like [`run`](Self::run), but `op` also receives the delay that was
    /// slept before this attempt (zero for the first one). With jitter this
    /// differs from a fresh [`backoff`](Self::backoff) call.
    pub async fn run_with_delay<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32, Duration) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        let mut waited = Duration::ZERO;

        loop {
            match op(attempt, waited).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= max_attempts => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    debug!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    waited = delay;
                    attempt += 1;
                }
            }
        }
    }
}
