//! Exponential backoff with jitter
//!
//! [`Backoff`] hands out successive delays for loops that manage their own
//! retries (the deployment watch). [`retry_with_backoff`] wraps a single
//! fallible async call (staging trigger requests) and resends only errors
//! the caller marks retryable.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Shape of a backoff sequence.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    /// Maximum attempts (0 = unlimited)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Growth factor per failure
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Policy giving up after `attempts` tries
    pub fn bounded(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }
}

/// Stateful delay generator for one retry loop.
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    next: Duration,
}

impl Backoff {
    /// Start a fresh sequence
    pub fn new(policy: BackoffPolicy) -> Self {
        let next = policy.initial_delay;
        Self {
            policy,
            attempt: 0,
            next,
        }
    }

    /// Failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record a failure and return the jittered delay before the next try,
    /// or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.policy.max_attempts > 0 && self.attempt >= self.policy.max_attempts {
            return None;
        }

        let base = self.next;
        self.next = Duration::from_secs_f64(
            (base.as_secs_f64() * self.policy.multiplier).min(self.policy.max_delay.as_secs_f64()),
        );
        Some(jitter(base))
    }

    /// Forget earlier failures
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.next = self.policy.initial_delay;
    }
}

/// Scale `delay` by a random factor in `[0.5, 1.5)`.
fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Run `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy's attempts run out.
///
/// Returns the last error when giving up.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    policy: &BackoffPolicy,
    operation_name: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(policy.clone());

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => {
                warn!(operation = %operation_name, error = %e, "Operation failed, not retryable");
                return Err(e);
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(
                        operation = %operation_name,
                        attempt = backoff.attempts(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        operation = %operation_name,
                        attempt = backoff.attempts(),
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }
            },
        }
    }
}
