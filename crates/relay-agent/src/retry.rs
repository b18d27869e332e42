//! Bounded retry with exponential backoff and jitter
//!
//! Only transient failures are retried. The full attempt history is
//! returned next to the final result so callers can report exactly what
//! happened.

use rand::Rng;
use relay_core::{AgentCallError, RetryConfig};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry tunables, read-only at request time
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Delay is scaled by a random factor in `[1 - j, 1 + j]`
    pub jitter_fraction: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_fraction: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay(), config.max_delay())
            .with_jitter(config.jitter_fraction)
    }

    /// Delay before attempt `n` without jitter: `min(base * 2^(n-2), max)`
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt < 2 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Nominal delay scaled by a fresh random jitter factor
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter_fraction <= 0.0 || nominal.is_zero() {
            return nominal;
        }
        let j = self.jitter_fraction;
        let factor = rand::rng().random_range((1.0 - j)..=(1.0 + j));
        nominal.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// One call made by the retry loop
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    /// 1-based attempt number
    pub attempt: u32,
    /// Backoff slept before this attempt
    pub delay_before: Duration,
    pub elapsed: Duration,
    /// `None` when the attempt succeeded
    pub error: Option<AgentCallError>,
}

/// Final result plus every attempt that led to it
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AgentCallError>,
    pub history: Vec<AttemptRecord>,
}

impl<T> RetryOutcome<T> {
    /// Number of calls actually issued
    pub fn calls(&self) -> u32 {
        self.history.len() as u32
    }
}

/// Call `op` until it succeeds, fails permanently, or `max_attempts` is reached
///
/// `op` receives the 1-based attempt number.
pub async fn call_with_retry<F, Fut, T>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AgentCallError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut history = Vec::with_capacity(max_attempts as usize);
    let mut attempt = 1;

    loop {
        let delay_before = policy.jittered_delay(attempt);
        if !delay_before.is_zero() {
            debug!(attempt, ?delay_before, "Backing off before retry");
            tokio::time::sleep(delay_before).await;
        }

        let started = Instant::now();
        let result = op(attempt).await;
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                history.push(AttemptRecord {
                    attempt,
                    delay_before,
                    elapsed,
                    error: None,
                });
                return RetryOutcome {
                    result: Ok(value),
                    history,
                };
            }
            Err(err) => {
                history.push(AttemptRecord {
                    attempt,
                    delay_before,
                    elapsed,
                    error: Some(err.clone()),
                });

                if !err.is_transient() {
                    debug!(attempt, error = %err, "Permanent failure, not retrying");
                    return RetryOutcome {
                        result: Err(err),
                        history,
                    };
                }
                if attempt >= max_attempts {
                    return RetryOutcome {
                        result: Err(err),
                        history,
                    };
                }

                warn!(
                    "Transient failure on attempt {}/{}: {}",
                    attempt, max_attempts, err
                );
                attempt += 1;
            }
        }
    }
}
