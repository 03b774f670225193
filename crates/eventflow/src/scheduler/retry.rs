//! Retry policy for task attempts and transient infrastructure failures.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// Exponential backoff with jitter.
///
/// # Backoff Calculation
///
/// The delay before retry N is `min(base_delay * 2^(N-1), max_delay)`,
/// then shortened by a random factor of up to `jitter` so that tasks
/// failing together do not retry together.
///
/// With defaults (base=1s, max=300s, jitter=0.2, max_attempts=3):
/// - Attempt 1 fails: retry after 0.8s..1s
/// - Attempt 2 fails: retry after 1.6s..2s
/// - Attempt 3 fails: budget exhausted
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use eventflow::RetryPolicy;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
///
/// let strict = RetryPolicy {
///     max_attempts: 10,
///     base_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(60),
///     jitter: 0.0,
/// };
/// assert_eq!(strict.backoff_duration(3), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Default: 3.
    pub max_attempts: u32,

    /// Base delay for exponential backoff. Default: 1 second.
    pub base_delay: Duration,

    /// Maximum delay between retries. Default: 5 minutes (300 seconds).
    pub max_delay: Duration,

    /// Fraction of the delay that may be shaved off at random, in `[0, 1]`.
    /// Default: 0.2.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, for tests and latency-insensitive work.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Returns `true` if another attempt should be made.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Deterministic backoff before the attempt after `attempt`.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(multiplier);
        delay.min(self.max_delay)
    }

    /// Backoff with jitter applied, drawn from `[d * (1 - jitter), d]`.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        self.jittered_backoff_with(attempt, &mut rand::thread_rng())
    }

    pub(crate) fn jittered_backoff_with<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        rng: &mut R,
    ) -> Duration {
        let delay = self.backoff_duration(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rng.gen_range((1.0 - jitter)..=1.0);
        delay.mul_f64(factor)
    }
}

/// Run `operation`, retrying transient failures according to `policy`.
///
/// Non-transient errors are returned immediately. After `max_attempts`
/// transient failures the last error is returned.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && policy.should_retry(attempt) => {
                let delay = policy.jittered_backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
