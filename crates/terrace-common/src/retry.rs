//! Short in-cycle retries with exponential backoff and jitter
//!
//! Meant for store writes that lose an optimistic-concurrency race. Anything
//! that needs seconds or minutes goes through the controller requeue and
//! [`backoff_delay`] instead.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Bounds of a retry loop
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first one; 0 is treated as 1
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between delays
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Three quick attempts, for status writes racing another writer
    pub const fn status_write() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let grown = delay.as_secs_f64() * self.backoff_multiplier;
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }
}

/// Scale `delay` by a random factor in [0.5, 1.5)
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or runs out of attempts
///
/// The last error is returned unchanged.
pub async fn retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !should_retry(&error) {
            return Err(error);
        }
        if attempt >= attempts {
            warn!(operation = %operation_name, attempt, error = %error, "giving up after retries");
            return Err(error);
        }

        let wait = jittered(delay);
        debug!(
            operation = %operation_name,
            attempt,
            error = %error,
            delay_ms = wait.as_millis(),
            "retrying"
        );
        tokio::time::sleep(wait).await;
        delay = config.next_delay(delay);
    }
}

/// Delay before the next attempt after `failures` consecutive failures:
/// `base * 2^(failures-1)`, capped at `max`.
pub fn backoff_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}
