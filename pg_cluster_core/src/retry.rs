//! Retry policy for external calls
//!
//! Random exponential backoff: before attempt `n + 1` the caller sleeps for a
//! uniformly random duration in `[0, min(max_backoff, multiplier * 2^n)]`
//! seconds. Attempts stop once the wall-clock ceiling has been crossed or an
//! error is not retryable.

use crate::config::RetryConfig;
use crate::error::{ClusterError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Capped random exponential backoff with a wall-clock ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total time allowed across all attempts
    pub max_elapsed: Duration,
    /// Backoff multiplier, in seconds
    pub multiplier: f64,
    /// Upper bound for a single backoff
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_elapsed: Duration, multiplier: f64, max_backoff: Duration) -> Self {
        Self {
            max_elapsed,
            multiplier,
            max_backoff,
        }
    }

    /// Build a policy from settings with a specific backoff cap (seconds)
    pub fn from_config(config: &RetryConfig, max_backoff_secs: u64) -> Self {
        Self::new(
            config.max_elapsed_duration(),
            config.multiplier,
            Duration::from_secs(max_backoff_secs),
        )
    }

    /// Upper bound of the backoff before attempt `attempt + 1`
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = self.multiplier * 2f64.powi(attempt.min(32) as i32);
        let cap = self.max_backoff.as_secs_f64();
        Duration::from_secs_f64(exp.min(cap).max(0.0))
    }

    /// Random backoff before attempt `attempt + 1`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let mut rng = rand::thread_rng();
        Duration::from_secs_f64(rng.gen_range(0.0..=ceiling.as_secs_f64()))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// ceiling is crossed
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_retryable() {
                return Err(error);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.max_elapsed {
                tracing::error!(
                    operation = operation,
                    attempts = attempt + 1,
                    "Giving up after {:?}: {}",
                    elapsed,
                    error
                );
                return Err(ClusterError::RetryExhausted {
                    operation: operation.to_string(),
                    elapsed,
                    source: Box::new(error),
                });
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                operation = operation,
                attempt = attempt + 1,
                "Attempt failed, retrying in {:?}: {}",
                delay,
                error
            );
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let config = RetryConfig::default();
        Self::from_config(&config, config.max_backoff)
    }
}

/// Poll `op` at a fixed interval until it yields a value
///
/// `Ok(None)` and retryable errors both mean "not yet". Other errors end the
/// wait.
pub async fn poll_until<T, F, Fut>(operation: &str, interval: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    loop {
        match op().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {
                tracing::info!(operation = operation, "Not ready, polling again in {:?}", interval);
            }
            Err(error) if error.is_retryable() => {
                tracing::warn!(operation = operation, "Poll failed, retrying in {:?}: {}", interval, error);
            }
            Err(error) => return Err(error),
        }
        tokio::time::sleep(interval).await;
    }
}
