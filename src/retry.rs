//! Exponential backoff with jitter.
//!
//! [`RetryConfig`] is shared by two callers: [`retry_with_backoff`] for
//! one-off calls made at start-up, and [`FailureBackoff`], which the
//! controllers' error policies use to space out requeues of an object that
//! keeps failing.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per consecutive failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Un-jittered delay after `failures` consecutive failures, capped at `max_delay`.
    ///
    /// `failures` counts from 1; zero is treated as one.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// [`Self::delay_for`] with 0.5x to 1.5x jitter applied
    pub fn jittered_delay_for(&self, failures: u32) -> Duration {
        jitter(self.delay_for(failures))
    }
}

/// Scale a delay by a random factor in 0.5..1.5
pub fn jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Consecutive-failure counters per object, mapped to a requeue delay.
///
/// Keys are whatever identifies an object to its controller, usually
/// `namespace/name`. A successful reconcile must call [`Self::reset`].
#[derive(Debug)]
pub struct FailureBackoff {
    config: RetryConfig,
    failures: DashMap<String, u32>,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self::new(RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        })
    }
}

impl FailureBackoff {
    /// Create an empty tracker
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            failures: DashMap::new(),
        }
    }

    /// Record one more failure for `key` and return how long to wait.
    ///
    /// Errors that retrying cannot fix wait the full `max_delay`.
    pub fn next_delay(&self, key: &str, retryable: bool) -> Duration {
        let failures = {
            let mut count = self.failures.entry(key.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        if retryable {
            self.config.jittered_delay_for(failures).min(self.config.max_delay)
        } else {
            self.config.max_delay
        }
    }

    /// Forget the failures of `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Run an async operation until it succeeds or `max_attempts` is exhausted.
///
/// Returns the last error once attempts run out.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(operation = %operation_name, attempt, error = %e, "giving up after max attempts");
                    return Err(e);
                }
                let delay = config.jittered_delay_for(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
