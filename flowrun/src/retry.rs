//! Backoff for work that failed and is tried again later.
//!
//! [`RetryState`] keeps per-key failure counts so that the controller's work
//! queue can delay a failing run more each time it comes back, while other
//! runs keep flowing. [`with_retry`] wraps a single fallible call.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for retry behavior.
///
/// The delay doubles with every failure of a key, starting at
/// `base_delay_ms` and capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Failures tolerated per key before giving up.
    pub max_retries: usize,
    /// Delay after the first failure, in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Replace the upper half of each delay with a random amount.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 5,
            max_delay_ms: 1_000_000,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the failure budget per key.
    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay after `failures` earlier failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(failures))
            .min(self.max_delay_ms);

        let half = delay / 2;
        let delay = if self.jitter && half > 0 {
            half + rand::thread_rng().gen_range(0..=half)
        } else {
            delay
        };
        Duration::from_millis(delay)
    }
}

/// Per-key failure counts.
#[derive(Debug, Default)]
pub struct RetryState {
    failures: HashMap<String, u32>,
}

impl RetryState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a failure of `key` and returns how long to wait before trying
    /// it again.
    pub fn next_delay(&mut self, key: &str, config: &RetryConfig) -> Duration {
        let failures = self.failures.entry(key.to_string()).or_insert(0);
        let delay = config.delay_for(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    /// Failures counted for `key` since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &str) -> usize {
        self.failures.get(key).map_or(0, |n| *n as usize)
    }

    /// Returns true if `key` used up its failure budget.
    #[must_use]
    pub fn is_exhausted(&self, key: &str, config: &RetryConfig) -> bool {
        self.num_requeues(key) >= config.max_retries
    }

    /// Clears the failures of `key`.
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Runs `operation` until it succeeds or `config.max_retries` retries
/// failed, sleeping the backoff delay in between.
///
/// # Errors
///
/// Returns the last error once the budget is spent.
pub async fn with_retry<T, E, F, Fut>(config: &RetryConfig, key: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut state = RetryState::new();
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if state.is_exhausted(key, config) => return Err(e),
            Err(e) => {
                let delay = state.next_delay(key, config);
                tracing::debug!(
                    key,
                    attempt = state.num_requeues(key),
                    delay = ?delay,
                    error = %e,
                    "Retrying after error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
