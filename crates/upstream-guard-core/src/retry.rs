//! # Retry Policy Module
//!
//! Bounded exponential-backoff retry around a single upstream attempt.
//!
//! A policy is immutable configuration; every [`RetryPolicy::execute`] call
//! is independent and keeps its attempt count on the stack.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::upstream::UpstreamError;

/// Errors that know whether another attempt could succeed.
pub trait RetryableError {
    /// `true` if the failed operation may be attempted again.
    fn is_retryable(&self) -> bool;
}

impl RetryableError for UpstreamError {
    fn is_retryable(&self) -> bool {
        UpstreamError::is_retryable(self)
    }
}

/// Retry policy configuration for exponential backoff
///
/// # Examples
///
/// ```rust
/// use upstream_guard_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// // Default policy: 3 attempts, 1s base, 10s max, 2.0x multiplier
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.calculate_delay(2), Duration::from_secs(2));
///
/// // Custom policy
/// let policy = RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(2), 1.5);
/// assert_eq!(policy.max_retries, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_retries: u32,

    /// Delay before the second attempt (ms)
    pub base_delay_ms: u64,

    /// Cap on any single delay (ms)
    pub max_delay_ms: u64,

    /// Exponential growth factor applied per attempt
    pub backoff_multiplier: f64,

    /// Whether to randomize delays around the computed value
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy without jitter
    ///
    /// # Arguments
    ///
    /// * `max_retries` - Total attempts (1 disables retrying)
    /// * `base_delay` - Delay before the second attempt
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Exponential growth factor
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            base_delay_ms: base_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier,
            use_jitter: false,
            jitter_percent: 0.25,
        }
    }

    /// Enable jitter with the given fraction (clamped to 0.0..=1.0)
    pub fn with_jitter(mut self, percent: f64) -> Self {
        self.use_jitter = true;
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the given failed attempt (1-based)
    ///
    /// `min(base * multiplier^(attempt-1), max)`, optionally jittered.
    ///
    /// ```rust
    /// use upstream_guard_core::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(5), 2.0);
    /// assert_eq!(policy.calculate_delay(1), Duration::from_secs(1));
    /// assert_eq!(policy.calculate_delay(3), Duration::from_secs(4));
    /// assert_eq!(policy.calculate_delay(4), Duration::from_secs(5));
    /// ```
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay_ms = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay_ms = base_delay_ms.min(self.max_delay_ms as f64);

        let final_delay_ms = if self.use_jitter {
            Self::add_jitter(capped_delay_ms, self.jitter_percent)
        } else {
            capped_delay_ms
        };

        Duration::from_secs_f64(final_delay_ms.max(0.0) / 1000.0)
    }

    /// Check whether another attempt is allowed after `attempt` (1-based) failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_ms: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_ms * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_ms;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        (delay_ms + jitter).max(0.0)
    }

    /// Run `operation` with the error type's own retry classification.
    ///
    /// # Errors
    ///
    /// Returns the last error from `operation`, unchanged, once it is not
    /// retryable or the attempt budget is spent.
    pub async fn execute<F, Fut, T, E>(&self, operation_name: &str, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        self.execute_with(operation_name, operation, |e: &E| e.is_retryable())
            .await
    }

    /// Run `operation`, retrying while `retry_predicate` returns `true`.
    ///
    /// # Errors
    ///
    /// Returns the last error from `operation`, unchanged.
    pub async fn execute_with<F, Fut, T, E, P>(
        &self,
        operation_name: &str,
        mut operation: F,
        retry_predicate: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut state = RetryState::new();

        loop {
            debug!(
                operation = operation_name,
                attempt = state.attempt,
                max_retries = self.max_retries,
                "Attempting operation"
            );

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !retry_predicate(&e) {
                        debug!(
                            operation = operation_name,
                            attempt = state.attempt,
                            error = %e,
                            "Error is not retryable"
                        );
                        return Err(e);
                    }

                    if !state.can_retry(self) {
                        warn!(
                            operation = operation_name,
                            attempts = state.attempt,
                            error = %e,
                            "Retry attempts exhausted"
                        );
                        return Err(e);
                    }

                    let delay = state.get_delay(self);
                    debug!(
                        operation = operation_name,
                        attempt = state.attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                    state.next_attempt();
                }
            }
        }
    }
}

/// Retry policy for third-party data APIs: 3 attempts, 1s base, 5s cap, doubling.
pub fn upstream_api_retry_policy() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(5), 2.0)
}

/// Attempt tracker for a single retried operation
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Current attempt (1-based)
    pub attempt: u32,
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryState {
    /// Create new retry state at the first attempt
    pub fn new() -> Self {
        Self { attempt: 1 }
    }

    /// Move to the next attempt
    pub fn next_attempt(&mut self) {
        self.attempt += 1;
    }

    /// Delay before the next attempt
    pub fn get_delay(&self, policy: &RetryPolicy) -> Duration {
        policy.calculate_delay(self.attempt)
    }

    /// Check if the policy allows another attempt
    pub fn can_retry(&self, policy: &RetryPolicy) -> bool {
        policy.should_retry(self.attempt)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
