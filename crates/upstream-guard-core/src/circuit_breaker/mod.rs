//! Circuit breaker protecting each upstream from continued load while it fails.
//!
//! # Circuit Breaker States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Upstream is failing, requests are rejected immediately
//! - **Half-Open**: Reset timeout elapsed, exactly one trial request admitted
//!
//! One breaker exists per upstream service; a failing upstream never
//! affects another upstream's breaker. Breaker state is process-local.
//!
//! # Example
//!
//! ```rust
//! use upstream_guard_core::circuit_breaker::{
//!     upstream_api_circuit_breaker_config, CircuitBreaker, CircuitState, DefaultCircuitBreaker,
//! };
//!
//! let breaker: DefaultCircuitBreaker<String, String> =
//!     DefaultCircuitBreaker::new(upstream_api_circuit_breaker_config("weather"));
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::Timestamp;

mod breaker;
pub use breaker::DefaultCircuitBreaker;

// ============================================================================
// Circuit Breaker Trait
// ============================================================================

/// Circuit breaker protection for upstream operations.
///
/// # Type Parameters
///
/// - `T`: Success result type
/// - `E`: Operation error type
#[async_trait]
pub trait CircuitBreaker<T, E>: Send + Sync {
    /// Execute operation with circuit breaker protection.
    ///
    /// # Behavior
    ///
    /// - **Closed State**: Execute operation under the call deadline, track failures
    /// - **Open State**: Reject with `CircuitOpen` without invoking `operation`,
    ///   until the reset timeout has elapsed
    /// - **Half-Open State**: Admit a single trial call; concurrent calls are
    ///   rejected while it is in flight
    ///
    /// The outcome is recorded even if the returned future is dropped before
    /// completion; a cancelled call counts as a failure.
    async fn call<F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send;

    /// Get current circuit breaker state.
    fn state(&self) -> CircuitState;

    /// Get circuit breaker metrics and statistics.
    fn metrics(&self) -> CircuitMetrics;

    /// Reset circuit breaker to closed state (admin operation).
    ///
    /// Forces the circuit back to closed state and clears all counters.
    fn reset(&self);
}

// ============================================================================
// Circuit State
// ============================================================================

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, allowing requests through.
    Closed,

    /// Circuit is open, rejecting all requests until the reset timeout elapses.
    Open,

    /// Circuit is half-open, admitting a single trial request.
    HalfOpen,
}

impl CircuitState {
    /// Check if requests may be admitted in current state.
    pub fn allows_requests(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Configuration for circuit breaker behavior.
///
/// # Default Configuration
///
/// - Failure threshold: 5 consecutive failures
/// - Reset timeout: 60 seconds
/// - Call timeout: 10 seconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Service name for identification in logs and metrics.
    pub service_name: String,

    /// Number of consecutive failures that trips the circuit.
    pub failure_threshold: u32,

    /// Time the circuit stays open before a trial request is admitted (ms).
    pub reset_timeout_ms: u64,

    /// Hard deadline for a single admitted call (ms).
    pub call_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    /// Reset timeout as a `Duration`.
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    /// Call deadline as a `Duration`.
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Copy of this configuration bound to another service name.
    pub fn for_service(&self, service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..self.clone()
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            call_timeout_ms: 10_000,
        }
    }
}

// ============================================================================
// Circuit Metrics
// ============================================================================

/// Metrics and statistics for circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitMetrics {
    /// Current circuit state.
    pub state: CircuitState,

    /// Total number of admitted requests that completed.
    pub total_requests: u64,

    /// Number of successful requests.
    pub successful_requests: u64,

    /// Number of failed requests (including timeouts and cancellations).
    pub failed_requests: u64,

    /// Number of requests rejected without invoking the operation.
    pub rejected_requests: u64,

    /// Current failure count.
    pub consecutive_failures: u32,

    /// Time when circuit last changed state.
    pub last_state_change: Timestamp,

    /// Milliseconds until a trial request will be admitted (open state only).
    pub next_attempt_in_ms: Option<u64>,

    /// Current failure rate (0.0 to 1.0).
    pub failure_rate: f64,

    /// Average response time in milliseconds.
    pub avg_response_time_ms: f64,
}

// ============================================================================
// Circuit Breaker Error
// ============================================================================

/// Errors returned by a circuit-breaker-protected call.
///
/// Wraps operation errors and adds circuit breaker-specific failures.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit breaker is open; the operation was not invoked.
    #[error("Circuit breaker is open - retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    /// Operation exceeded the call deadline.
    #[error("Operation timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Operation failed with its own error.
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

// ============================================================================
// Service-Specific Configurations
// ============================================================================

/// Circuit breaker configuration for third-party data APIs.
///
/// Tuned for quota-limited public APIs:
/// - 3 consecutive failures to trip
/// - 30 second reset timeout
/// - 15 second call timeout (covers a full retry sequence)
pub fn upstream_api_circuit_breaker_config(service_name: &str) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        service_name: service_name.to_string(),
        failure_threshold: 3,
        reset_timeout_ms: 30_000,
        call_timeout_ms: 15_000,
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
