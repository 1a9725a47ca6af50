//! Default circuit breaker implementation.
//!
//! State lives behind a `Mutex` that is never held across an await point.
//! Deadlines and the reset timeout use tokio's clock so they follow a paused
//! runtime in tests.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitMetrics, CircuitState,
};
use crate::Timestamp;

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
struct InternalState {
    current_state: CircuitState,

    /// Failures since the last success
    consecutive_failures: u32,

    /// Set while the single half-open trial call is running
    trial_in_flight: bool,

    /// When the running trial call hits its deadline
    trial_deadline: Option<Instant>,

    last_state_change: Timestamp,

    /// Only meaningful while open
    next_attempt_at: Option<Instant>,

    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
    total_response_time_ms: f64,
}

impl InternalState {
    fn new() -> Self {
        Self {
            current_state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_in_flight: false,
            trial_deadline: None,
            last_state_change: Timestamp::now(),
            next_attempt_at: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
            total_response_time_ms: 0.0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }

    fn avg_response_time_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_response_time_ms / self.total_requests as f64
        }
    }
}

/// Shortest retry hint given while a trial call is running.
const MIN_HALF_OPEN_RETRY_MS: u64 = 1_000;

/// Round a remaining duration up to whole milliseconds.
fn ceil_millis(remaining: Duration) -> u64 {
    let millis = remaining.as_millis() as u64;
    if remaining.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

// ============================================================================
// Default Circuit Breaker
// ============================================================================

/// Default circuit breaker implementation.
///
/// Cheap to clone; clones share the same state.
pub struct DefaultCircuitBreaker<T, E> {
    config: CircuitBreakerConfig,
    state: Arc<Mutex<InternalState>>,
    _phantom: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Clone for DefaultCircuitBreaker<T, E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            _phantom: PhantomData,
        }
    }
}

impl<T, E> DefaultCircuitBreaker<T, E> {
    /// Create new circuit breaker with configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(InternalState::new())),
            _phantom: PhantomData,
        }
    }

    /// Configuration this breaker was built with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Time remaining until a trial request is admitted, if the circuit is open.
    pub fn retry_after(&self) -> Option<Duration> {
        let state = self.lock();
        match (state.current_state, state.next_attempt_at) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    // Every mutation leaves the state consistent, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, InternalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may proceed, transitioning open -> half-open
    /// when the reset timeout has elapsed.
    fn admit(&self) -> Result<(), u64> {
        let mut state = self.lock();

        match state.current_state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = Instant::now();
                match state.next_attempt_at {
                    Some(at) if now < at => {
                        state.rejected_requests += 1;
                        Err(ceil_millis(at - now))
                    }
                    _ => {
                        self.transition_to_half_open(&mut state);
                        self.start_trial(&mut state, now);
                        Ok(())
                    }
                }
            }
            CircuitState::HalfOpen => {
                let now = Instant::now();
                if state.trial_in_flight {
                    state.rejected_requests += 1;
                    // The trial resolves by its deadline at the latest.
                    let remaining = state
                        .trial_deadline
                        .map(|deadline| ceil_millis(deadline.saturating_duration_since(now)))
                        .unwrap_or(0);
                    Err(remaining.max(MIN_HALF_OPEN_RETRY_MS))
                } else {
                    self.start_trial(&mut state, now);
                    Ok(())
                }
            }
        }
    }

    fn start_trial(&self, state: &mut InternalState, now: Instant) {
        state.trial_in_flight = true;
        state.trial_deadline = Some(now + self.config.call_timeout());
    }

    fn trip_circuit(&self, state: &mut InternalState) {
        state.current_state = CircuitState::Open;
        state.last_state_change = Timestamp::now();
        state.next_attempt_at = Some(Instant::now() + self.config.reset_timeout());
        state.trial_in_flight = false;
        state.trial_deadline = None;

        warn!(
            service = %self.config.service_name,
            failures = state.consecutive_failures,
            reset_timeout_ms = self.config.reset_timeout_ms,
            "Circuit breaker opened"
        );
    }

    fn transition_to_half_open(&self, state: &mut InternalState) {
        state.current_state = CircuitState::HalfOpen;
        state.last_state_change = Timestamp::now();
        state.next_attempt_at = None;

        debug!(
            service = %self.config.service_name,
            "Circuit breaker half-open, admitting trial request"
        );
    }

    fn close_circuit(&self, state: &mut InternalState) {
        let previous = state.current_state;
        state.current_state = CircuitState::Closed;
        state.last_state_change = Timestamp::now();
        state.next_attempt_at = None;
        state.consecutive_failures = 0;
        state.trial_in_flight = false;
        state.trial_deadline = None;

        if previous != CircuitState::Closed {
            info!(service = %self.config.service_name, "Circuit breaker closed");
        }
    }

    fn record_success(&self, response_time_ms: f64) {
        let mut state = self.lock();
        state.successful_requests += 1;
        state.total_requests += 1;
        state.total_response_time_ms += response_time_ms;
        state.consecutive_failures = 0;

        if state.current_state != CircuitState::Closed {
            self.close_circuit(&mut state);
        }
    }

    fn record_failure(&self, response_time_ms: f64) {
        let mut state = self.lock();
        state.failed_requests += 1;
        state.total_requests += 1;
        state.total_response_time_ms += response_time_ms;
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        // A failed trial reopens regardless of the count.
        if state.current_state == CircuitState::HalfOpen
            || state.consecutive_failures >= self.config.failure_threshold
        {
            self.trip_circuit(&mut state);
        }
    }
}

/// Records the outcome of an admitted call exactly once.
///
/// If the call future is dropped before the operation finishes, the drop
/// records a failure so a cancelled half-open trial cannot wedge the breaker.
struct AdmittedCall<'a, T, E> {
    breaker: &'a DefaultCircuitBreaker<T, E>,
    started: Instant,
    recorded: bool,
}

impl<'a, T, E> AdmittedCall<'a, T, E> {
    fn new(breaker: &'a DefaultCircuitBreaker<T, E>) -> Self {
        Self {
            breaker,
            started: Instant::now(),
            recorded: false,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn success(mut self) {
        self.recorded = true;
        self.breaker.record_success(self.elapsed_ms());
    }

    fn failure(mut self) {
        self.recorded = true;
        self.breaker.record_failure(self.elapsed_ms());
    }
}

impl<T, E> Drop for AdmittedCall<'_, T, E> {
    fn drop(&mut self) {
        if !self.recorded {
            warn!(
                service = %self.breaker.config.service_name,
                "Protected call cancelled before completion, recording failure"
            );
            self.breaker.record_failure(self.elapsed_ms());
        }
    }
}

#[async_trait]
impl<T, E> CircuitBreaker<T, E> for DefaultCircuitBreaker<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    async fn call<F, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, E>> + Send,
    {
        if let Err(retry_after_ms) = self.admit() {
            debug!(
                service = %self.config.service_name,
                retry_after_ms,
                "Circuit open, rejecting request"
            );
            return Err(CircuitBreakerError::CircuitOpen { retry_after_ms });
        }

        let admitted = AdmittedCall::new(self);
        let call_timeout = self.config.call_timeout();

        match timeout(call_timeout, operation()).await {
            Ok(Ok(value)) => {
                admitted.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                admitted.failure();
                Err(CircuitBreakerError::OperationFailed(e))
            }
            Err(_) => {
                admitted.failure();
                warn!(
                    service = %self.config.service_name,
                    timeout_ms = self.config.call_timeout_ms,
                    "Protected call exceeded deadline"
                );
                Err(CircuitBreakerError::Timeout {
                    timeout_ms: self.config.call_timeout_ms,
                })
            }
        }
    }

    fn state(&self) -> CircuitState {
        self.lock().current_state
    }

    fn metrics(&self) -> CircuitMetrics {
        let state = self.lock();
        let now = Instant::now();

        CircuitMetrics {
            state: state.current_state,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            consecutive_failures: state.consecutive_failures,
            last_state_change: state.last_state_change,
            next_attempt_in_ms: match state.current_state {
                CircuitState::Open => state
                    .next_attempt_at
                    .map(|at| ceil_millis(at.saturating_duration_since(now))),
                _ => None,
            },
            failure_rate: state.failure_rate(),
            avg_response_time_ms: state.avg_response_time_ms(),
        }
    }

    fn reset(&self) {
        let mut state = self.lock();
        self.close_circuit(&mut state);
        state.total_requests = 0;
        state.successful_requests = 0;
        state.failed_requests = 0;
        state.rejected_requests = 0;
        state.total_response_time_ms = 0.0;
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
