//! # Protected Call
//!
//! Single entry point for every outbound integration. Composes the
//! mechanisms in a fixed order:
//!
//! ```text
//! cache lookup
//!   -> (miss) rate limiter admission
//!   -> circuit breaker
//!        -> retry policy
//!             -> fetch
//!   -> (success) cache write
//! ```
//!
//! A cache hit returns immediately without consulting the limiter or the
//! upstream. A rate-limit rejection performs no upstream call and no cache
//! write. The whole retried sequence runs inside one breaker admission, so
//! it counts as one success or one failure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, field, info, instrument, Span};

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitMetrics, CircuitState, DefaultCircuitBreaker,
};
use crate::config::GuardConfig;
use crate::counter_store::CounterStore;
use crate::rate_limiter::{Admission, RateLimiter};
use crate::response_cache::{NormalizedParams, ResponseCache};
use crate::retry::RetryPolicy;
use crate::upstream::{Payload, UpstreamError};
use crate::{CallerId, CorrelationId, ErrorCategory, GuardResult, PlanTier, ServiceName};

type UpstreamBreaker = DefaultCircuitBreaker<Payload, UpstreamError>;

// ============================================================================
// Outcome and Errors
// ============================================================================

/// Successful protected call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub payload: Payload,

    /// `true` if served from the response cache
    pub cached: bool,

    /// Limiter decision; `None` for cache hits, which are not counted
    pub rate_limit: Option<Admission>,

    pub correlation_id: CorrelationId,
}

/// Coarse classification of a failed protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Degraded,
    Timeout,
    UpstreamTransient,
    UpstreamClient,
}

/// Failure of a protected call.
///
/// Every variant carries what a caller needs to build a response without
/// access to internal state.
#[derive(Debug, Error)]
pub enum ProtectedCallError {
    /// The caller's quota for this service is exhausted.
    #[error("Rate limit exceeded for {service}: {used}/{limit} requests on the {plan} plan")]
    RateLimited {
        service: ServiceName,
        used: u64,
        limit: u64,
        plan: PlanTier,
    },

    /// The service's circuit is open.
    #[error("Service {service} is temporarily unavailable, retry after {retry_after_seconds}s")]
    Degraded {
        service: ServiceName,
        retry_after_seconds: u64,
    },

    /// The admitted call exceeded the breaker's deadline.
    #[error("Call to {service} timed out after {timeout_ms}ms")]
    Timeout { service: ServiceName, timeout_ms: u64 },

    /// The upstream failed and retrying did not help.
    #[error("Upstream {service} failed: {source}")]
    Upstream {
        service: ServiceName,
        #[source]
        source: UpstreamError,
    },
}

impl ProtectedCallError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Degraded { .. } => ErrorKind::Degraded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Upstream { source, .. } if source.is_retryable() => ErrorKind::UpstreamTransient,
            Self::Upstream { .. } => ErrorKind::UpstreamClient,
        }
    }

    /// Retry-after hint for degraded services
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::Degraded {
                retry_after_seconds,
                ..
            } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// `(used, limit)` for rate-limit rejections
    pub fn rate_limit(&self) -> Option<(u64, u64)> {
        match self {
            Self::RateLimited { used, limit, .. } => Some((*used, *limit)),
            _ => None,
        }
    }

    pub fn service(&self) -> &ServiceName {
        match self {
            Self::RateLimited { service, .. }
            | Self::Degraded { service, .. }
            | Self::Timeout { service, .. }
            | Self::Upstream { service, .. } => service,
        }
    }

    /// Get error category for monitoring and alerting
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::RateLimited { .. } | Self::Degraded { .. } => ErrorCategory::Backpressure,
            Self::Timeout { .. } => ErrorCategory::Transient,
            Self::Upstream { source, .. } => source.category(),
        }
    }

    fn from_breaker(service: &ServiceName, error: CircuitBreakerError<UpstreamError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { retry_after_ms } => Self::Degraded {
                service: service.clone(),
                retry_after_seconds: retry_after_ms.div_ceil(1000),
            },
            CircuitBreakerError::Timeout { timeout_ms } => Self::Timeout {
                service: service.clone(),
                timeout_ms,
            },
            CircuitBreakerError::OperationFailed(source) => Self::Upstream {
                service: service.clone(),
                source,
            },
        }
    }
}

// ============================================================================
// Service Status
// ============================================================================

/// Whether a service is currently accepting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAvailability {
    Available,
    Unavailable,
}

/// Breaker view of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: ServiceName,
    pub state: CircuitState,
    pub availability: ServiceAvailability,
    pub metrics: CircuitMetrics,
}

// ============================================================================
// Protected Call Facade
// ============================================================================

/// Composition of cache, rate limiter, circuit breakers and retry.
///
/// One breaker is created lazily per service and lives as long as the facade.
pub struct ProtectedCall {
    config: GuardConfig,
    limiter: RateLimiter,
    cache: ResponseCache,
    retry: RetryPolicy,
    breakers: RwLock<HashMap<ServiceName, UpstreamBreaker>>,
}

impl ProtectedCall {
    /// Build the facade over a counter store.
    ///
    /// # Errors
    ///
    /// Returns [`crate::GuardError::Configuration`] if `config` does not validate.
    pub fn new(store: Arc<dyn CounterStore>, config: GuardConfig) -> GuardResult<Self> {
        config.validate()?;

        Ok(Self {
            limiter: RateLimiter::new(Arc::clone(&store), config.rate_limit.clone()),
            cache: ResponseCache::new(store, config.cache.clone()),
            retry: config.retry.clone(),
            breakers: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Fetch data for `service` through every protection layer.
    ///
    /// `fetch` must be idempotent and free of side effects; it may be invoked
    /// several times by the retry policy, or not at all.
    ///
    /// # Errors
    ///
    /// - [`ProtectedCallError::RateLimited`] when the caller's quota is spent
    /// - [`ProtectedCallError::Degraded`] when the service's circuit is open
    /// - [`ProtectedCallError::Timeout`] when the call exceeded its deadline
    /// - [`ProtectedCallError::Upstream`] with the last upstream error
    #[instrument(skip_all, fields(
        service = %service,
        caller = %caller,
        plan = %plan,
        correlation_id = field::Empty,
    ))]
    pub async fn call<F, Fut>(
        &self,
        service: &ServiceName,
        params: &NormalizedParams,
        caller: &CallerId,
        plan: PlanTier,
        fetch: F,
    ) -> Result<CallOutcome, ProtectedCallError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<Payload, UpstreamError>> + Send,
    {
        let correlation_id = CorrelationId::new();
        Span::current().record("correlation_id", field::display(&correlation_id));

        if let Some(payload) = self.cache.get(service, params).await {
            return Ok(CallOutcome {
                payload,
                cached: true,
                rate_limit: None,
                correlation_id,
            });
        }

        let admission = self.limiter.admit(service, caller, plan).await;
        if !admission.allowed {
            return Err(ProtectedCallError::RateLimited {
                service: service.clone(),
                used: admission.used,
                limit: admission.limit,
                plan: admission.plan,
            });
        }

        let breaker = self.breaker_for(service);
        let retry = &self.retry;
        let fetch = &fetch;
        let operation_name = service.as_str();

        let payload = match breaker
            .call(|| async move { retry.execute(operation_name, fetch).await })
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                let error = ProtectedCallError::from_breaker(service, e);
                debug!(
                    kind = ?error.kind(),
                    category = ?error.category(),
                    error = %error,
                    "Protected call failed"
                );
                return Err(error);
            }
        };

        self.cache.set(service, params, &payload).await;

        debug!(used = admission.used, limit = admission.limit, "Protected call succeeded");

        Ok(CallOutcome {
            payload,
            cached: false,
            rate_limit: Some(admission),
            correlation_id,
        })
    }

    /// Breaker for a service, created on first use.
    fn breaker_for(&self, service: &ServiceName) -> UpstreamBreaker {
        if let Some(breaker) = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
        {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(service.clone())
            .or_insert_with(|| {
                debug!(service = %service, "Creating circuit breaker");
                DefaultCircuitBreaker::new(self.config.breaker_config_for(service))
            })
            .clone()
    }

    /// Breaker state, metrics and availability of a service.
    pub fn service_status(&self, service: &ServiceName) -> ServiceStatus {
        let metrics = self.breaker_for(service).metrics();
        let availability = if metrics.state.allows_requests() {
            ServiceAvailability::Available
        } else {
            ServiceAvailability::Unavailable
        };

        ServiceStatus {
            service: service.clone(),
            state: metrics.state,
            availability,
            metrics,
        }
    }

    /// Status of every service that has a breaker, sorted by name.
    pub fn all_service_statuses(&self) -> Vec<ServiceStatus> {
        let mut services: Vec<ServiceName> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        services.sort();

        services.iter().map(|s| self.service_status(s)).collect()
    }

    /// Force a service's circuit closed and clear its metrics.
    pub fn reset_breaker(&self, service: &ServiceName) {
        self.breaker_for(service).reset();
        info!(service = %service, "Circuit breaker reset");
    }
}

#[cfg(test)]
#[path = "protected_call_tests.rs"]
mod tests;
