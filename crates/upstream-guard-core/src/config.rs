//! # Guard Configuration
//!
//! Immutable configuration for every mechanism, loaded once at startup and
//! handed to each component at construction.
//!
//! Every struct uses `#[serde(default)]` so partial YAML/TOML/JSON files and
//! environment overrides only need to name the values they change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::circuit_breaker::{upstream_api_circuit_breaker_config, CircuitBreakerConfig};
use crate::retry::{upstream_api_retry_policy, RetryPolicy};
use crate::{GuardError, GuardResult, PlanTier, ServiceName};

/// Complete configuration for the protected call pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Breaker settings shared by every service unless overridden
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry policy applied inside each admitted call
    pub retry: RetryPolicy,

    pub rate_limit: RateLimitConfig,

    pub cache: CacheConfig,

    /// Per-service overrides keyed by service name
    pub services: HashMap<String, ServiceOverrides>,

    /// Redis connection URL; the in-memory store is used when unset
    pub counter_store_url: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: upstream_api_circuit_breaker_config("default"),
            retry: upstream_api_retry_policy(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            services: HashMap::new(),
            counter_store_url: None,
        }
    }
}

impl GuardConfig {
    /// Breaker configuration for a service, with its overrides applied.
    pub fn breaker_config_for(&self, service: &ServiceName) -> CircuitBreakerConfig {
        let mut config = self.circuit_breaker.for_service(service.as_str());

        if let Some(overrides) = self.services.get(service.as_str()) {
            if let Some(threshold) = overrides.failure_threshold {
                config.failure_threshold = threshold;
            }
            if let Some(reset_timeout_ms) = overrides.reset_timeout_ms {
                config.reset_timeout_ms = reset_timeout_ms;
            }
            if let Some(call_timeout_ms) = overrides.call_timeout_ms {
                config.call_timeout_ms = call_timeout_ms;
            }
        }

        config
    }

    /// Check that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::Configuration`] naming the first invalid field.
    pub fn validate(&self) -> GuardResult<()> {
        validate_breaker("circuit_breaker", &self.circuit_breaker)?;

        if self.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(invalid("retry.backoff_multiplier must be a finite value >= 1.0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_percent) {
            return Err(invalid("retry.jitter_percent must be between 0.0 and 1.0"));
        }

        if self.rate_limit.window_seconds == 0 {
            return Err(invalid("rate_limit.window_seconds must be at least 1"));
        }
        if self.rate_limit.free_limit == 0 || self.rate_limit.pro_limit == 0 {
            return Err(invalid("rate_limit plan limits must be at least 1"));
        }
        if self.rate_limit.analytics_ttl_seconds == 0 {
            return Err(invalid("rate_limit.analytics_ttl_seconds must be at least 1"));
        }

        if self.cache.default_ttl_seconds == 0 {
            return Err(invalid("cache.default_ttl_seconds must be at least 1"));
        }
        if self.cache.key_prefix.is_empty() || self.cache.key_prefix.contains(':') {
            return Err(invalid("cache.key_prefix must be non-empty and contain no ':'"));
        }
        if let Some((name, _)) = self.cache.service_ttl_seconds.iter().find(|(_, ttl)| **ttl == 0) {
            return Err(invalid(&format!(
                "cache.service_ttl_seconds.{} must be at least 1",
                name
            )));
        }

        for name in self.services.keys() {
            let service = ServiceName::new(name.as_str())
                .map_err(|e| invalid(&format!("services.{}: {}", name, e)))?;
            validate_breaker(&format!("services.{}", name), &self.breaker_config_for(&service))?;
        }

        Ok(())
    }
}

fn invalid(message: &str) -> GuardError {
    GuardError::Configuration {
        message: message.to_string(),
    }
}

fn validate_breaker(scope: &str, config: &CircuitBreakerConfig) -> GuardResult<()> {
    if config.failure_threshold == 0 {
        return Err(invalid(&format!("{}.failure_threshold must be at least 1", scope)));
    }
    if config.reset_timeout_ms == 0 {
        return Err(invalid(&format!("{}.reset_timeout_ms must be at least 1", scope)));
    }
    if config.call_timeout_ms == 0 {
        return Err(invalid(&format!("{}.call_timeout_ms must be at least 1", scope)));
    }
    Ok(())
}

// ============================================================================
// Rate Limit Configuration
// ============================================================================

/// Fixed-window quota settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length; the window starts at the first request
    pub window_seconds: u64,

    /// Requests per window on the FREE plan
    pub free_limit: u64,

    /// Requests per window on the PRO plan
    pub pro_limit: u64,

    /// How long an idle analytics record is kept
    pub analytics_ttl_seconds: u64,

    /// Maximum number of entries kept in an analytics history
    pub history_limit: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            free_limit: 10,
            pro_limit: 100,
            analytics_ttl_seconds: 86_400,
            history_limit: 100,
        }
    }
}

impl RateLimitConfig {
    /// Requests allowed per window for a plan
    pub fn limit_for(&self, plan: PlanTier) -> u64 {
        match plan {
            PlanTier::Free => self.free_limit,
            PlanTier::Pro => self.pro_limit,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn analytics_ttl(&self) -> Duration {
        Duration::from_secs(self.analytics_ttl_seconds)
    }
}

// ============================================================================
// Cache Configuration
// ============================================================================

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL used when a service has no override
    pub default_ttl_seconds: u64,

    /// TTL overrides keyed by service name
    pub service_ttl_seconds: HashMap<String, u64>,

    /// First segment of every cache key
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 300,
            service_ttl_seconds: HashMap::new(),
            key_prefix: "cache".to_string(),
        }
    }
}

impl CacheConfig {
    /// TTL for cached responses of a service
    pub fn ttl_for(&self, service: &ServiceName) -> Duration {
        let seconds = self
            .service_ttl_seconds
            .get(service.as_str())
            .copied()
            .unwrap_or(self.default_ttl_seconds);
        Duration::from_secs(seconds)
    }
}

// ============================================================================
// Per-Service Overrides
// ============================================================================

/// Breaker settings that replace the shared defaults for one service.
///
/// Cache TTL overrides live in [`CacheConfig::service_ttl_seconds`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverrides {
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub call_timeout_ms: Option<u64>,
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
