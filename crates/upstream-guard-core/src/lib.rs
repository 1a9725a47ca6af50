//! # Upstream Guard Core
//!
//! Resilience and caching layer for outbound calls to quota-limited
//! third-party APIs (weather, news, crypto and friends).
//!
//! Every outbound integration goes through a single protected call:
//!
//! ```text
//! response cache -> rate limiter -> circuit breaker -> retry policy -> fetch
//! ```
//!
//! ## Architecture
//!
//! - Mechanisms depend only on trait abstractions ([`CounterStore`],
//!   [`circuit_breaker::CircuitBreaker`])
//! - Shared state that must be consistent across process instances lives in
//!   the counter store; breaker state is process-local
//! - Configuration is an immutable [`GuardConfig`] handed to each component
//!   at construction
//!
//! ## Usage
//!
//! ```rust
//! use upstream_guard_core::{PlanTier, ServiceName};
//!
//! let service = ServiceName::weather();
//! assert_eq!(service.as_str(), "weather");
//! assert_eq!(PlanTier::parse("Pro"), PlanTier::Pro);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Standard result type for upstream-guard operations
pub type GuardResult<T> = Result<T, GuardError>;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Name of a protected upstream service.
///
/// Used as the breaker registry key and as a component of every counter
/// store key, so it is restricted to lowercase ASCII letters, digits, `-`
/// and `_`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceName(String);

impl ServiceName {
    /// Create new service name with validation
    ///
    /// # Validation Rules
    /// - Must be 1-64 characters
    /// - Must contain only lowercase ASCII letters, digits, `-` and `_`
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "service_name".to_string(),
            });
        }

        if name.len() > 64 {
            return Err(ValidationError::TooLong {
                field: "service_name".to_string(),
                max_length: 64,
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        {
            return Err(ValidationError::InvalidCharacters {
                field: "service_name".to_string(),
                invalid_chars: "only lowercase letters, digits, '-' and '_' allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Weather upstream
    pub fn weather() -> Self {
        Self("weather".to_string())
    }

    /// News upstream
    pub fn news() -> Self {
        Self("news".to_string())
    }

    /// Crypto market upstream
    pub fn crypto() -> Self {
        Self("crypto".to_string())
    }

    /// The three upstreams the aggregator ships with
    pub fn well_known() -> Vec<Self> {
        vec![Self::weather(), Self::news(), Self::crypto()]
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ServiceName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identity of the caller a quota is charged to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    /// Create new caller ID
    ///
    /// Rejects empty identifiers and identifiers containing whitespace or
    /// `:` (the counter store key separator).
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "caller_id".to_string(),
            });
        }

        if value.len() > 128 {
            return Err(ValidationError::TooLong {
                field: "caller_id".to_string(),
                max_length: 128,
            });
        }

        if value.chars().any(|c| c.is_whitespace() || c == ':') {
            return Err(ValidationError::InvalidCharacters {
                field: "caller_id".to_string(),
                invalid_chars: "whitespace or ':'".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CallerId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Subscription plan that determines a caller's per-minute quota.
///
/// Closed set. Anything unrecognized is treated as [`PlanTier::Free`] and is
/// never a reason to reject a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
}

impl PlanTier {
    /// Parse a plan name case-insensitively, defaulting to `Free`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "PRO" => Self::Pro,
            "FREE" => Self::Free,
            _ => Self::Free,
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "FREE",
            Self::Pro => "PRO",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Time and Metadata Types
// ============================================================================

/// UTC wall-clock timestamp.
///
/// Used for observational data (analytics history, breaker metrics). Window
/// and deadline arithmetic uses tokio's monotonic clock instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Identifier for tracing a single protected call through the log
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// High-level error categorization for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Temporary failures that should be retried
    Transient,
    /// Permanent failures that won't succeed on retry
    Permanent,
    /// Structural backpressure (open circuit, exhausted quota); never retried locally
    Backpressure,
}

/// Error type for input validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },

    #[error("Field '{field}' contains invalid characters: {invalid_chars}")]
    InvalidCharacters {
        field: String,
        invalid_chars: String,
    },
}

/// Top-level error type for setup-time failures
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

// ============================================================================
// Module declarations
// ============================================================================

/// Circuit breaker guarding each upstream
pub mod circuit_breaker;

/// Immutable configuration for every mechanism
pub mod config;

/// Shared counter store abstraction
pub mod counter_store;

/// Counter store implementations
pub mod adapters;

/// Composition of all mechanisms into one call
pub mod protected_call;

/// Fixed-window per-caller quotas and usage analytics
pub mod rate_limiter;

/// TTL cache of upstream responses
pub mod response_cache;

/// Bounded exponential-backoff retry
pub mod retry;

/// Upstream failure taxonomy
pub mod upstream;

// Re-export key types for convenience
pub use adapters::InMemoryCounterStore;
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitMetrics, CircuitState,
    DefaultCircuitBreaker,
};
pub use config::{CacheConfig, GuardConfig, RateLimitConfig, ServiceOverrides};
pub use counter_store::{CounterStore, CounterStoreError};
pub use protected_call::{
    CallOutcome, ErrorKind, ProtectedCall, ProtectedCallError, ServiceAvailability,
    ServiceStatus,
};
pub use rate_limiter::{
    Admission, RateLimiter, ServiceUsage, UsageAnalytics, UsageEntry, UsageStatus,
};
pub use response_cache::{CacheStatsSnapshot, NormalizedParams, ResponseCache};
pub use retry::RetryPolicy;
pub use upstream::{Payload, UpstreamError};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
