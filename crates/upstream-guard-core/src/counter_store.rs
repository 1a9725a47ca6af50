//! # Shared Counter Store
//!
//! Key/value abstraction with per-key expiry and an atomic increment.
//!
//! Rate-limit counters, usage analytics and cached responses all live in the
//! counter store so they are shared by every process instance. Breaker state
//! is deliberately not stored here.
//!
//! ## Key Layout
//!
//! - `rate_limit:{service}:{caller}` - fixed-window request counter
//! - `analytics:{service}:{caller}` - JSON usage analytics record
//! - `cache:{service}:{digest}` - serialized upstream payload

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::{CallerId, ErrorCategory, ServiceName};

/// Storage for counters and small values with expiry.
///
/// Implementations must make [`CounterStore::increment`] atomic with respect
/// to concurrent increments of the same key from any process, and must apply
/// the expiry only when the increment creates the key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a value. Missing or expired keys yield `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, CounterStoreError>;

    /// Write a value that expires after `ttl`, replacing any previous value
    /// and expiry.
    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CounterStoreError>;

    /// Atomically add one to the integer at `key` and return the new value.
    ///
    /// A missing key counts as zero. When the key is created by this call,
    /// it expires after `ttl_if_created`; an existing key keeps its expiry.
    async fn increment(&self, key: &str, ttl_if_created: Duration)
        -> Result<u64, CounterStoreError>;
}

/// Errors reported by a counter store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterStoreError {
    /// The backing store could not be reached or refused the command.
    #[error("Counter store unavailable: {message}")]
    Unavailable { message: String },

    /// A stored value could not be interpreted (e.g. incrementing text).
    #[error("Invalid value at key '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// A value could not be encoded or decoded.
    #[error("Serialization failed: {message}")]
    Serialization { message: String },
}

impl CounterStoreError {
    /// Get error category for monitoring and alerting
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unavailable { .. } => ErrorCategory::Transient,
            Self::InvalidValue { .. } | Self::Serialization { .. } => ErrorCategory::Permanent,
        }
    }
}

impl From<serde_json::Error> for CounterStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

// ============================================================================
// Key Construction
// ============================================================================

/// Key of the fixed-window request counter for a caller on a service.
pub fn rate_limit_key(service: &ServiceName, caller: &CallerId) -> String {
    format!("rate_limit:{}:{}", service, caller)
}

/// Key of the usage analytics record for a caller on a service.
pub fn analytics_key(service: &ServiceName, caller: &CallerId) -> String {
    format!("analytics:{}:{}", service, caller)
}

/// Key of a cached response.
pub fn cache_key(prefix: &str, service: &ServiceName, digest: &str) -> String {
    format!("{}:{}:{}", prefix, service, digest)
}

#[cfg(test)]
#[path = "counter_store_tests.rs"]
mod tests;
