//! Upstream failure taxonomy.
//!
//! Fetch operations handed to the protected call report failures as
//! [`UpstreamError`]. The classification drives the default retry
//! predicate: network-level failures, 5xx and 429 are transient, every
//! other 4xx is a client error that retrying cannot fix.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ErrorCategory;

/// Normalized upstream response body.
///
/// Opaque to this crate; stored in the response cache as serialized JSON.
pub type Payload = serde_json::Value;

/// Failure of a single fetch against an upstream API.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum UpstreamError {
    /// The upstream refused the connection.
    #[error("Connection refused: {message}")]
    ConnectionRefused { message: String },

    /// The request to the upstream timed out.
    #[error("Upstream request timed out: {message}")]
    Timeout { message: String },

    /// Other transport-level failure (DNS, reset, TLS).
    #[error("Network error: {message}")]
    Network { message: String },

    /// The upstream answered with a non-success HTTP status.
    #[error("Upstream returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// The upstream answered but the body could not be used.
    #[error("Invalid upstream payload: {message}")]
    InvalidPayload { message: String },
}

impl UpstreamError {
    /// Convenience constructor for status failures.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// HTTP status code, if the upstream answered.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a fresh attempt could plausibly succeed.
    ///
    /// True for connection-refused, timeouts, network errors, HTTP 5xx and
    /// HTTP 429. False for other 4xx and for unusable payloads.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionRefused { .. } | Self::Timeout { .. } | Self::Network { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidPayload { .. } => false,
        }
    }

    /// Whether the upstream rejected the request itself (4xx other than 429).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Status { status, .. } if (400..500).contains(status) && *status != 429)
    }

    /// Get error category for monitoring and alerting
    pub fn category(&self) -> ErrorCategory {
        if self.is_retryable() {
            ErrorCategory::Transient
        } else {
            ErrorCategory::Permanent
        }
    }
}

#[cfg(test)]
#[path = "upstream_tests.rs"]
mod tests;
