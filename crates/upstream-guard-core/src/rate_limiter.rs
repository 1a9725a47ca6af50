//! # Rate Limiter
//!
//! Fixed-window request quotas per (service, caller) and usage analytics,
//! both kept in the shared [`CounterStore`].
//!
//! ## Admission
//!
//! 1. The limit comes from the caller's [`PlanTier`]
//! 2. A counter already at the limit rejects without incrementing
//! 3. Otherwise the counter is incremented atomically; the first increment
//!    of a window creates the key with the window as its expiry
//! 4. Analytics are updated for admitted and rejected requests alike
//!
//! If the store is unreachable the limiter fails open: the request is
//! admitted and the admission is flagged as degraded.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::counter_store::{analytics_key, rate_limit_key, CounterStore, CounterStoreError};
use crate::{CallerId, PlanTier, ServiceName, Timestamp};

// ============================================================================
// Admission Outcome
// ============================================================================

/// Result of asking the limiter to admit one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admission {
    pub allowed: bool,

    /// Requests counted in the current window, including this one if admitted
    pub used: u64,

    pub limit: u64,

    pub plan: PlanTier,

    /// `true` when the store was unreachable and the request was admitted
    /// without being counted
    pub degraded: bool,
}

impl Admission {
    /// Requests still available in the current window
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

// ============================================================================
// Usage Analytics
// ============================================================================

/// One request recorded in the analytics history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub timestamp: Timestamp,

    /// Window count after this request
    pub count: u64,

    pub limit: u64,

    pub allowed: bool,
}

/// Observational usage record for a caller on one service.
///
/// Never consulted for admission decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageAnalytics {
    pub service: String,
    pub plan: PlanTier,
    pub limit: u64,
    pub total_requests: u64,
    pub requests_this_minute: u64,
    pub last_request_at: Option<Timestamp>,

    /// Most recent entries, oldest first
    pub history: Vec<UsageEntry>,
}

impl UsageAnalytics {
    fn new(service: &ServiceName, plan: PlanTier, limit: u64) -> Self {
        Self {
            service: service.to_string(),
            plan,
            limit,
            total_requests: 0,
            requests_this_minute: 0,
            last_request_at: None,
            history: Vec::new(),
        }
    }

    fn record(&mut self, admission: &Admission, history_limit: usize) {
        let now = Timestamp::now();

        self.plan = admission.plan;
        self.limit = admission.limit;
        self.total_requests += 1;
        self.requests_this_minute = admission.used;
        self.last_request_at = Some(now);
        self.history.push(UsageEntry {
            timestamp: now,
            count: admission.used,
            limit: admission.limit,
            allowed: admission.allowed,
        });

        if self.history.len() > history_limit {
            let excess = self.history.len() - history_limit;
            self.history.drain(..excess);
        }
    }
}

// ============================================================================
// Usage Summary
// ============================================================================

/// Quota state of a service as seen by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Active,
    Limited,
    /// The counter could not be read
    Error,
}

/// Current-window usage of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUsage {
    pub service: String,
    pub current: u64,
    pub limit: u64,
    pub remaining: u64,
    pub status: UsageStatus,
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Fixed-window rate limiter over a shared counter store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one request for `caller` on `service`.
    ///
    /// Never fails: store errors admit the request in degraded mode.
    pub async fn admit(
        &self,
        service: &ServiceName,
        caller: &CallerId,
        plan: PlanTier,
    ) -> Admission {
        let limit = self.config.limit_for(plan);

        let admission = match self.count_request(service, caller, limit).await {
            Ok((allowed, used)) => Admission {
                allowed,
                used,
                limit,
                plan,
                degraded: false,
            },
            Err(e) => {
                warn!(
                    service = %service,
                    caller = %caller,
                    degraded = true,
                    category = ?e.category(),
                    error = %e,
                    "Rate limiter store unavailable, admitting request in degraded mode"
                );
                return Admission {
                    allowed: true,
                    used: 0,
                    limit,
                    plan,
                    degraded: true,
                };
            }
        };

        if !admission.allowed {
            debug!(
                service = %service,
                caller = %caller,
                used = admission.used,
                limit,
                "Rate limit exceeded"
            );
        }

        if let Err(e) = self.update_analytics(service, caller, &admission).await {
            warn!(
                service = %service,
                caller = %caller,
                error = %e,
                "Failed to update usage analytics"
            );
        }

        admission
    }

    /// Returns `(allowed, used)`.
    async fn count_request(
        &self,
        service: &ServiceName,
        caller: &CallerId,
        limit: u64,
    ) -> Result<(bool, u64), CounterStoreError> {
        let key = rate_limit_key(service, caller);

        let current = self.read_count(&key).await?;
        if current >= limit {
            return Ok((false, current.min(limit)));
        }

        let used = self.store.increment(&key, self.config.window()).await?;

        // Another request took the last slot between the read and the increment.
        if used > limit {
            return Ok((false, limit));
        }

        Ok((true, used))
    }

    async fn read_count(&self, key: &str) -> Result<u64, CounterStoreError> {
        match self.store.get(key).await? {
            Some(value) => value
                .parse()
                .map_err(|_| CounterStoreError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{}' is not a request count", value),
                }),
            None => Ok(0),
        }
    }

    async fn update_analytics(
        &self,
        service: &ServiceName,
        caller: &CallerId,
        admission: &Admission,
    ) -> Result<(), CounterStoreError> {
        let key = analytics_key(service, caller);

        let mut analytics = match self.store.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "Discarding unreadable usage analytics");
                UsageAnalytics::new(service, admission.plan, admission.limit)
            }),
            None => UsageAnalytics::new(service, admission.plan, admission.limit),
        };

        analytics.record(admission, self.config.history_limit);

        let serialized = serde_json::to_string(&analytics)?;
        self.store
            .set_with_expiry(&key, &serialized, self.config.analytics_ttl())
            .await
    }

    /// Stored usage analytics for a caller on a service, if any.
    ///
    /// # Errors
    ///
    /// Returns the store error, or [`CounterStoreError::Serialization`] if
    /// the record cannot be decoded.
    pub async fn analytics(
        &self,
        service: &ServiceName,
        caller: &CallerId,
    ) -> Result<Option<UsageAnalytics>, CounterStoreError> {
        match self.store.get(&analytics_key(service, caller)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Current-window usage of each service for a caller.
    ///
    /// A service whose counter cannot be read reports [`UsageStatus::Error`]
    /// with the full quota remaining.
    pub async fn usage_summary(
        &self,
        caller: &CallerId,
        plan: PlanTier,
        services: &[ServiceName],
    ) -> Vec<ServiceUsage> {
        let limit = self.config.limit_for(plan);
        let mut summary = Vec::with_capacity(services.len());

        for service in services {
            let usage = match self.read_count(&rate_limit_key(service, caller)).await {
                Ok(count) => {
                    // A lost race for the last slot leaves the raw count past the limit.
                    let current = count.min(limit);
                    ServiceUsage {
                        service: service.to_string(),
                        current,
                        limit,
                        remaining: limit - current,
                        status: if current >= limit {
                            UsageStatus::Limited
                        } else {
                            UsageStatus::Active
                        },
                    }
                }
                Err(e) => {
                    warn!(
                        service = %service,
                        caller = %caller,
                        category = ?e.category(),
                        error = %e,
                        "Failed to read usage"
                    );
                    ServiceUsage {
                        service: service.to_string(),
                        current: 0,
                        limit,
                        remaining: limit,
                        status: UsageStatus::Error,
                    }
                }
            };
            summary.push(usage);
        }

        summary
    }
}

#[cfg(test)]
#[path = "rate_limiter_tests.rs"]
mod tests;
