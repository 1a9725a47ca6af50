//! # Response Cache
//!
//! Read-through TTL cache of upstream payloads stored in the shared
//! [`CounterStore`].
//!
//! The cache is best-effort: a store error on read is a miss and a store
//! error on write is logged and swallowed. Correctness never depends on it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::counter_store::{cache_key, CounterStore};
use crate::upstream::Payload;
use crate::ServiceName;

// ============================================================================
// Normalized Parameters
// ============================================================================

/// Request parameters in canonical (sorted) order.
///
/// Two requests with the same parameters supplied in a different order
/// normalize to equal values and therefore share a cache entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedParams(BTreeMap<String, String>);

impl NormalizedParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter, replacing an earlier value for the same name.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Unambiguous canonical encoding (a JSON object with sorted keys).
    pub fn canonical(&self) -> String {
        // Serializing a map of strings cannot fail.
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Hex SHA-256 digest of the service name and canonical parameters.
    pub fn digest(&self, service: &ServiceName) -> String {
        let mut hasher = Sha256::new();
        hasher.update(service.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NormalizedParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, String>> for NormalizedParams {
    fn from(params: HashMap<String, String>) -> Self {
        params.into_iter().collect()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for NormalizedParams {
    fn from(params: [(&str, &str); N]) -> Self {
        params.into_iter().collect()
    }
}

// ============================================================================
// Cache Statistics
// ============================================================================

#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    read_failures: AtomicU64,
    write_failures: AtomicU64,
}

/// Point-in-time copy of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,

    /// Includes reads that failed and were treated as misses
    pub misses: u64,

    pub read_failures: u64,
    pub write_failures: u64,
}

impl CacheStatsSnapshot {
    /// Fraction of lookups served from cache, 0.0 when there were none
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

// ============================================================================
// Response Cache
// ============================================================================

/// TTL cache of upstream responses.
///
/// Cheap to clone; clones share statistics.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CounterStore>,
    config: CacheConfig,
    stats: Arc<CacheStats>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CounterStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            stats: Arc::new(CacheStats::default()),
        }
    }

    /// Store key of the entry for `service` and `params`.
    pub fn key_for(&self, service: &ServiceName, params: &NormalizedParams) -> String {
        cache_key(&self.config.key_prefix, service, &params.digest(service))
    }

    /// Look up a cached payload. Store and decoding errors count as misses.
    pub async fn get(&self, service: &ServiceName, params: &NormalizedParams) -> Option<Payload> {
        let key = self.key_for(service, params);

        let raw = match self.store.get(&key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    service = %service,
                    category = ?e.category(),
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        let payload = raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(service = %service, error = %e, "Discarding undecodable cache entry");
                None
            }
        });

        if payload.is_some() {
            debug!(service = %service, "Cache hit");
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(service = %service, "Cache miss");
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }

        payload
    }

    /// Cache a payload with the service's configured TTL.
    pub async fn set(&self, service: &ServiceName, params: &NormalizedParams, payload: &Payload) {
        let ttl = self.config.ttl_for(service);
        self.set_with_ttl(service, params, payload, ttl).await;
    }

    /// Cache a payload with an explicit TTL. Failures are logged, not returned.
    pub async fn set_with_ttl(
        &self,
        service: &ServiceName,
        params: &NormalizedParams,
        payload: &Payload,
        ttl: Duration,
    ) {
        let key = self.key_for(service, params);

        let serialized = match serde_json::to_string(payload) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(service = %service, error = %e, "Failed to serialize payload for cache");
                self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if let Err(e) = self.store.set_with_expiry(&key, &serialized, ttl).await {
            warn!(
                service = %service,
                category = ?e.category(),
                error = %e,
                "Cache write failed"
            );
            self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            read_failures: self.stats.read_failures.load(Ordering::Relaxed),
            write_failures: self.stats.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[path = "response_cache_tests.rs"]
mod tests;
