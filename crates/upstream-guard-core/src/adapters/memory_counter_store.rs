//! # In-Memory Counter Store
//!
//! Thread-safe in-memory implementation for testing, development and
//! single-process deployments.
//!
//! Expiry is measured on tokio's clock, so a paused test runtime can move
//! windows and cache entries forward with `tokio::time::advance`.
//!
//! Expired keys are dropped lazily on read and by a sweep that runs on the
//! first write after each [`SWEEP_INTERVAL`], so keys that are never read
//! again do not accumulate.

use crate::counter_store::{CounterStore, CounterStoreError};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// Minimum time between two sweeps of expired keys.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug)]
struct StoreState {
    entries: HashMap<String, StoredValue>,
    next_sweep_at: Instant,
}

impl StoreState {
    /// Drop expired keys, returning how many were removed.
    fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, stored| stored.is_live(now));
        self.next_sweep_at = now + SWEEP_INTERVAL;
        before - self.entries.len()
    }

    fn sweep_if_due(&mut self, now: Instant) {
        if now >= self.next_sweep_at {
            let evicted = self.evict_expired(now);
            if evicted > 0 {
                debug!(evicted, remaining = self.entries.len(), "Evicted expired keys");
            }
        }
    }
}

/// Thread-safe in-memory counter store
///
/// Clones share the same underlying map.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    state: Arc<Mutex<StoreState>>,
    available: Arc<AtomicBool>,
}

impl InMemoryCounterStore {
    /// Create new empty store
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState {
                entries: HashMap::new(),
                next_sweep_at: Instant::now() + SWEEP_INTERVAL,
            })),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate an outage: while unavailable every operation fails with
    /// [`CounterStoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .entries
            .values()
            .filter(|v| v.is_live(now))
            .count()
    }

    /// `true` if no live keys are stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key, if it exists
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.expires_at - now)
    }

    /// Remove all keys
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// Drop every expired key now, returning how many were removed.
    pub fn evict_expired(&self) -> usize {
        self.lock().evict_expired(Instant::now())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), CounterStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CounterStoreError::Unavailable {
                message: "in-memory store marked unavailable".to_string(),
            })
        }
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CounterStoreError> {
        self.ensure_available()?;

        let now = Instant::now();
        let mut state = self.lock();
        match state.entries.get(key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.value.clone())),
            Some(_) => {
                state.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        self.ensure_available()?;

        let now = Instant::now();
        let mut state = self.lock();
        state.sweep_if_due(now);
        state.entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn increment(
        &self,
        key: &str,
        ttl_if_created: Duration,
    ) -> Result<u64, CounterStoreError> {
        self.ensure_available()?;

        let now = Instant::now();
        let mut state = self.lock();
        state.sweep_if_due(now);

        if let Some(stored) = state.entries.get_mut(key).filter(|s| s.is_live(now)) {
            let current: u64 = stored
                .value
                .parse()
                .map_err(|_| CounterStoreError::InvalidValue {
                    key: key.to_string(),
                    message: format!("'{}' is not an integer", stored.value),
                })?;
            let next = current.saturating_add(1);
            stored.value = next.to_string();
            return Ok(next);
        }

        // Missing or expired: start a new window
        state.entries.insert(
            key.to_string(),
            StoredValue {
                value: "1".to_string(),
                expires_at: now + ttl_if_created,
            },
        );
        Ok(1)
    }
}

#[cfg(test)]
#[path = "memory_counter_store_tests.rs"]
mod tests;
