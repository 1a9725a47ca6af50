//! Common test utilities for upstream-guard integration tests
//!
//! This module provides:
//! - A scripted upstream that records how often it was fetched
//! - A counter store wrapper that can be made to fail reads or writes
//! - Helpers for building facades and identities

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use upstream_guard_core::{
    CallerId, CounterStore, CounterStoreError, GuardConfig, InMemoryCounterStore, Payload,
    ProtectedCall, UpstreamError,
};

// ============================================================================
// Scripted Upstream
// ============================================================================

/// Upstream returning queued results, then a default payload.
#[derive(Clone)]
#[allow(dead_code)]
pub struct ScriptedUpstream {
    script: Arc<Mutex<VecDeque<Result<Payload, UpstreamError>>>>,
    fetches: Arc<AtomicUsize>,
    delay: Arc<Mutex<Option<Duration>>>,
    name: &'static str,
}

#[allow(dead_code)]
impl ScriptedUpstream {
    pub fn new(name: &'static str) -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            fetches: Arc::new(AtomicUsize::new(0)),
            delay: Arc::new(Mutex::new(None)),
            name,
        }
    }

    /// Queue `count` failures with the given HTTP status.
    pub fn fail_times(&self, count: usize, status: u16) -> &Self {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Err(UpstreamError::status(status, "scripted failure")));
        }
        self
    }

    pub fn push(&self, result: Result<Payload, UpstreamError>) -> &Self {
        self.script.lock().unwrap().push_back(result);
        self
    }

    /// Make every fetch take this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn fetch(&self) -> Result<Payload, UpstreamError> {
        let fetch = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(json!({ "source": self.name, "fetch": fetch })))
    }
}

// ============================================================================
// Faulty Counter Store
// ============================================================================

/// In-memory store whose reads and writes can be failed independently.
#[derive(Clone)]
#[allow(dead_code)]
pub struct FaultyStore {
    inner: InMemoryCounterStore,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

#[allow(dead_code)]
impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryCounterStore::new(),
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inner(&self) -> &InMemoryCounterStore {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<(), CounterStoreError> {
        if flag.load(Ordering::SeqCst) {
            Err(CounterStoreError::Unavailable {
                message: "injected fault".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CounterStore for FaultyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CounterStoreError> {
        Self::check(&self.fail_reads)?;
        self.inner.get(key).await
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn increment(
        &self,
        key: &str,
        ttl_if_created: Duration,
    ) -> Result<u64, CounterStoreError> {
        Self::check(&self.fail_writes)?;
        self.inner.increment(key, ttl_if_created).await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

#[allow(dead_code)]
pub fn caller(name: &str) -> CallerId {
    CallerId::new(name).expect("valid caller id")
}

/// Facade with default configuration over `store`.
#[allow(dead_code)]
pub fn guard(store: Arc<dyn CounterStore>) -> ProtectedCall {
    ProtectedCall::new(store, GuardConfig::default()).expect("default config is valid")
}

#[allow(dead_code)]
pub fn guard_with(store: Arc<dyn CounterStore>, config: GuardConfig) -> ProtectedCall {
    ProtectedCall::new(store, config).expect("test config is valid")
}
