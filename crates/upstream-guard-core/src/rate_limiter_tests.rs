//! Tests for the fixed-window rate limiter.

use super::*;
use crate::adapters::InMemoryCounterStore;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;

fn caller() -> CallerId {
    CallerId::new("user-1").expect("valid caller")
}

fn limiter(store: &InMemoryCounterStore) -> RateLimiter {
    RateLimiter::new(Arc::new(store.clone()), RateLimitConfig::default())
}

// ============================================================================
// Test Doubles
// ============================================================================

/// Store whose reads lag behind its increments, as when another process
/// takes the last slot between the two round-trips.
struct StaleReadStore {
    stale_count: u64,
    incremented_to: u64,
}

#[async_trait]
impl CounterStore for StaleReadStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CounterStoreError> {
        if key.starts_with("rate_limit:") {
            Ok(Some(self.stale_count.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn set_with_expiry(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        Ok(())
    }

    async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CounterStoreError> {
        Ok(self.incremented_to)
    }
}

/// Store that counts correctly but refuses every plain write.
struct ReadOnlyValuesStore {
    inner: InMemoryCounterStore,
}

#[async_trait]
impl CounterStore for ReadOnlyValuesStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CounterStoreError> {
        self.inner.get(key).await
    }

    async fn set_with_expiry(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<(), CounterStoreError> {
        Err(CounterStoreError::Unavailable {
            message: "writes rejected".to_string(),
        })
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        self.inner.increment(key, ttl).await
    }
}

/// Log sink for asserting on emitted fields.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

// ============================================================================
// Admission Tests
// ============================================================================

mod admission_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_free_tier_window() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        let service = ServiceName::weather();
        let caller = caller();

        for expected_used in 1..=10 {
            let admission = limiter.admit(&service, &caller, PlanTier::Free).await;
            assert!(admission.allowed, "request {} should be admitted", expected_used);
            assert_eq!(admission.used, expected_used);
            assert_eq!(admission.limit, 10);
            assert!(!admission.degraded);
        }

        let rejected = limiter.admit(&service, &caller, PlanTier::Free).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.used, 10);
        assert_eq!(rejected.limit, 10);
        assert_eq!(rejected.remaining(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;

        let fresh = limiter.admit(&service, &caller, PlanTier::Free).await;
        assert!(fresh.allowed);
        assert_eq!(fresh.used, 1);
    }

    /// A rejected request does not consume budget.
    #[tokio::test]
    async fn test_rejection_does_not_increment() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        let service = ServiceName::news();
        let caller = caller();

        for _ in 0..10 {
            limiter.admit(&service, &caller, PlanTier::Free).await;
        }
        for _ in 0..5 {
            assert!(!limiter.admit(&service, &caller, PlanTier::Free).await.allowed);
        }

        let counter = store
            .get(&rate_limit_key(&service, &caller))
            .await
            .expect("get");
        assert_eq!(counter.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_pro_tier_limit() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);

        let admission = limiter
            .admit(&ServiceName::crypto(), &caller(), PlanTier::parse("pro"))
            .await;
        assert_eq!(admission.limit, 100);
        assert_eq!(admission.plan, PlanTier::Pro);
    }

    #[tokio::test]
    async fn test_unknown_plan_uses_free_limit() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);

        let admission = limiter
            .admit(&ServiceName::crypto(), &caller(), PlanTier::parse("enterprise"))
            .await;
        assert!(admission.allowed);
        assert_eq!(admission.limit, 10);
    }

    #[tokio::test]
    async fn test_counters_are_independent_per_service_and_caller() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        let other = CallerId::new("user-2").expect("valid caller");

        for _ in 0..10 {
            limiter.admit(&ServiceName::weather(), &caller(), PlanTier::Free).await;
        }

        assert!(limiter.admit(&ServiceName::news(), &caller(), PlanTier::Free).await.allowed);
        assert!(limiter.admit(&ServiceName::weather(), &other, PlanTier::Free).await.allowed);
    }

    #[tokio::test]
    async fn test_lost_race_for_last_slot_is_rejected() {
        let limiter = RateLimiter::new(
            Arc::new(StaleReadStore {
                stale_count: 9,
                incremented_to: 11,
            }),
            RateLimitConfig::default(),
        );

        let admission = limiter
            .admit(&ServiceName::weather(), &caller(), PlanTier::Free)
            .await;
        assert!(!admission.allowed);
        assert_eq!(admission.used, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_admissions_never_exceed_limit() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        let mut handles = Vec::new();

        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .admit(&ServiceName::weather(), &caller(), PlanTier::Free)
                    .await
                    .allowed
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.expect("task panicked") {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
    }
}

// ============================================================================
// Failure Policy Tests
// ============================================================================

mod fail_open_tests {
    use super::*;

    #[tokio::test]
    async fn test_store_outage_admits_in_degraded_mode() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        store.set_available(false);

        for _ in 0..20 {
            let admission = limiter
                .admit(&ServiceName::weather(), &caller(), PlanTier::Free)
                .await;
            assert!(admission.allowed);
            assert!(admission.degraded);
        }
    }

    #[tokio::test]
    async fn test_fail_open_warning_is_marked_degraded() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        store.set_available(false);
        limiter
            .admit(&ServiceName::weather(), &caller(), PlanTier::Free)
            .await;

        let output = logs.contents();
        let line = output
            .lines()
            .find(|line| line.contains("admitting request in degraded mode"))
            .expect("fail-open warning emitted");
        assert!(line.contains("WARN"));
        assert!(line.contains("degraded=true"));
        assert!(line.contains("category=Transient"));
        assert!(line.contains("service=weather"));
    }

    #[tokio::test]
    async fn test_corrupt_counter_fails_open() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        store
            .set_with_expiry(
                &rate_limit_key(&ServiceName::weather(), &caller()),
                "garbage",
                Duration::from_secs(60),
            )
            .await
            .expect("set");

        let admission = limiter
            .admit(&ServiceName::weather(), &caller(), PlanTier::Free)
            .await;
        assert!(admission.allowed);
        assert!(admission.degraded);
    }

    /// Analytics are observational; failing to write them never blocks.
    #[tokio::test]
    async fn test_analytics_write_failure_does_not_block() {
        let limiter = RateLimiter::new(
            Arc::new(ReadOnlyValuesStore {
                inner: InMemoryCounterStore::new(),
            }),
            RateLimitConfig::default(),
        );

        let admission = limiter
            .admit(&ServiceName::weather(), &caller(), PlanTier::Free)
            .await;
        assert!(admission.allowed);
        assert!(!admission.degraded);
        assert_eq!(admission.used, 1);
    }
}

// ============================================================================
// Analytics Tests
// ============================================================================

mod analytics_tests {
    use super::*;

    #[tokio::test]
    async fn test_analytics_record_admitted_and_rejected_requests() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        let service = ServiceName::weather();

        assert!(limiter.analytics(&service, &caller()).await.expect("read").is_none());

        for _ in 0..11 {
            limiter.admit(&service, &caller(), PlanTier::Free).await;
        }

        let analytics = limiter
            .analytics(&service, &caller())
            .await
            .expect("read")
            .expect("analytics present");

        assert_eq!(analytics.service, "weather");
        assert_eq!(analytics.plan, PlanTier::Free);
        assert_eq!(analytics.total_requests, 11);
        assert_eq!(analytics.requests_this_minute, 10);
        assert!(analytics.last_request_at.is_some());
        assert_eq!(analytics.history.len(), 11);

        let last = analytics.history.last().expect("history entry");
        assert!(!last.allowed);
        assert_eq!(last.count, 10);
        assert_eq!(last.limit, 10);
    }

    #[tokio::test]
    async fn test_history_is_truncated() {
        let store = InMemoryCounterStore::new();
        let config = RateLimitConfig {
            history_limit: 5,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(Arc::new(store.clone()), config);

        for _ in 0..8 {
            limiter.admit(&ServiceName::news(), &caller(), PlanTier::Pro).await;
        }

        let analytics = limiter
            .analytics(&ServiceName::news(), &caller())
            .await
            .expect("read")
            .expect("analytics present");

        assert_eq!(analytics.total_requests, 8);
        assert_eq!(analytics.history.len(), 5);
        // Oldest entries are dropped first
        assert_eq!(analytics.history[0].count, 4);
        assert_eq!(analytics.history[4].count, 8);
    }

    /// Analytics outlive the rate window.
    #[tokio::test(start_paused = true)]
    async fn test_analytics_expire_independently_of_window() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        let service = ServiceName::crypto();

        limiter.admit(&service, &caller(), PlanTier::Free).await;
        tokio::time::advance(Duration::from_secs(120)).await;

        let analytics = limiter.analytics(&service, &caller()).await.expect("read");
        assert!(analytics.is_some());
        assert_eq!(
            store.ttl(&analytics_key(&service, &caller())),
            Some(Duration::from_secs(86_400 - 120))
        );
    }
}

// ============================================================================
// Usage Summary Tests
// ============================================================================

mod usage_summary_tests {
    use super::*;

    #[tokio::test]
    async fn test_usage_summary_reports_each_service() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);

        for _ in 0..3 {
            limiter.admit(&ServiceName::weather(), &caller(), PlanTier::Free).await;
        }
        for _ in 0..10 {
            limiter.admit(&ServiceName::news(), &caller(), PlanTier::Free).await;
        }

        let summary = limiter
            .usage_summary(&caller(), PlanTier::Free, &ServiceName::well_known())
            .await;

        assert_eq!(summary.len(), 3);

        let weather = summary.iter().find(|u| u.service == "weather").expect("weather");
        assert_eq!(weather.current, 3);
        assert_eq!(weather.remaining, 7);
        assert_eq!(weather.status, UsageStatus::Active);

        let news = summary.iter().find(|u| u.service == "news").expect("news");
        assert_eq!(news.remaining, 0);
        assert_eq!(news.status, UsageStatus::Limited);

        let crypto = summary.iter().find(|u| u.service == "crypto").expect("crypto");
        assert_eq!(crypto.current, 0);
        assert_eq!(crypto.status, UsageStatus::Active);
    }

    /// A lost race for the last slot leaves the raw counter past the limit.
    #[tokio::test]
    async fn test_usage_summary_clamps_to_limit() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        store
            .set_with_expiry(
                &rate_limit_key(&ServiceName::crypto(), &caller()),
                "11",
                Duration::from_secs(60),
            )
            .await
            .expect("set");

        let summary = limiter
            .usage_summary(&caller(), PlanTier::Free, &[ServiceName::crypto()])
            .await;

        assert_eq!(summary[0].current, 10);
        assert_eq!(summary[0].limit, 10);
        assert_eq!(summary[0].remaining, 0);
        assert_eq!(summary[0].status, UsageStatus::Limited);
    }

    #[tokio::test]
    async fn test_usage_summary_store_error() {
        let store = InMemoryCounterStore::new();
        let limiter = limiter(&store);
        store.set_available(false);

        let summary = limiter
            .usage_summary(&caller(), PlanTier::Pro, &[ServiceName::weather()])
            .await;

        assert_eq!(summary[0].status, UsageStatus::Error);
        assert_eq!(summary[0].current, 0);
        assert_eq!(summary[0].remaining, 100);
    }

    #[test]
    fn test_usage_status_serialization() {
        let json = serde_json::to_string(&UsageStatus::Limited).expect("serialize");
        assert_eq!(json, "\"limited\"");
    }
}
