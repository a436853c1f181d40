use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Error;
use crate::quota::QuotaMetrics;
use crate::subscription::{SubscriptionOracle, SubscriptionView};

/// TTL cache in front of a subscription oracle. Subscription state changes
/// on billing-webhook timescales, so a few seconds of staleness is fine;
/// lookup failures are never cached.
pub struct CachedSubscriptionOracle {
    inner: Arc<dyn SubscriptionOracle>,
    cache: Cache<String, SubscriptionView>,
    metrics: Arc<QuotaMetrics>,
}

impl CachedSubscriptionOracle {
    pub fn new(
        inner: Arc<dyn SubscriptionOracle>,
        ttl: Duration,
        max_capacity: u64,
        metrics: Arc<QuotaMetrics>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Self {
            inner,
            cache,
            metrics,
        }
    }

    /// Drop the cached view for one account, e.g. right after a `resume`
    /// write so the next check observes the new flag.
    pub async fn invalidate(&self, account_id: &str) {
        self.cache.invalidate(account_id).await;
    }
}

#[async_trait]
impl SubscriptionOracle for CachedSubscriptionOracle {
    async fn get_view(&self, account_id: &str) -> Result<SubscriptionView, Error> {
        if let Some(view) = self.cache.get(account_id).await {
            self.metrics.record_subscription_cache_hit();
            return Ok(view);
        }
        self.metrics.record_subscription_cache_miss();
        let view = self.inner.get_view(account_id).await?;
        self.cache
            .insert(account_id.to_string(), view.clone())
            .await;
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{InMemorySubscriptionStore, SubscriptionStatus};

    fn cached(
        inner: Arc<InMemorySubscriptionStore>,
    ) -> (CachedSubscriptionOracle, Arc<QuotaMetrics>) {
        let metrics = Arc::new(QuotaMetrics::default());
        let oracle = CachedSubscriptionOracle::new(
            inner,
            Duration::from_secs(60),
            1000,
            Arc::clone(&metrics),
        );
        (oracle, metrics)
    }

    #[tokio::test]
    async fn test_second_lookup_hits_the_cache() {
        use std::sync::atomic::Ordering;

        let store = Arc::new(InMemorySubscriptionStore::new());
        store.set_active("acct_1", None);
        let (oracle, metrics) = cached(Arc::clone(&store));

        let first = oracle.get_view("acct_1").await.unwrap();
        let second = oracle.get_view("acct_1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(metrics.subscription_cache_misses.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.subscription_cache_hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_a_fresh_read() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        store.set_active("acct_1", None);
        let (oracle, _metrics) = cached(Arc::clone(&store));

        assert!(oracle.get_view("acct_1").await.unwrap().is_active());

        store.set_status("acct_1", SubscriptionStatus::None);
        // Still cached
        assert!(oracle.get_view("acct_1").await.unwrap().is_active());

        oracle.invalidate("acct_1").await;
        assert!(!oracle.get_view("acct_1").await.unwrap().is_active());
    }

    #[tokio::test]
    async fn test_missing_record_is_a_none_view() {
        let store = Arc::new(InMemorySubscriptionStore::new());
        let (oracle, _metrics) = cached(store);
        let view = oracle.get_view("acct_unknown").await.unwrap();
        assert!(!view.is_active());
        assert_eq!(view.status, SubscriptionStatus::None);
    }
}
