//! Tiered cache with stale-while-revalidate
//!
//! Two tiers front every read: a hot in-process cache and a shared cold
//! KV reachable by every actor in the region. Entries carry their own
//! freshness bookkeeping so the stale-while-revalidate window works the
//! same on both tiers. Namespaces isolate the five artifact families the
//! core caches, each with its own TTLs.

pub mod retry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mini_moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CoreConfig;
use crate::grant::resolver::{Entitlement, MinimalEntitlement};
use crate::service::usage::CurrentUsage;
use crate::service::AccessControlList;
use crate::{Error, Result};

pub use retry::with_retries;

/// Shared cold-tier key/value store
#[async_trait]
pub trait SharedKv: Send + Sync {
    /// Fetch the raw value stored under `namespace`/`key`
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    /// Store a value with a cold-tier TTL
    async fn set(&self, namespace: &str, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove a value
    async fn remove(&self, namespace: &str, key: &str) -> Result<()>;
}

/// In-memory `SharedKv` for tests and single-node deployments
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<(String, String), (String, Instant)>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedKv for MemoryKv {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::Cache("kv mutex poisoned".to_string()))?;
        Ok(entries
            .get(&(namespace.to_string(), key.to_string()))
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, namespace: &str, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Cache("kv mutex poisoned".to_string()))?;
        entries.insert(
            (namespace.to_string(), key.to_string()),
            (value, Instant::now() + ttl),
        );
        Ok(())
    }

    async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::Cache("kv mutex poisoned".to_string()))?;
        entries.remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

/// A cached value with its freshness bookkeeping, in domain time
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedEntry<T> {
    value: T,
    /// Fresh until this instant; after it the entry is stale
    fresh_until: i64,
    /// Past this instant the entry is unusable even as stale
    stale_until: i64,
}

/// One namespace of the tiered cache
pub struct TypedCache<T> {
    namespace: &'static str,
    hot: Cache<String, CachedEntry<T>>,
    kv: Arc<dyn SharedKv>,
    ttl_ms: i64,
    swr_ms: i64,
    retry_attempts: usize,
    retry_base_delay: Duration,
}

impl<T> Clone for TypedCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace,
            hot: self.hot.clone(),
            kv: self.kv.clone(),
            ttl_ms: self.ttl_ms,
            swr_ms: self.swr_ms,
            retry_attempts: self.retry_attempts,
            retry_base_delay: self.retry_base_delay,
        }
    }
}

impl<T> TypedCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(
        namespace: &'static str,
        kv: Arc<dyn SharedKv>,
        ttl: Duration,
        swr: Duration,
        config: &CoreConfig,
    ) -> Self {
        Self {
            namespace,
            hot: Cache::builder()
                .max_capacity(config.hot_cache_capacity)
                .time_to_live(ttl + swr)
                .build(),
            kv,
            ttl_ms: ttl.as_millis() as i64,
            swr_ms: swr.as_millis() as i64,
            retry_attempts: config.retry_attempts,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Value usable at `now` (fresh or within the stale grace window)
    ///
    /// # Errors
    ///
    /// Returns error when the cold tier fails past its retries
    pub async fn get(&self, key: &str, now: i64) -> Result<Option<T>> {
        Ok(self.entry(key, now).await?.map(|e| e.value))
    }

    /// Store a value, stamping freshness from `now`
    ///
    /// # Errors
    ///
    /// Returns error when the cold-tier write fails
    pub async fn set(&self, key: &str, value: T, now: i64) -> Result<()> {
        let entry = CachedEntry {
            value,
            fresh_until: now + self.ttl_ms,
            stale_until: now + self.ttl_ms + self.swr_ms,
        };
        self.hot.insert(key.to_string(), entry.clone());
        let payload = serde_json::to_string(&entry)?;
        let cold_ttl = Duration::from_millis((self.ttl_ms + self.swr_ms).max(0) as u64);
        self.kv.set(self.namespace, key, payload, cold_ttl).await
    }

    /// Drop the value from both tiers
    ///
    /// # Errors
    ///
    /// Returns error when the cold-tier delete fails
    pub async fn remove(&self, key: &str) -> Result<()> {
        self.hot.invalidate(&key.to_string());
        self.kv.remove(self.namespace, key).await
    }

    /// Stale-while-revalidate read: fresh values return synchronously,
    /// stale-but-usable values return immediately while a background
    /// refresh runs, and misses load inline.
    ///
    /// # Errors
    ///
    /// Returns error when both tiers miss and the loader fails
    pub async fn swr<L, Fut>(&self, key: &str, now: i64, loader: L) -> Result<Option<T>>
    where
        L: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>>> + Send + 'static,
    {
        if let Some(entry) = self.entry(key, now).await? {
            if entry.fresh_until > now {
                return Ok(Some(entry.value));
            }
            // stale but inside the grace window: serve it, refresh behind
            let cache = self.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                match loader().await {
                    Ok(Some(value)) => {
                        if let Err(e) = cache.set(&key, value, now).await {
                            tracing::warn!(namespace = cache.namespace, key = %key, error = %e, "background refresh store failed");
                        }
                    }
                    Ok(None) => {
                        if let Err(e) = cache.remove(&key).await {
                            tracing::warn!(namespace = cache.namespace, key = %key, error = %e, "background refresh removal failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(namespace = cache.namespace, key = %key, error = %e, "background refresh failed");
                    }
                }
            });
            return Ok(Some(entry.value));
        }

        let loaded = loader().await?;
        if let Some(value) = &loaded {
            self.set(key, value.clone(), now).await?;
        }
        Ok(loaded)
    }

    /// Hot hit, else cold hit promoted into the hot tier
    async fn entry(&self, key: &str, now: i64) -> Result<Option<CachedEntry<T>>> {
        if let Some(entry) = self.hot.get(&key.to_string()) {
            if entry.stale_until > now {
                return Ok(Some(entry));
            }
            self.hot.invalidate(&key.to_string());
        }

        let namespace = self.namespace;
        let kv = self.kv.clone();
        let owned_key = key.to_string();
        let raw = with_retries(namespace, self.retry_attempts, self.retry_base_delay, || {
            let kv = kv.clone();
            let key = owned_key.clone();
            async move { kv.get(namespace, &key).await }
        })
        .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CachedEntry<T> = serde_json::from_str(&raw)?;
        if entry.stale_until <= now {
            return Ok(None);
        }
        self.hot.insert(key.to_string(), entry.clone());
        Ok(Some(entry))
    }
}

/// The five cache namespaces consumed by the core
pub struct CacheLayer {
    /// `proj:cust:feat` → computed entitlement (meter excluded)
    pub entitlement: TypedCache<Entitlement>,
    /// `proj:cust` → minimal entitlement listing
    pub entitlements: TypedCache<Vec<MinimalEntitlement>>,
    /// `proj:cust:feat` → miss memoization
    pub negative: TypedCache<bool>,
    /// `proj:cust` → access control triple
    pub acl: TypedCache<AccessControlList>,
    /// `proj:cust` → current-usage summary
    pub current_usage: TypedCache<CurrentUsage>,
}

impl CacheLayer {
    #[must_use]
    pub fn new(kv: Arc<dyn SharedKv>, config: &CoreConfig) -> Self {
        let ttl = Duration::from_secs(config.entitlement_ttl_secs);
        let swr = Duration::from_secs(config.entitlement_swr_secs);
        let negative = Duration::from_secs(config.negative_ttl_secs);
        let summary = Duration::from_secs(config.summary_ttl_secs);

        Self {
            entitlement: TypedCache::new("customerEntitlement", kv.clone(), ttl, swr, config),
            entitlements: TypedCache::new("customerEntitlements", kv.clone(), ttl, swr, config),
            negative: TypedCache::new(
                "negativeEntitlements",
                kv.clone(),
                negative,
                Duration::ZERO,
                config,
            ),
            acl: TypedCache::new("accessControlList", kv.clone(), summary, Duration::ZERO, config),
            current_usage: TypedCache::new("getCurrentUsage", kv, summary, Duration::ZERO, config),
        }
    }

    /// Drop every namespace entry owned by one customer. Called on
    /// subscription lifecycle events and `reset_entitlements`.
    ///
    /// # Errors
    ///
    /// Returns the first cold-tier failure encountered
    pub async fn invalidate_customer(
        &self,
        project_id: &str,
        customer_id: &str,
        feature_slugs: &[String],
    ) -> Result<()> {
        let customer_key = format!("{project_id}:{customer_id}");
        for slug in feature_slugs {
            let feature_key = format!("{project_id}:{customer_id}:{slug}");
            self.entitlement.remove(&feature_key).await?;
            self.negative.remove(&feature_key).await?;
        }
        self.entitlements.remove(&customer_key).await?;
        self.acl.remove(&customer_key).await?;
        self.current_usage.remove(&customer_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn cache() -> TypedCache<u64> {
        let config = CoreConfig::default();
        TypedCache::new(
            "test",
            Arc::new(MemoryKv::new()),
            Duration::from_secs(10),
            Duration::from_secs(20),
            &config,
        )
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = cache();
        cache.set("k", 7, 0).await.unwrap();
        assert_eq!(cache.get("k", 1_000).await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = cache();
        cache.set("k", 7, 0).await.unwrap();
        // past fresh + swr the entry is gone from the caller's view
        assert_eq!(cache.get("k", 31_000).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cold_tier_promotion() {
        let config = CoreConfig::default();
        let kv: Arc<dyn SharedKv> = Arc::new(MemoryKv::new());
        let a: TypedCache<u64> = TypedCache::new(
            "test",
            kv.clone(),
            Duration::from_secs(10),
            Duration::from_secs(20),
            &config,
        );
        let b: TypedCache<u64> = TypedCache::new(
            "test",
            kv,
            Duration::from_secs(10),
            Duration::from_secs(20),
            &config,
        );

        a.set("k", 9, 0).await.unwrap();
        // b has a cold tier hit even though its hot tier is empty
        assert_eq!(b.get("k", 1_000).await.unwrap(), Some(9));
    }

    #[tokio::test]
    async fn test_swr_fresh_skips_loader() {
        let cache = cache();
        cache.set("k", 1, 0).await.unwrap();
        let value = cache
            .swr("k", 5_000, || async { Ok(Some(99)) })
            .await
            .unwrap();
        assert_eq!(value, Some(1));
    }

    #[tokio::test]
    async fn test_swr_miss_loads_inline() {
        let cache = cache();
        let value = cache
            .swr("k", 0, || async { Ok(Some(42)) })
            .await
            .unwrap();
        assert_eq!(value, Some(42));
        // and the load is cached
        assert_eq!(cache.get("k", 1).await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_swr_stale_serves_and_refreshes() {
        let cache = cache();
        cache.set("k", 1, 0).await.unwrap();

        // 15s: past fresh (10s) but inside grace (30s)
        let value = cache
            .swr("k", 15_000, || async { Ok(Some(2)) })
            .await
            .unwrap();
        assert_eq!(value, Some(1));

        // wait for the background refresh to land
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k", 16_000).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_remove_clears_both_tiers() {
        let cache = cache();
        cache.set("k", 7, 0).await.unwrap();
        cache.remove("k").await.unwrap();
        assert_eq!(cache.get("k", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_retry_recovers_flaky_cold_tier() {
        struct Flaky {
            inner: MemoryKv,
            failures: AtomicUsize,
        }

        #[async_trait]
        impl SharedKv for Flaky {
            async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
                if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n > 0).then(|| n - 1)
                }).is_ok()
                {
                    return Err(Error::Cache("transient".to_string()));
                }
                self.inner.get(namespace, key).await
            }

            async fn set(&self, namespace: &str, key: &str, value: String, ttl: Duration) -> Result<()> {
                self.inner.set(namespace, key, value, ttl).await
            }

            async fn remove(&self, namespace: &str, key: &str) -> Result<()> {
                self.inner.remove(namespace, key).await
            }
        }

        let config = CoreConfig::default();
        let kv = Arc::new(Flaky {
            inner: MemoryKv::new(),
            failures: AtomicUsize::new(0),
        });
        let cache: TypedCache<u64> = TypedCache::new(
            "test",
            kv.clone(),
            Duration::from_secs(10),
            Duration::from_secs(0),
            &config,
        );

        cache.set("k", 5, 0).await.unwrap();
        // evict the hot tier so the next read goes cold
        cache.hot.invalidate(&"k".to_string());
        kv.failures.store(2, Ordering::SeqCst);
        assert_eq!(cache.get("k", 1_000).await.unwrap(), Some(5));
    }
}
