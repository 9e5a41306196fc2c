//! Cache view of the backend
//!
//! Wraps a [`Backend`] with the cache's value conventions: payloads get a
//! jittered TTL, absence is written as the null sentinel, hot keys are
//! persisted and demoted keys get a fresh random TTL. Backend failures on
//! this path are logged and treated as "not cached" so an outage degrades to
//! recomputation rather than an error.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use herdstore::Backend;
use rand::Rng;
use tracing::{debug, warn};

use crate::config::{CacheConfig, ExpiryConfig, NullCacheConfig};

/// What a cache read found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// No entry
    Miss,
    /// The null sentinel: absence was cached
    Null,
    /// A payload
    Hit(String),
}

/// Backend wrapper applying TTL and sentinel policy
#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn Backend>,
    expiry: ExpiryConfig,
    null_cache: NullCacheConfig,
}

impl CacheStore {
    /// Create a store view from the relevant config sections
    pub fn new(backend: Arc<dyn Backend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            expiry: config.expiry.clone(),
            null_cache: config.null_cache.clone(),
        }
    }

    /// Underlying backend
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Reserved value marking cached absence
    pub fn sentinel(&self) -> &str {
        &self.null_cache.sentinel
    }

    /// Read an entry. Backend failures read as [`Lookup::Miss`].
    pub async fn get(&self, key: &str) -> Lookup {
        match swallow("get", key, self.backend.get(key).await) {
            Some(Some(value)) if value == self.null_cache.sentinel => Lookup::Null,
            Some(Some(value)) => Lookup::Hit(value),
            _ => Lookup::Miss,
        }
    }

    /// Write a payload with a random TTL from the expiry range
    pub async fn set_random(&self, key: &str, value: &str) {
        let ttl = self.random_ttl();
        debug!(key, ttl_ms = ttl.as_millis() as u64, "cache write");
        swallow("set", key, self.backend.set(key, value, Some(ttl)).await);
    }

    /// Write the null sentinel with its fixed short TTL
    pub async fn set_null(&self, key: &str) {
        debug!(key, "caching absence");
        swallow(
            "set",
            key,
            self.backend
                .set(key, &self.null_cache.sentinel, Some(self.null_cache.ttl()))
                .await,
        );
    }

    /// Invalidate an entry
    pub async fn remove(&self, key: &str) {
        swallow("delete", key, self.backend.delete(key).await);
    }

    /// Clear the TTL of a hot key. Returns whether the backend confirmed it.
    pub async fn upgrade(&self, key: &str) -> bool {
        swallow("persist", key, self.backend.persist(key).await).unwrap_or(false)
    }

    /// Re-apply a random TTL to a key that cooled down
    pub async fn downgrade(&self, key: &str) -> bool {
        let ttl = self.random_ttl();
        swallow("expire", key, self.backend.expire(key, ttl).await).unwrap_or(false)
    }

    /// Random TTL within the configured `[min, max)` range
    pub fn random_ttl(&self) -> Duration {
        random_ttl_in(self.expiry.bounds())
    }
}

/// Random duration in `[min_secs, max_secs)`, falling back to
/// [`ExpiryConfig::FALLBACK`] for an empty range
pub fn random_ttl_in((min_secs, max_secs): (u64, u64)) -> Duration {
    let (min_secs, max_secs) = if min_secs < max_secs {
        (min_secs, max_secs)
    } else {
        ExpiryConfig::FALLBACK
    };
    let (low, high) = (min_secs.saturating_mul(1_000), max_secs.saturating_mul(1_000));
    if low >= high {
        return Duration::from_millis(low);
    }
    Duration::from_millis(rand::thread_rng().gen_range(low..high))
}

fn swallow<T, E: Display>(op: &str, key: &str, result: Result<T, E>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(op, key, "backend call failed, treating as not cached");
            debug!(op, key, error = %err, "backend failure detail");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herdstore::{MemoryBackend, Reply, Script, StoreError};
    use proptest::prelude::*;

    struct DownBackend;

    #[async_trait]
    impl Backend for DownBackend {
        async fn get(&self, _: &str) -> herdstore::Result<Option<String>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> herdstore::Result<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> herdstore::Result<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn persist(&self, _: &str) -> herdstore::Result<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> herdstore::Result<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> herdstore::Result<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn eval(&self, _: &Script, _: &[String], _: &[String]) -> herdstore::Result<Reply> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    fn store_over(backend: Arc<dyn Backend>) -> CacheStore {
        CacheStore::new(backend, &CacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_and_sentinel() {
        let memory = Arc::new(MemoryBackend::new());
        let store = store_over(memory.clone());

        assert_eq!(store.get("k").await, Lookup::Miss);
        store.set_random("k", "\"v\"").await;
        assert_eq!(store.get("k").await, Lookup::Hit("\"v\"".into()));

        store.set_null("n").await;
        assert_eq!(store.get("n").await, Lookup::Null);
        assert_eq!(memory.ttl("n"), Some(Duration::from_secs(30)));

        store.remove("k").await;
        assert_eq!(store.get("k").await, Lookup::Miss);
    }

    #[tokio::test]
    async fn test_upgrade_and_downgrade() {
        let memory = Arc::new(MemoryBackend::new());
        let store = store_over(memory.clone());

        store.set_random("hot", "1").await;
        assert!(memory.ttl("hot").is_some());
        assert!(store.upgrade("hot").await);
        assert_eq!(memory.ttl("hot"), None);

        assert!(store.downgrade("hot").await);
        let ttl = memory.ttl("hot").unwrap();
        assert!(ttl >= Duration::from_secs(9) && ttl < Duration::from_secs(31));

        assert!(!store.downgrade("absent").await);
    }

    #[tokio::test]
    async fn test_outage_reads_as_miss() {
        let store = store_over(Arc::new(DownBackend));
        assert_eq!(store.get("k").await, Lookup::Miss);
        store.set_random("k", "v").await;
        store.set_null("k").await;
        store.remove("k").await;
        assert!(!store.upgrade("k").await);
        assert!(!store.downgrade("k").await);
    }

    #[test]
    fn test_empty_range_falls_back() {
        for _ in 0..100 {
            let ttl = random_ttl_in((30, 30));
            assert!(ttl >= Duration::from_secs(10) && ttl < Duration::from_secs(31));
        }
    }

    #[test]
    fn test_huge_bounds_saturate() {
        let ttl = random_ttl_in((10, u64::MAX / 100));
        assert!(ttl >= Duration::from_secs(10));
        let ttl = random_ttl_in((u64::MAX / 100, u64::MAX / 10));
        assert_eq!(ttl, Duration::from_millis(u64::MAX));
    }

    proptest! {
        #[test]
        fn prop_ttl_within_bounds(min in 0u64..10_000, span in 1u64..10_000) {
            let ttl = random_ttl_in((min, min + span));
            prop_assert!(ttl >= Duration::from_secs(min));
            prop_assert!(ttl < Duration::from_secs(min + span));
        }
    }
}
