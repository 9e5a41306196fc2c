//! HerdCache: cache-aside guard in front of a shared backend

use std::future::Future;
use std::sync::Arc;

use herdstore::{Backend, Ledger};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bloom::BloomFilter;
use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::handler::{MissHandler, MissHandlers};
use crate::hotspot::HotspotDetector;
use crate::lock::{CacheLock, LockRegistry};
use crate::request::{ReadRequest, WriteKind, WriteRequest};
use crate::stats::CacheStats;
use crate::store::{CacheStore, Lookup};
use crate::txn::{self, TxnScope};

/// Bit count of the placeholder filter used while admission is disabled
const DISABLED_BLOOM_BITS: usize = 64;

/// Assembles a [`HerdCache`]
pub struct HerdCacheBuilder {
    backend: Arc<dyn Backend>,
    config: CacheConfig,
    locks: Vec<Arc<dyn CacheLock>>,
    handlers: Vec<Arc<dyn MissHandler>>,
}

impl HerdCacheBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Register an extra lock strategy
    pub fn lock(mut self, lock: Arc<dyn CacheLock>) -> Self {
        self.locks.push(lock);
        self
    }

    /// Register an extra miss handler
    pub fn miss_handler(mut self, handler: Arc<dyn MissHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Validate the config and wire the components
    ///
    /// Starts the hotspot sweeper when hotspot tracking is enabled, which
    /// requires a running tokio runtime.
    pub fn build(self) -> Result<HerdCache> {
        let config = self.config;
        config.validate()?;

        let stats = Arc::new(CacheStats::new());
        let store = CacheStore::new(self.backend.clone(), &config);

        let bloom = if config.bloom.enabled {
            BloomFilter::with_params(
                BloomFilter::optimal_bits(config.bloom.expected_items, config.bloom.false_positive_rate),
                config.bloom.hash_count,
            )
        } else {
            BloomFilter::with_params(DISABLED_BLOOM_BITS, config.bloom.hash_count)
        };

        let mut locks = LockRegistry::with_builtin(self.backend.clone(), &config.lock);
        for lock in self.locks {
            locks.register(lock);
        }

        let mut handlers = MissHandlers::new(config.miss_handler.clone());
        for handler in self.handlers {
            handlers.register(handler);
        }

        let hotspot = if config.hotspot.enabled {
            if tokio::runtime::Handle::try_current().is_err() {
                return Err(Error::Config(
                    "hotspot tracking needs a running tokio runtime".into(),
                ));
            }
            let detector = Arc::new(HotspotDetector::new(
                store.clone(),
                &config.hotspot,
                stats.clone(),
            ));
            detector.start();
            Some(detector)
        } else {
            None
        };

        Ok(HerdCache {
            ledger: Ledger::new(self.backend),
            config: Arc::new(config),
            store,
            bloom: Arc::new(bloom),
            locks,
            handlers,
            hotspot,
            stats,
        })
    }
}

/// Cache-aside orchestrator
///
/// Answers reads through bloom admission, the null sentinel, per-key locking
/// and hotspot tracking, and invalidates entries after writes.
pub struct HerdCache {
    config: Arc<CacheConfig>,
    store: CacheStore,
    bloom: Arc<BloomFilter>,
    locks: LockRegistry,
    handlers: MissHandlers,
    hotspot: Option<Arc<HotspotDetector>>,
    stats: Arc<CacheStats>,
    ledger: Ledger,
}

impl HerdCache {
    /// Start assembling a cache over `backend`
    pub fn builder(backend: Arc<dyn Backend>) -> HerdCacheBuilder {
        HerdCacheBuilder {
            backend,
            config: CacheConfig::default(),
            locks: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Cache over `backend` with the built-in strategies
    pub fn new(backend: Arc<dyn Backend>, config: CacheConfig) -> Result<Self> {
        Self::builder(backend).config(config).build()
    }

    /// Get-or-compute
    ///
    /// `compute` runs at most once per key at a time, and only when neither
    /// the cache nor a concurrent holder of the key's lock produced a value.
    /// `Ok(None)` is logical absence.
    pub async fn handle_read<T, F, Fut>(&self, request: &ReadRequest, compute: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        let key = request.key.as_str();
        let hot = self.is_hot(key);

        if self.config.bloom.enabled && !hot {
            if let Some(probe) = &request.bloom_probe {
                if !probe.admitted_by(&self.bloom) {
                    self.stats.record_bloom_rejection();
                    debug!(key, "bloom filter rejected read");
                    return self.on_absent(request);
                }
            }
        }

        match self.store.get(key).await {
            Lookup::Hit(payload) => match decode(key, &payload) {
                Some(value) => {
                    self.stats.record_hit();
                    if let Some(detector) = &self.hotspot {
                        detector.record_hit(key).await;
                    }
                    return Ok(Some(value));
                }
                None => self.stats.record_miss(),
            },
            Lookup::Null => {
                self.stats.record_null_hit();
                if hot {
                    debug!(key, "hot key holds cached absence");
                    return self.on_absent(request);
                }
                return Ok(None);
            }
            Lookup::Miss => self.stats.record_miss(),
        }

        let lock = self.locks.resolve(request.lock_strategy.as_deref())?;
        lock.with_lock(key, || self.fill(key, compute))
            .await
            .map_err(|err| {
                if matches!(err, Error::Busy(_)) {
                    self.stats.record_lock_busy();
                }
                err
            })
    }

    /// Mutate, then invalidate
    ///
    /// With a `txn`, the invalidation waits for [`TxnScope::commit`].
    pub async fn handle_write<T, F, Fut>(
        &self,
        request: &WriteRequest,
        txn: Option<&TxnScope>,
        mutate: F,
    ) -> Result<Option<T>>
    where
        T: Serialize + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        let key = request.key.as_str();

        if self.config.bloom.enabled && request.kind != WriteKind::Insert {
            if let Some(probe) = &request.bloom_probe {
                if !probe.admitted_by(&self.bloom) {
                    self.stats.record_bloom_rejection();
                    debug!(key, "bloom filter rejected write");
                    return Err(Error::NotFound(request.key.to_string()));
                }
            }
        }

        let value = mutate().await?;

        if request.kind == WriteKind::Insert {
            if let Some(probe) = &request.bloom_probe {
                probe.insert_into(&self.bloom);
            }
        }

        let repopulate = request.kind != WriteKind::Delete
            && request.repopulate.unwrap_or(self.config.repopulate_on_write);
        let payload = match &value {
            Some(value) if repopulate => Some(serde_json::to_string(value)?),
            _ => None,
        };

        match txn {
            Some(txn) => txn.defer(key, payload),
            None => txn::apply(&self.store, key, payload.as_deref()).await,
        }
        Ok(value)
    }

    /// Drop the cached entry for `key`
    pub async fn invalidate(&self, key: &str) {
        self.store.remove(key).await;
    }

    /// Open a scope for writes that belong to one caller transaction
    pub fn begin(&self) -> TxnScope {
        TxnScope::new(self.store.clone())
    }

    /// Bloom filter, for seeding known members
    pub fn bloom(&self) -> &BloomFilter {
        &self.bloom
    }

    /// Decision counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Stock ledger over the same backend
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Effective configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Registered lock strategies
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Hotspot detector, when enabled
    pub fn hotspot(&self) -> Option<&Arc<HotspotDetector>> {
        self.hotspot.as_ref()
    }

    /// Whether `key` is currently hot
    pub fn is_hot(&self, key: &str) -> bool {
        self.hotspot.as_ref().map_or(false, |d| d.is_hot(key))
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        if let Some(detector) = &self.hotspot {
            detector.shutdown();
        }
    }

    async fn fill<T, F, Fut>(&self, key: &str, compute: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<T>>> + Send,
    {
        match self.store.get(key).await {
            Lookup::Hit(payload) => {
                if let Some(value) = decode(key, &payload) {
                    return Ok(Some(value));
                }
            }
            Lookup::Null => return Ok(None),
            Lookup::Miss => {}
        }

        self.stats.record_computation();
        let value = compute().await?;
        let payload = value.as_ref().map(serde_json::to_string).transpose()?;
        match payload {
            Some(payload) => {
                self.store.set_random(key, &payload).await;
                if self.is_hot(key) {
                    self.store.upgrade(key).await;
                }
            }
            None if self.config.null_cache.enabled => self.store.set_null(key).await,
            None => {}
        }
        Ok(value)
    }

    fn on_absent<T: DeserializeOwned>(&self, request: &ReadRequest) -> Result<Option<T>> {
        let handler = self.handlers.resolve(request.miss_handler.as_deref());
        match handler.handle(&request.key, request.shape)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "cached payload does not decode, treating as not cached");
            None
        }
    }
}
