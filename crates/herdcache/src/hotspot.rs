//! Hotspot detection
//!
//! Every cache hit bumps a per-key counter inside a sliding window. A key
//! whose count passes the promotion threshold turns hot and loses its TTL; a
//! hot key whose count stays under the demotion threshold for a whole window
//! turns cold and gets a random TTL back. The hot flag only ever changes
//! through compare-and-swap, so each edge fires once however many tasks
//! cross the threshold together.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::RandomState;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::HotspotConfig;
use crate::stats::CacheStats;
use crate::store::CacheStore;

/// Access statistics of one key
///
/// Timestamps are milliseconds since the detector was created.
#[derive(Debug)]
pub struct KeyStat {
    frequency: AtomicU64,
    hot: AtomicBool,
    window_start: AtomicU64,
    last_access: AtomicU64,
}

impl KeyStat {
    fn new(now_ms: u64) -> Self {
        Self {
            frequency: AtomicU64::new(0),
            hot: AtomicBool::new(false),
            window_start: AtomicU64::new(now_ms),
            last_access: AtomicU64::new(now_ms),
        }
    }

    /// Hits in the current window
    pub fn frequency(&self) -> u64 {
        self.frequency.load(Ordering::Acquire)
    }

    /// Whether the key is currently hot
    pub fn is_hot(&self) -> bool {
        self.hot.load(Ordering::Acquire)
    }

    /// Start of the current window
    pub fn window_start_ms(&self) -> u64 {
        self.window_start.load(Ordering::Acquire)
    }

    /// Time of the latest hit
    pub fn last_access_ms(&self) -> u64 {
        self.last_access.load(Ordering::Acquire)
    }

    fn restart_window(&self, now_ms: u64) {
        self.window_start.store(now_ms, Ordering::Release);
        self.frequency.store(0, Ordering::Release);
    }
}

/// Outcome of evaluating a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed
    Unchanged,
    /// The window elapsed and was restarted
    WindowReset,
    /// Cold to hot
    Promoted,
    /// Hot to cold
    Demoted,
}

/// Per-key frequency tracker driving expiry policy
pub struct HotspotDetector {
    store: CacheStore,
    stats: Arc<CacheStats>,
    keys: DashMap<String, Arc<KeyStat>, RandomState>,
    interval_ms: u64,
    promote_threshold: u64,
    demote_threshold: u64,
    sweep_period: Duration,
    epoch: Instant,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl HotspotDetector {
    /// Create a detector; call [`start`](Self::start) to run the sweeper
    pub fn new(store: CacheStore, config: &HotspotConfig, stats: Arc<CacheStats>) -> Self {
        Self {
            store,
            stats,
            keys: DashMap::with_hasher(RandomState::new()),
            interval_ms: config.interval().as_millis() as u64,
            promote_threshold: config.promote_threshold,
            demote_threshold: config.demote_threshold(),
            sweep_period: config.sweep_period().max(Duration::from_millis(1)),
            epoch: Instant::now(),
            sweeper: Mutex::new(None),
        }
    }

    /// Count a hit on `key` and evaluate it
    pub async fn record_hit(&self, key: &str) -> Transition {
        let now = self.now_ms();
        let stat = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyStat::new(now)))
            .value()
            .clone();
        stat.frequency.fetch_add(1, Ordering::AcqRel);
        stat.last_access.store(now, Ordering::Release);
        self.evaluate(key, &stat).await
    }

    /// Whether `key` is tracked and hot
    pub fn is_hot(&self, key: &str) -> bool {
        self.keys.get(key).map_or(false, |stat| stat.is_hot())
    }

    /// Statistics of `key`, if tracked
    pub fn stat(&self, key: &str) -> Option<Arc<KeyStat>> {
        self.keys.get(key).map(|stat| stat.value().clone())
    }

    /// Number of tracked keys
    pub fn tracked(&self) -> usize {
        self.keys.len()
    }

    /// Re-evaluate every tracked key
    pub async fn sweep(&self) {
        let tracked: Vec<(String, Arc<KeyStat>)> = self
            .keys
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for (key, stat) in tracked {
            self.evaluate(&key, &stat).await;
        }
    }

    /// Spawn the periodic sweep, replacing a running one
    ///
    /// The task only holds a weak reference and ends once the detector is
    /// dropped.
    pub fn start(self: &Arc<Self>) {
        let detector: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(detector) = detector.upgrade() else {
                    break;
                };
                detector.sweep().await;
            }
            info!("hotspot sweeper stopped");
        });
        info!(period_ms = period.as_millis() as u64, "hotspot sweeper started");
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the periodic sweep
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
            info!("hotspot sweeper stopped");
        }
    }

    async fn evaluate(&self, key: &str, stat: &KeyStat) -> Transition {
        let now = self.now_ms();
        let window_start = stat.window_start_ms();

        if now.saturating_sub(window_start) > self.interval_ms {
            if stat.is_hot() && stat.frequency() < self.demote_threshold {
                if stat
                    .hot
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.store.downgrade(key).await;
                    stat.restart_window(now);
                    self.stats.record_demotion();
                    debug!(key, "hotspot demoted");
                    return Transition::Demoted;
                }
                return Transition::Unchanged;
            }
            if stat
                .window_start
                .compare_exchange(window_start, now, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                stat.frequency.store(0, Ordering::Release);
                return Transition::WindowReset;
            }
            return Transition::Unchanged;
        }

        if stat.frequency() > self.promote_threshold
            && stat
                .hot
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.store.upgrade(key).await;
            stat.restart_window(now);
            self.stats.record_promotion();
            debug!(key, "hotspot promoted");
            return Transition::Promoted;
        }
        Transition::Unchanged
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Drop for HotspotDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use async_trait::async_trait;
    use herdstore::{Backend, MemoryBackend, Reply, Script};
    use std::sync::atomic::AtomicUsize;

    /// Memory backend counting `persist` and `expire` calls
    #[derive(Default)]
    struct CountingBackend {
        inner: MemoryBackend,
        persists: AtomicUsize,
        expires: AtomicUsize,
    }

    #[async_trait]
    impl Backend for CountingBackend {
        async fn get(&self, key: &str) -> herdstore::Result<Option<String>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> herdstore::Result<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> herdstore::Result<bool> {
            self.inner.delete(key).await
        }
        async fn persist(&self, key: &str) -> herdstore::Result<bool> {
            self.persists.fetch_add(1, Ordering::SeqCst);
            self.inner.persist(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> herdstore::Result<bool> {
            self.expires.fetch_add(1, Ordering::SeqCst);
            self.inner.expire(key, ttl).await
        }
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> herdstore::Result<bool> {
            self.inner.set_if_absent(key, value, ttl).await
        }
        async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> herdstore::Result<Reply> {
            self.inner.eval(script, keys, args).await
        }
    }

    fn detector(backend: Arc<dyn Backend>, promote: u64) -> Arc<HotspotDetector> {
        let config = CacheConfig {
            hotspot: HotspotConfig {
                interval_secs: 10,
                promote_threshold: promote,
                sweep_period_secs: 1,
                ..HotspotConfig::default()
            },
            ..CacheConfig::default()
        };
        let store = CacheStore::new(backend, &config);
        Arc::new(HotspotDetector::new(store, &config.hotspot, Arc::new(CacheStats::new())))
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotes_past_threshold() {
        let memory = Arc::new(MemoryBackend::new());
        memory.set("k", "1", Some(Duration::from_secs(20))).await.unwrap();
        let detector = detector(memory.clone(), 3);

        for _ in 0..3 {
            assert_eq!(detector.record_hit("k").await, Transition::Unchanged);
        }
        assert!(!detector.is_hot("k"));
        assert_eq!(detector.record_hit("k").await, Transition::Promoted);
        assert!(detector.is_hot("k"));
        assert_eq!(memory.ttl("k"), None);
        assert_eq!(detector.stat("k").unwrap().frequency(), 0);
        assert_eq!(detector.stats.promotions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_window_resets() {
        let detector = detector(Arc::new(MemoryBackend::new()), 3);
        detector.record_hit("k").await;
        detector.record_hit("k").await;

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(detector.record_hit("k").await, Transition::WindowReset);
        assert_eq!(detector.stat("k").unwrap().frequency(), 0);
        assert!(!detector.is_hot("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_demotes_idle_hot_key() {
        let memory = Arc::new(MemoryBackend::new());
        memory.set("k", "1", Some(Duration::from_secs(20))).await.unwrap();
        let detector = detector(memory.clone(), 1);
        detector.start();

        detector.record_hit("k").await;
        assert_eq!(detector.record_hit("k").await, Transition::Promoted);
        assert_eq!(memory.ttl("k"), None);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!detector.is_hot("k"));
        assert!(memory.ttl("k").is_some());
        assert_eq!(detector.stats.demotions(), 1);
        detector.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_hot_key_stays_hot() {
        let memory = Arc::new(MemoryBackend::new());
        memory.set("k", "1", None).await.unwrap();
        let detector = detector(memory.clone(), 1);

        detector.record_hit("k").await;
        detector.record_hit("k").await;
        assert!(detector.is_hot("k"));

        for _ in 0..5 {
            detector.record_hit("k").await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(detector.record_hit("k").await, Transition::WindowReset);
        assert!(detector.is_hot("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_crossing_upgrades_once() {
        let backend = Arc::new(CountingBackend::default());
        backend.set("k", "1", Some(Duration::from_secs(60))).await.unwrap();
        let detector = detector(backend.clone(), 10);

        let barrier = Arc::new(tokio::sync::Barrier::new(50));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let (detector, barrier) = (detector.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    detector.record_hit("k").await
                })
            })
            .collect();

        let mut promoted = 0;
        for task in tasks {
            if task.await.unwrap() == Transition::Promoted {
                promoted += 1;
            }
        }
        assert_eq!(promoted, 1);
        assert_eq!(backend.persists.load(Ordering::SeqCst), 1);
        assert!(detector.is_hot("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_idle_hits_downgrade_once() {
        let backend = Arc::new(CountingBackend::default());
        backend.set("k", "1", Some(Duration::from_secs(60))).await.unwrap();
        let config = HotspotConfig {
            interval_secs: 1,
            promote_threshold: 100,
            demote_threshold: Some(1_000),
            sweep_period_secs: 1,
            ..HotspotConfig::default()
        };
        let store = CacheStore::new(backend.clone(), &CacheConfig::default());
        let detector = Arc::new(HotspotDetector::new(store, &config, Arc::new(CacheStats::new())));

        let mut promoted = 0;
        for _ in 0..101 {
            if detector.record_hit("k").await == Transition::Promoted {
                promoted += 1;
            }
        }
        assert_eq!(promoted, 1);
        assert_eq!(backend.inner.ttl("k"), None);

        tokio::time::sleep(Duration::from_millis(1_100)).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(50));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let (detector, barrier) = (detector.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    detector.record_hit("k").await
                })
            })
            .collect();

        let mut demoted = 0;
        for task in tasks {
            if task.await.unwrap() == Transition::Demoted {
                demoted += 1;
            }
        }
        assert_eq!(demoted, 1);
        assert_eq!(backend.expires.load(Ordering::SeqCst), 1);
        assert_eq!(detector.stats.demotions(), 1);
        assert!(!detector.is_hot("k"));
        assert!(backend.inner.ttl("k").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_ends_when_detector_dropped() {
        let detector = detector(Arc::new(MemoryBackend::new()), 1);
        detector.start();
        let weak = Arc::downgrade(&detector);
        drop(detector);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(weak.upgrade().is_none());
    }
}
