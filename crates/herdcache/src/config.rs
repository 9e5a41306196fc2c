//! Cache configuration
//!
//! Every field has a default, so a config file only needs to name what it
//! changes. The assembled [`CacheConfig`] is owned by
//! [`HerdCache`](crate::HerdCache) and shared by reference with the
//! components it builds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the in-process lock strategy
pub const LOCAL_LOCK: &str = "local";

/// Name of the lease-based lock strategy
pub const DISTRIBUTED_LOCK: &str = "distributed";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bloom filter admission
    pub bloom: BloomConfig,
    /// Caching of logical absence
    pub null_cache: NullCacheConfig,
    /// Lock strategies
    pub lock: LockConfig,
    /// Randomized TTL for cached payloads
    pub expiry: ExpiryConfig,
    /// Hotspot promotion and demotion
    pub hotspot: HotspotConfig,
    /// Miss handler used when a request names none
    pub miss_handler: String,
    /// Re-populate the cache with the mutate result instead of leaving it empty
    pub repopulate_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            bloom: BloomConfig::default(),
            null_cache: NullCacheConfig::default(),
            lock: LockConfig::default(),
            expiry: ExpiryConfig::default(),
            hotspot: HotspotConfig::default(),
            miss_handler: crate::handler::EXCEPTION_HANDLER.to_string(),
            repopulate_on_write: false,
        }
    }
}

/// Bloom filter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BloomConfig {
    /// Consult the filter before touching the backend
    pub enabled: bool,
    /// Expected number of distinct members
    pub expected_items: usize,
    /// Target false-positive rate, in (0, 1)
    pub false_positive_rate: f64,
    /// Number of bit positions per item
    pub hash_count: u32,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            expected_items: 10_000,
            false_positive_rate: 0.01,
            hash_count: 5,
        }
    }
}

/// Null sentinel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullCacheConfig {
    /// Store the sentinel when compute yields nothing
    pub enabled: bool,
    /// Reserved value marking cached absence
    pub sentinel: String,
    /// TTL of a sentinel entry, in seconds
    pub ttl_secs: u64,
}

impl Default for NullCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sentinel: "__NULL__".to_string(),
            ttl_secs: 30,
        }
    }
}

impl NullCacheConfig {
    /// TTL of a sentinel entry
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Lock settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Strategy used when a request names none or names an unknown one
    pub strategy: String,
    /// How long the local strategy waits for a key, in milliseconds
    pub local_timeout_ms: u64,
    /// Lease TTL of the distributed strategy, in seconds
    pub lease_ttl_secs: u64,
    /// Renew leases in the background while they are held
    pub watchdog: bool,
    /// How long the distributed strategy keeps retrying, in milliseconds
    pub acquire_wait_ms: u64,
    /// Pause between distributed acquisition attempts, in milliseconds
    pub retry_interval_ms: u64,
    /// Prefix of lease keys in the backend
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: DISTRIBUTED_LOCK.to_string(),
            local_timeout_ms: 2_000,
            lease_ttl_secs: 30,
            watchdog: true,
            acquire_wait_ms: 2_000,
            retry_interval_ms: 50,
            key_prefix: "DistributedLock".to_string(),
        }
    }
}

impl LockConfig {
    /// Local acquisition timeout
    pub fn local_timeout(&self) -> Duration {
        Duration::from_millis(self.local_timeout_ms)
    }

    /// Lease TTL
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// Total time spent retrying a distributed acquisition
    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }

    /// Pause between distributed attempts
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms.max(1))
    }
}

/// Randomized expiry bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Lower bound (inclusive), in seconds
    pub min_secs: u64,
    /// Upper bound (exclusive), in seconds
    pub max_secs: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            min_secs: 10,
            max_secs: 31,
        }
    }
}

impl ExpiryConfig {
    /// Range used when `min_secs >= max_secs`
    pub const FALLBACK: (u64, u64) = (10, 31);

    /// Largest bound accepted, the millisecond expiry limit of the backend
    pub const MAX_SECS: u64 = i64::MAX as u64 / 1_000;

    /// Effective `[min, max)` range in seconds
    pub fn bounds(&self) -> (u64, u64) {
        if self.min_secs < self.max_secs {
            (self.min_secs, self.max_secs)
        } else {
            Self::FALLBACK
        }
    }
}

/// Hotspot detector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotspotConfig {
    /// Track access frequency and adapt expiry
    pub enabled: bool,
    /// Sliding window length, in seconds
    pub interval_secs: u64,
    /// Hits within one window above which a key turns hot
    pub promote_threshold: u64,
    /// Hits within one window below which a hot key turns cold;
    /// defaults to `promote_threshold`
    pub demote_threshold: Option<u64>,
    /// Period of the background re-evaluation, in seconds
    pub sweep_period_secs: u64,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 3_600,
            promote_threshold: 200,
            demote_threshold: None,
            sweep_period_secs: 60,
        }
    }
}

impl HotspotConfig {
    /// Window length
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Effective demotion threshold
    pub fn demote_threshold(&self) -> u64 {
        self.demote_threshold.unwrap_or(self.promote_threshold)
    }

    /// Sweep period
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.sweep_period_secs)
    }
}

impl CacheConfig {
    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: CacheConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Reject settings the components cannot work with
    pub fn validate(&self) -> Result<()> {
        let fpr = self.bloom.false_positive_rate;
        if self.bloom.enabled {
            if !(fpr > 0.0 && fpr < 1.0) {
                return Err(Error::Config(format!(
                    "bloom.false_positive_rate must be in (0, 1), got {}",
                    fpr
                )));
            }
            if self.bloom.expected_items == 0 {
                return Err(Error::Config("bloom.expected_items must be positive".into()));
            }
            if self.bloom.hash_count == 0 {
                return Err(Error::Config("bloom.hash_count must be positive".into()));
            }
        }
        if self.lock.lease_ttl_secs == 0 {
            return Err(Error::Config("lock.lease_ttl_secs must be positive".into()));
        }
        if self.null_cache.enabled && self.null_cache.sentinel.is_empty() {
            return Err(Error::Config("null_cache.sentinel must not be empty".into()));
        }
        if self.expiry.min_secs.max(self.expiry.max_secs) > ExpiryConfig::MAX_SECS {
            return Err(Error::Config(format!(
                "expiry bounds must not exceed {} seconds",
                ExpiryConfig::MAX_SECS
            )));
        }
        if self.hotspot.enabled {
            if self.hotspot.interval_secs == 0 {
                return Err(Error::Config("hotspot.interval_secs must be positive".into()));
            }
            if self.hotspot.sweep_period_secs == 0 {
                return Err(Error::Config("hotspot.sweep_period_secs must be positive".into()));
            }
        }
        Ok(())
    }
}
