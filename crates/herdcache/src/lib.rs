//! # herdcache
//!
//! Cache-aside guard layer for HerdGuard.
//!
//! ## Architecture
//! - **BloomFilter**: lock-free admission check, no false negatives
//! - **Locks**: per-key [`LocalLock`] table and lease-based
//!   [`DistributedLock`] with a renewal watchdog
//! - **Null sentinel**: cached absence with a short fixed TTL
//! - **HotspotDetector**: frequency windows that persist hot keys and give
//!   cooled keys a random TTL back
//! - **HerdCache**: get-or-compute and mutate-then-invalidate on top of all of
//!   the above

#![warn(missing_docs)]

pub mod bloom;
mod cache;
pub mod config;
mod error;
pub mod handler;
pub mod hotspot;
mod key;
mod lease_lock;
mod local_lock;
mod lock;
mod request;
mod stats;
mod store;
mod txn;

pub use bloom::BloomFilter;
pub use cache::{HerdCache, HerdCacheBuilder};
pub use config::CacheConfig;
pub use error::{BoxError, Error, Result};
pub use handler::{MissHandler, ResultShape};
pub use hotspot::{HotspotDetector, Transition};
pub use key::{CacheKey, KeyTemplate};
pub use lease_lock::DistributedLock;
pub use local_lock::LocalLock;
pub use lock::{CacheLock, LockRegistry, LockToken};
pub use request::{BloomProbe, ReadRequest, WriteKind, WriteRequest};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{random_ttl_in, CacheStore, Lookup};
pub use txn::TxnScope;

pub use herdstore;
