//! Per-key mutual exclusion
//!
//! Two strategies share the [`CacheLock`] contract: [`LocalLock`] serializes
//! tasks of one process, [`DistributedLock`] serializes every process sharing
//! the backend. A [`LockToken`] proves ownership; dropping it without an
//! explicit release still frees the lock.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use herdstore::Backend;

use crate::config::{LockConfig, DISTRIBUTED_LOCK};
use crate::error::{Error, Result};
use crate::lease_lock::{DistributedLock, LeaseHold};
use crate::local_lock::{LocalHold, LocalLock};

/// A lock strategy
#[async_trait]
pub trait CacheLock: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Take the lock for `key`, failing with [`Error::Busy`] when it cannot
    /// be obtained within the strategy's time limit
    async fn acquire(&self, key: &str) -> Result<LockToken>;

    /// Give the lock back. Failures are logged, never returned.
    async fn release(&self, token: LockToken);
}

impl dyn CacheLock {
    /// Run `f` while holding the lock for `key`
    ///
    /// The lock is released whether `f` succeeds or fails. If the returned
    /// future is dropped midway, the token's drop releases it instead.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let token = self.acquire(key).await?;
        let result = f().await;
        self.release(token).await;
        result
    }
}

pub(crate) enum Hold {
    Detached,
    Local(LocalHold),
    Lease(LeaseHold),
}

/// Proof of ownership of a key's lock
pub struct LockToken {
    key: String,
    lease_id: String,
    hold: Hold,
}

impl LockToken {
    /// Token for a custom strategy that tracks ownership itself
    pub fn new(key: impl Into<String>, lease_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            lease_id: lease_id.into(),
            hold: Hold::Detached,
        }
    }

    pub(crate) fn held(key: impl Into<String>, lease_id: impl Into<String>, hold: Hold) -> Self {
        Self {
            key: key.into(),
            lease_id: lease_id.into(),
            hold,
        }
    }

    /// Locked key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Random token identifying this grant
    pub fn lease_id(&self) -> &str {
        &self.lease_id
    }

    pub(crate) fn into_hold(self) -> Hold {
        self.hold
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("key", &self.key)
            .field("lease_id", &self.lease_id)
            .finish()
    }
}

/// Lock strategies by name
pub struct LockRegistry {
    locks: HashMap<String, Arc<dyn CacheLock>>,
    default: String,
}

impl LockRegistry {
    /// Empty registry falling back to `default`
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            locks: HashMap::new(),
            default: default.into(),
        }
    }

    /// Registry holding the local and distributed strategies
    pub fn with_builtin(backend: Arc<dyn Backend>, config: &LockConfig) -> Self {
        let mut registry = Self::new(config.strategy.clone());
        registry.register(Arc::new(LocalLock::new(config.local_timeout())));
        registry.register(Arc::new(DistributedLock::new(backend, config)));
        registry
    }

    /// Add or replace a strategy under its own name
    pub fn register(&mut self, lock: Arc<dyn CacheLock>) {
        self.locks.insert(lock.name().to_string(), lock);
    }

    /// Resolve `name`, then the configured default, then `"distributed"`
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn CacheLock>> {
        name.and_then(|n| self.locks.get(n))
            .or_else(|| self.locks.get(&self.default))
            .or_else(|| self.locks.get(DISTRIBUTED_LOCK))
            .cloned()
            .ok_or_else(|| Error::Internal("no lock strategy registered".into()))
    }

    /// Registered strategy names
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.locks.keys().map(String::as_str)
    }
}
