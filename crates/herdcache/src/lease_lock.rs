//! Lease-based lock shared through the backend
//!
//! A lease is a key `"{prefix}{cache key}"` holding a random token, written
//! with set-if-absent and a TTL. Only the holder's token can delete it. While
//! the watchdog is enabled, a renewal task re-arms the TTL every third of it,
//! and stops on its own as soon as the stored token is no longer ours.

use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use async_trait::async_trait;
use dashmap::DashMap;
use herdstore::script::RENEW_LEASE;
use herdstore::Backend;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{LockConfig, DISTRIBUTED_LOCK};
use crate::error::{Error, Result};
use crate::lock::{CacheLock, Hold, LockToken};

struct Renewal {
    lease_id: String,
    task: AbortHandle,
}

type Renewals = DashMap<String, Renewal, RandomState>;

/// Lock strategy serializing every process that shares the backend
pub struct DistributedLock {
    backend: Arc<dyn Backend>,
    prefix: String,
    ttl: Duration,
    watchdog: bool,
    wait: Duration,
    retry: Duration,
    renewals: Arc<Renewals>,
}

impl DistributedLock {
    /// Create from the lock settings
    pub fn new(backend: Arc<dyn Backend>, config: &LockConfig) -> Self {
        Self {
            backend,
            prefix: config.key_prefix.clone(),
            ttl: config.lease_ttl(),
            watchdog: config.watchdog,
            wait: config.acquire_wait(),
            retry: config.retry_interval(),
            renewals: Arc::new(DashMap::with_hasher(RandomState::new())),
        }
    }

    /// Backend key of the lease guarding `key`
    pub fn lease_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Lease TTL
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of running renewal tasks
    pub fn active_watchdogs(&self) -> usize {
        self.renewals.len()
    }

    /// Single attempt; [`Error::Conflict`] when another party holds the lease
    pub async fn try_acquire(&self, key: &str) -> Result<LockToken> {
        let lease_key = self.lease_key(key);
        let lease_id = Uuid::new_v4().to_string();
        if self.backend.set_if_absent(&lease_key, &lease_id, self.ttl).await? {
            Ok(self.grant(key, lease_key, lease_id))
        } else {
            Err(Error::Conflict(key.to_string()))
        }
    }

    /// Delete the lease of `key` if it still carries `lease_id`
    pub async fn release_lease(&self, key: &str, lease_id: &str) -> Result<bool> {
        let lease_key = self.lease_key(key);
        stop_renewal(&self.renewals, &lease_key, lease_id);
        Ok(self.backend.compare_and_delete(&lease_key, lease_id).await?)
    }

    /// Stop every renewal task; their leases run out by TTL
    pub fn shutdown(&self) {
        self.renewals.retain(|_, renewal| {
            renewal.task.abort();
            false
        });
    }

    fn grant(&self, key: &str, lease_key: String, lease_id: String) -> LockToken {
        debug!(key, lease = %lease_id, "lease acquired");
        if self.watchdog {
            let task = self.spawn_watchdog(lease_key.clone(), lease_id.clone());
            let renewal = Renewal {
                lease_id: lease_id.clone(),
                task,
            };
            if let Some(stale) = self.renewals.insert(lease_key.clone(), renewal) {
                stale.task.abort();
            }
        }
        let hold = LeaseHold {
            backend: self.backend.clone(),
            renewals: self.renewals.clone(),
            lease_key,
            lease_id: lease_id.clone(),
            released: false,
        };
        LockToken::held(key, lease_id, Hold::Lease(hold))
    }

    fn spawn_watchdog(&self, lease_key: String, lease_id: String) -> AbortHandle {
        let backend = self.backend.clone();
        let renewals = self.renewals.clone();
        let ttl_ms = self.ttl.as_millis().to_string();
        let period = (self.ttl / 3).max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let keys = [lease_key.clone()];
            let args = [lease_id.clone(), ttl_ms];
            loop {
                ticker.tick().await;
                match backend.eval(&RENEW_LEASE, &keys, &args).await {
                    Ok(reply) if reply.as_integer() == Some(1) => {
                        debug!(lease_key = %lease_key, "lease renewed");
                    }
                    Ok(_) => {
                        debug!(lease_key = %lease_key, "lease lost, watchdog stopping");
                        break;
                    }
                    Err(err) => {
                        warn!(lease_key = %lease_key, error = %err, "lease renewal failed");
                    }
                }
            }
            renewals.remove_if(&lease_key, |_, r| r.lease_id == lease_id);
        });
        task.abort_handle()
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl CacheLock for DistributedLock {
    fn name(&self) -> &str {
        DISTRIBUTED_LOCK
    }

    async fn acquire(&self, key: &str) -> Result<LockToken> {
        let lease_key = self.lease_key(key);
        let lease_id = Uuid::new_v4().to_string();
        let deadline = Instant::now() + self.wait;
        loop {
            match self.backend.set_if_absent(&lease_key, &lease_id, self.ttl).await {
                Ok(true) => return Ok(self.grant(key, lease_key, lease_id)),
                Ok(false) => {}
                Err(err) => warn!(key, error = %err, "lease acquisition failed"),
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(key, wait_ms = self.wait.as_millis() as u64, "lease busy");
                return Err(Error::Busy(key.to_string()));
            }
            tokio::time::sleep(self.retry.min(deadline - now)).await;
        }
    }

    async fn release(&self, token: LockToken) {
        let key = token.key().to_string();
        let lease_id = token.lease_id().to_string();
        match token.into_hold() {
            Hold::Lease(hold) => hold.release().await,
            _ => {
                if let Err(err) = self.release_lease(&key, &lease_id).await {
                    warn!(key = %key, error = %err, "lease release failed");
                }
            }
        }
    }
}

fn stop_renewal(renewals: &Renewals, lease_key: &str, lease_id: &str) {
    if let Some((_, renewal)) = renewals.remove_if(lease_key, |_, r| r.lease_id == lease_id) {
        renewal.task.abort();
    }
}

/// Ownership of a granted lease
pub(crate) struct LeaseHold {
    backend: Arc<dyn Backend>,
    renewals: Arc<Renewals>,
    lease_key: String,
    lease_id: String,
    released: bool,
}

impl LeaseHold {
    async fn release(mut self) {
        self.released = true;
        stop_renewal(&self.renewals, &self.lease_key, &self.lease_id);
        match self
            .backend
            .compare_and_delete(&self.lease_key, &self.lease_id)
            .await
        {
            Ok(true) => debug!(lease_key = %self.lease_key, "lease released"),
            Ok(false) => warn!(lease_key = %self.lease_key, "lease already expired or taken over"),
            Err(err) => warn!(lease_key = %self.lease_key, error = %err, "lease release failed"),
        }
    }
}

impl Drop for LeaseHold {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        stop_renewal(&self.renewals, &self.lease_key, &self.lease_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let lease_key = std::mem::take(&mut self.lease_key);
        let lease_id = std::mem::take(&mut self.lease_id);
        runtime.spawn(async move {
            if let Err(err) = backend.compare_and_delete(&lease_key, &lease_id).await {
                warn!(lease_key = %lease_key, error = %err, "lease release failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herdstore::MemoryBackend;

    fn config(watchdog: bool) -> LockConfig {
        LockConfig {
            lease_ttl_secs: 3,
            watchdog,
            acquire_wait_ms: 200,
            retry_interval_ms: 50,
            ..LockConfig::default()
        }
    }

    fn lock(watchdog: bool) -> (Arc<MemoryBackend>, DistributedLock) {
        let memory = Arc::new(MemoryBackend::new());
        let lock = DistributedLock::new(memory.clone(), &config(watchdog));
        (memory, lock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_writes_token_with_ttl() {
        let (memory, lock) = lock(false);
        let token = lock.acquire("order:1").await.unwrap();

        let stored = memory.get("DistributedLockorder:1").await.unwrap();
        assert_eq!(stored.as_deref(), Some(token.lease_id()));
        assert_eq!(memory.ttl("DistributedLockorder:1"), Some(Duration::from_secs(3)));

        lock.release(token).await;
        assert!(!memory.contains("DistributedLockorder:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_contention_is_busy_after_wait() {
        let (_memory, lock) = lock(false);
        let _held = lock.acquire("k").await.unwrap();

        let started = Instant::now();
        let err = lock.acquire("k").await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(200) && waited < Duration::from_millis(260));

        let err = lock.try_acquire("k").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_lease_after_release() {
        let (_memory, lock) = lock(false);
        let lock = Arc::new(lock);
        let held = lock.acquire("k").await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire("k").await.map(|t| t.lease_id().to_string()) })
        };
        tokio::time::sleep(Duration::from_millis(60)).await;
        lock.release(held).await;

        let id = waiter.await.unwrap().unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wrong_token_cannot_release() {
        let (memory, lock) = lock(false);
        let token = lock.acquire("k").await.unwrap();

        assert!(!lock.release_lease("k", "not-the-token").await.unwrap());
        assert!(memory.contains("DistributedLockk"));

        assert!(lock.release_lease("k", token.lease_id()).await.unwrap());
        assert!(!memory.contains("DistributedLockk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_keeps_lease_alive() {
        let (memory, lock) = lock(true);
        let token = lock.acquire("k").await.unwrap();
        assert_eq!(lock.active_watchdogs(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(memory.contains("DistributedLockk"));

        lock.release(token).await;
        assert_eq!(lock.active_watchdogs(), 0);
        assert!(!memory.contains("DistributedLockk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires_without_watchdog() {
        let (memory, lock) = lock(false);
        let _token = lock.acquire("k").await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!memory.contains("DistributedLockk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_stops_when_ownership_lost() {
        let (memory, lock) = lock(true);
        let _token = lock.acquire("k").await.unwrap();

        memory.set("DistributedLockk", "someone-else", None).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(lock.active_watchdogs(), 0);
        assert_eq!(
            memory.get("DistributedLockk").await.unwrap().as_deref(),
            Some("someone-else")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_token_releases_lease() {
        let (memory, lock) = lock(true);
        let token = lock.acquire("k").await.unwrap();
        drop(token);
        assert_eq!(lock.active_watchdogs(), 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!memory.contains("DistributedLockk"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_watchdogs() {
        let (_memory, lock) = lock(true);
        let _a = lock.acquire("a").await.unwrap();
        let _b = lock.acquire("b").await.unwrap();
        assert_eq!(lock.active_watchdogs(), 2);
        lock.shutdown();
        assert_eq!(lock.active_watchdogs(), 0);
    }
}
