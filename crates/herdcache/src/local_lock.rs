//! In-process lock table
//!
//! One async mutex per key, created on first use. Each slot counts the tasks
//! that are waiting on or holding it; the last one out removes the slot, but
//! only if the table still maps the key to that same slot and nobody enrolled
//! in the meantime. Enrollment happens under the table's shard lock, so a
//! concurrent newcomer either keeps the slot alive or creates a fresh one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::config::LOCAL_LOCK;
use crate::error::{Error, Result};
use crate::lock::{CacheLock, Hold, LockToken};

struct Slot {
    mutex: Arc<Mutex<()>>,
    users: AtomicUsize,
}

type Table = DashMap<String, Arc<Slot>, RandomState>;

/// Lock strategy scoped to the current process
pub struct LocalLock {
    table: Arc<Table>,
    timeout: Duration,
}

impl LocalLock {
    /// Create a table whose acquisitions wait at most `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(DashMap::with_hasher(RandomState::new())),
            timeout,
        }
    }

    /// Number of keys currently waited on or held
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Check if no key is waited on or held
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn enroll(&self, key: &str) -> LocalHold {
        let slot = {
            let entry = self.table.entry(key.to_string()).or_insert_with(|| {
                Arc::new(Slot {
                    mutex: Arc::new(Mutex::new(())),
                    users: AtomicUsize::new(0),
                })
            });
            entry.users.fetch_add(1, Ordering::SeqCst);
            entry.value().clone()
        };
        LocalHold {
            guard: None,
            slot,
            table: self.table.clone(),
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl CacheLock for LocalLock {
    fn name(&self) -> &str {
        LOCAL_LOCK
    }

    async fn acquire(&self, key: &str) -> Result<LockToken> {
        let mut hold = self.enroll(key);
        let mutex = hold.slot.mutex.clone();
        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                hold.guard = Some(guard);
                debug!(key, "local lock acquired");
                Ok(LockToken::held(key, String::new(), Hold::Local(hold)))
            }
            Err(_) => {
                debug!(key, timeout_ms = self.timeout.as_millis() as u64, "local lock busy");
                Err(Error::Busy(key.to_string()))
            }
        }
    }

    async fn release(&self, token: LockToken) {
        debug!(key = token.key(), "local lock released");
        if let Hold::Local(hold) = token.into_hold() {
            drop(hold);
        }
    }
}

/// Enrollment in a slot, plus the guard once acquired
pub(crate) struct LocalHold {
    guard: Option<OwnedMutexGuard<()>>,
    slot: Arc<Slot>,
    table: Arc<Table>,
    key: String,
}

impl Drop for LocalHold {
    fn drop(&mut self) {
        self.guard.take();
        if self.slot.users.fetch_sub(1, Ordering::SeqCst) == 1 {
            let slot = &self.slot;
            self.table.remove_if(&self.key, |_, current| {
                Arc::ptr_eq(current, slot) && current.users.load(Ordering::SeqCst) == 0
            });
        }
    }
}
