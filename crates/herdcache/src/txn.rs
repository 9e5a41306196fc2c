//! Deferred cache maintenance for transactional writes
//!
//! Writes made inside a transaction must not touch the cache until the
//! transaction commits: a rolled-back change would otherwise leave the cache
//! describing data that never existed.

use parking_lot::Mutex;
use tracing::debug;

use crate::store::CacheStore;

struct Deferred {
    key: String,
    payload: Option<String>,
}

/// Queue of invalidations tied to one caller transaction
pub struct TxnScope {
    store: CacheStore,
    pending: Mutex<Vec<Deferred>>,
}

impl TxnScope {
    pub(crate) fn new(store: CacheStore) -> Self {
        Self {
            store,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn defer(&self, key: &str, payload: Option<String>) {
        self.pending.lock().push(Deferred {
            key: key.to_string(),
            payload,
        });
    }

    /// Number of queued invalidations
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Apply queued invalidations in order
    pub async fn commit(self) {
        let pending = std::mem::take(&mut *self.pending.lock());
        debug!(count = pending.len(), "applying deferred invalidations");
        for deferred in pending {
            apply(&self.store, &deferred.key, deferred.payload.as_deref()).await;
        }
    }

    /// Discard queued invalidations
    pub fn rollback(self) {
        debug!(count = self.pending(), "discarding deferred invalidations");
    }
}

/// Invalidate `key`, then write `payload` back if any
pub(crate) async fn apply(store: &CacheStore, key: &str, payload: Option<&str>) {
    store.remove(key).await;
    if let Some(payload) = payload {
        store.set_random(key, payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use herdstore::{Backend, MemoryBackend};
    use std::sync::Arc;

    fn scope() -> (Arc<MemoryBackend>, TxnScope) {
        let memory = Arc::new(MemoryBackend::new());
        let store = CacheStore::new(memory.clone(), &CacheConfig::default());
        (memory, TxnScope::new(store))
    }

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let (memory, txn) = scope();
        memory.set("a", "old", None).await.unwrap();
        memory.set("b", "old", None).await.unwrap();

        txn.defer("a", None);
        txn.defer("b", Some("new".into()));
        assert_eq!(txn.pending(), 2);
        assert_eq!(memory.get("a").await.unwrap().as_deref(), Some("old"));

        txn.commit().await;
        assert!(!memory.contains("a"));
        assert_eq!(memory.get("b").await.unwrap().as_deref(), Some("new"));
        assert!(memory.ttl("b").is_some());
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let (memory, txn) = scope();
        memory.set("a", "old", None).await.unwrap();
        txn.defer("a", None);
        txn.rollback();
        assert_eq!(memory.get("a").await.unwrap().as_deref(), Some("old"));
    }
}
