//! Per-key async locks.

use crate::core::{DocumentId, StageKey};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per (document, stage).
///
/// Serializes transitions for a key inside this process. Cross-process
/// safety comes from the store's compare-and-swap.
#[derive(Debug, Default)]
pub(crate) struct KeyLocks {
    inner: DashMap<StageKey, Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self, key: &StageKey) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(&self.inner.entry(key.clone()).or_default());
        mutex.lock_owned().await
    }

    /// Drops locks nobody holds or waits on.
    pub(crate) fn prune(&self) {
        self.inner.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub(crate) fn forget_document(&self, document_id: &DocumentId) {
        self.inner
            .retain(|k, m| &k.document_id != document_id || Arc::strong_count(m) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let key = StageKey::new("d1", "a");

        let guard = locks.lock(&key).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&key).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyLocks::new();
        let held = locks.lock(&StageKey::new("d1", "a")).await;
        drop(locks.lock(&StageKey::new("d1", "b")).await);
        assert_eq!(locks.len(), 2);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.forget_document(&"d1".into());
        assert_eq!(locks.len(), 0);
    }
}
