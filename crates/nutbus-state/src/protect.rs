//! Per-asset serialization without global locking
//!
//! A keyed mutex map: configuration work on one asset is serialized while
//! unrelated assets proceed in parallel. Guards are owned so callers may
//! hold them across NUT I/O awaits. Removal is bounded so a long-running
//! holder cannot deadlock the caller.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const REMOVE_RETRIES: usize = 10;

/// Keyed per-asset mutex map.
#[derive(Clone, Default)]
pub struct ProtectAsset {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ProtectAsset {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock();
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Lock an asset (blocking until available).
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        self.entry(name).lock_owned().await
    }

    /// Try locking an asset without blocking.
    pub fn try_lock(&self, name: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(name).try_lock_owned().ok()
    }

    /// Remove an asset's protection. Retries a bounded number of times if
    /// the lock is held; returns false when it stayed held or was absent.
    pub fn remove(&self, name: &str) -> bool {
        let mut map = self.inner.lock();
        let Some(mutex) = map.get(name).cloned() else {
            return false;
        };
        for _ in 0..REMOVE_RETRIES {
            if let Ok(guard) = mutex.clone().try_lock_owned() {
                drop(guard);
                map.remove(name);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
