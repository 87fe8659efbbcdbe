//! One async mutex per string key
//!
//! Backs both the per-artifact build lock and the per-session execution lock.
//! Waiters are served in FIFO order (tokio `Mutex` fairness).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLock {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Held lock for one key; released on drop
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let slot = self.slot(key);
        KeyedGuard {
            key: key.to_string(),
            _guard: slot.lock_owned().await,
        }
    }

    /// `None` if the lock could not be taken before `timeout`
    pub async fn lock_timeout(&self, key: &str, timeout: Duration) -> Option<KeyedGuard> {
        let slot = self.slot(key);
        let guard = tokio::time::timeout(timeout, slot.lock_owned()).await.ok()?;
        Some(KeyedGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    pub fn try_lock(&self, key: &str) -> Option<KeyedGuard> {
        let slot = self.slot(key);
        let guard = slot.try_lock_owned().ok()?;
        Some(KeyedGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Held or waited on by someone right now
    pub fn is_locked(&self, key: &str) -> bool {
        self.locks
            .get(key)
            .map_or(false, |slot| Arc::strong_count(slot.value()) > 1 || slot.try_lock().is_err())
    }

    /// Drop slots nobody holds or waits on
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
