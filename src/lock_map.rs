//! Single-holder operation tokens, one per device serial.
//!
//! Every step acquires the token of each device it touches; a token is held
//! for the whole step, so two operations can never interleave on one device.
//! Acquisition is non-blocking by default; only the background key ingest
//! waits for a busy appliance.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard, TryLockError};

#[derive(Default)]
pub struct LockMap<K: Hash + Eq> {
    inner: std::sync::Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

/// Witness that the key's token is held. Dropping it releases the token;
/// the map entry itself survives so the same key keeps a single token across
/// repeated operations.
pub struct LockMapGuard {
    _guard: OwnedMutexGuard<()>,
}

impl<K: Hash + Eq + Clone> LockMap<K> {
    fn mutex_by_key(&self, key: K) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().expect("lock map");
        map.entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until the key's token is free, then take it.
    pub async fn lock(&self, key: K) -> LockMapGuard {
        let guard = self.mutex_by_key(key).lock_owned().await;
        LockMapGuard { _guard: guard }
    }

    /// Take the key's token only if it is free right now.
    pub fn try_lock(&self, key: K) -> Result<LockMapGuard, TryLockError> {
        let guard = self.mutex_by_key(key).try_lock_owned()?;
        Ok(LockMapGuard { _guard: guard })
    }

    /// Drop the token entry for a device that no longer exists. A holder of
    /// an already-issued guard keeps it until the guard drops.
    pub fn forget(&self, key: &K) {
        self.inner.lock().expect("lock map").remove(key);
    }
}
