//! Per-session mutual exclusion
//!
//! One async mutex per session id, created on first use. Holders of a
//! session's guard are serialized; different sessions never contend.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Keyed map of async mutexes, each protecting a `T` for one session
pub struct SessionLocks<T = ()> {
    slots: RwLock<HashMap<String, Arc<Mutex<T>>>>,
}

impl<T: Default> SessionLocks<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Wait for exclusive access to `session_id`'s slot
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<T> {
        self.slot(session_id).await.lock_owned().await
    }

    async fn slot(&self, session_id: &str) -> Arc<Mutex<T>> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(session_id) {
                return slot.clone();
            }
        }

        let mut slots = self.slots.write().await;
        slots
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(T::default())))
            .clone()
    }

    /// Drop `session_id`'s slot when nobody else holds or awaits it and
    /// `is_idle` accepts its value. Call only after releasing the guard.
    /// Returns true when the slot was removed.
    pub async fn remove_if<F>(&self, session_id: &str, is_idle: F) -> bool
    where
        F: FnOnce(&T) -> bool,
    {
        let mut slots = self.slots.write().await;
        let Some(slot) = slots.get(session_id) else {
            return false;
        };

        // Clones are only handed out under the map lock, so a count of one
        // cannot grow while we hold the write guard.
        if Arc::strong_count(slot) != 1 {
            return false;
        }
        let idle = match slot.try_lock() {
            Ok(value) => is_idle(&*value),
            Err(_) => false,
        };
        if idle {
            slots.remove(session_id);
        }
        idle
    }

    /// Session ids that currently have a slot
    pub async fn keys(&self) -> Vec<String> {
        self.slots.read().await.keys().cloned().collect()
    }

    /// Snapshot of every slot, for read-only sweeps
    pub(crate) async fn entries(&self) -> Vec<(String, Arc<Mutex<T>>)> {
        self.slots
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl<T: Default> Default for SessionLocks<T> {
    fn default() -> Self {
        Self::new()
    }
}
