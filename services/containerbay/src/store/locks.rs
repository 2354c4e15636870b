//! Per-key lock table.
//!
//! Each key maps to an interned async mutex plus a count of tasks holding or
//! waiting for it. The slot is created on first use and removed when the last
//! holder lets go, so the table only ever contains keys somebody is touching.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

struct Slot {
    lock: Arc<Mutex<()>>,
    /// Holders plus waiters.
    holders: usize,
}

type Slots = Arc<DashMap<String, Slot>>;

/// Table of per-key exclusive locks.
#[derive(Clone, Default)]
pub struct LockTable {
    slots: Slots,
}

impl LockTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire exclusive access to `key`, waiting for the current holder if any.
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let registration = self.register(key);
        let lock = registration.lock.clone();
        let guard = lock.lock_owned().await;

        debug!(key = %key, "Acquired lock");

        KeyGuard {
            guard: Some(guard),
            registration,
        }
    }

    /// Acquire `key` only if nobody holds or is waiting for it.
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let lock = Arc::new(Mutex::new(()));

        match self.slots.entry(key.to_string()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    lock: lock.clone(),
                    holders: 1,
                });
            }
        }

        let guard = lock.clone().try_lock_owned().ok();
        debug!(key = %key, "Acquired lock");

        Some(KeyGuard {
            guard,
            registration: Registration {
                key: key.to_string(),
                lock,
                slots: self.slots.clone(),
            },
        })
    }

    /// Whether anybody holds or waits for `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Number of keys currently held or awaited.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no key is held or awaited.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn register(&self, key: &str) -> Registration {
        let lock = {
            let mut slot = self
                .slots
                .entry(key.to_string())
                .or_insert_with(|| Slot {
                    lock: Arc::new(Mutex::new(())),
                    holders: 0,
                });
            slot.holders += 1;
            slot.lock.clone()
        };

        Registration {
            key: key.to_string(),
            lock,
            slots: self.slots.clone(),
        }
    }
}

/// Counts one holder (or waiter) of a slot until dropped.
///
/// Lives across the wait in [`LockTable::lock`], so a cancelled waiter still
/// gives its count back.
struct Registration {
    key: String,
    lock: Arc<Mutex<()>>,
    slots: Slots,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Entry::Occupied(mut slot) = self.slots.entry(std::mem::take(&mut self.key)) {
            slot.get_mut().holders -= 1;
            if slot.get().holders == 0 {
                let (key, _) = slot.remove_entry();
                debug!(key = %key, "Released lock");
            }
        }
    }
}

/// Exclusive access to one key. Dropping it unlocks the key.
pub struct KeyGuard {
    // Field order matters: the mutex is released before the slot count drops.
    guard: Option<OwnedMutexGuard<()>>,
    registration: Registration,
}

impl KeyGuard {
    /// The locked key.
    pub fn key(&self) -> &str {
        &self.registration.key
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard")
            .field("key", &self.registration.key)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_lock_unlock_leaves_no_state() {
        let table = LockTable::new();

        let guard = table.lock("abc").await;
        assert!(table.is_locked("abc"));
        assert_eq!(guard.key(), "abc");
        drop(guard);

        assert!(!table.is_locked("abc"));
        assert!(table.is_empty());

        // Relocking the same key from the same caller does not deadlock
        let guard = table.lock("abc").await;
        drop(guard);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_second_locker_waits_for_release() {
        let table = LockTable::new();
        let first = table.lock("abc").await;

        let waiter = tokio::spawn({
            let table = table.clone();
            async move {
                let _guard = table.lock("abc").await;
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(table.len(), 1);

        drop(first);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();

        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let table = LockTable::new();

        let guard = table.try_lock("abc").expect("free key");
        assert!(table.try_lock("abc").is_none());
        assert!(table.try_lock("def").is_some());

        drop(guard);
        assert!(table.try_lock("abc").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_releases_its_slot() {
        let table = LockTable::new();
        let held = table.lock("abc").await;

        let attempt = tokio::time::timeout(Duration::from_millis(20), table.lock("abc")).await;
        assert!(attempt.is_err());

        drop(held);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let table = LockTable::new();
        let _a = table.lock("a").await;

        let b = tokio::time::timeout(Duration::from_secs(1), table.lock("b")).await;
        assert!(b.is_ok());
        assert_eq!(table.len(), 2);
    }
}
