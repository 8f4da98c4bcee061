//! Per-key exclusive locks.
//!
//! Slots live in a shared table only while someone holds or waits for the
//! key; the last guard to leave removes the slot. Callers that need several
//! keys must take them in ascending key order, the one global order every
//! participant follows.
//!
//! A lock belongs to the transaction that took it, not to a thread: guards
//! travel with their transaction between threads.

use crate::types::TransactionId;
use objstore_storage::ObjectKey;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct Slot {
    owner: Option<TransactionId>,
    waiters: usize,
    released: Arc<Condvar>,
}

impl Slot {
    fn new() -> Self {
        Self {
            owner: None,
            waiters: 0,
            released: Arc::new(Condvar::new()),
        }
    }
}

#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<ObjectKey, Slot>>,
}

impl LockTable {
    fn release(&self, key: &ObjectKey) {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(key) else {
            return;
        };
        slot.owner = None;
        if slot.waiters == 0 {
            slots.remove(key);
        } else {
            slot.released.notify_one();
        }
    }
}

/// Registry of per-key locks.
///
/// Locks are not re-entrant: locking a key the same owner already holds is
/// a programming error and panics.
#[derive(Clone, Default)]
pub struct LockManager {
    table: Arc<LockTable>,
}

impl LockManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `key` is locked on behalf of `owner`.
    ///
    /// # Panics
    ///
    /// Panics if `owner` already holds the lock.
    pub fn lock(&self, key: &ObjectKey, owner: TransactionId) -> KeyLockGuard {
        let mut slots = self.table.slots.lock();
        loop {
            let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
            match slot.owner {
                None => {
                    slot.owner = Some(owner);
                    break;
                }
                Some(held) if held == owner => {
                    panic!("lock on {key} is not re-entrant ({owner} holds it)");
                }
                Some(_) => {
                    slot.waiters += 1;
                    let released = Arc::clone(&slot.released);
                    released.wait(&mut slots);
                    if let Some(slot) = slots.get_mut(key) {
                        slot.waiters -= 1;
                    }
                }
            }
        }
        KeyLockGuard {
            key: key.clone(),
            owner,
            table: Arc::clone(&self.table),
        }
    }

    /// Locks `key` for `owner` if nobody holds it.
    ///
    /// # Panics
    ///
    /// Panics if `owner` already holds the lock.
    pub fn try_lock(&self, key: &ObjectKey, owner: TransactionId) -> Option<KeyLockGuard> {
        let mut slots = self.table.slots.lock();
        let slot = slots.entry(key.clone()).or_insert_with(Slot::new);
        match slot.owner {
            None => {
                slot.owner = Some(owner);
                Some(KeyLockGuard {
                    key: key.clone(),
                    owner,
                    table: Arc::clone(&self.table),
                })
            }
            Some(held) if held == owner => panic!("lock on {key} is not re-entrant ({owner} holds it)"),
            Some(_) => None,
        }
    }

    /// Returns the owner holding `key`, if any.
    #[must_use]
    pub fn holder(&self, key: &ObjectKey) -> Option<TransactionId> {
        self.table.slots.lock().get(key).and_then(|slot| slot.owner)
    }

    /// Returns true if some owner holds `key`.
    #[must_use]
    pub fn is_locked(&self, key: &ObjectKey) -> bool {
        self.holder(key).is_some()
    }

    /// Number of keys currently held or waited on.
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.table.slots.lock().len()
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("active_slots", &self.active_slots())
            .finish()
    }
}

/// Exclusive hold on one key; released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyLockGuard {
    key: ObjectKey,
    owner: TransactionId,
    table: Arc<LockTable>,
}

impl KeyLockGuard {
    /// The locked key.
    #[must_use]
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// The transaction the lock was taken for.
    #[must_use]
    pub fn owner(&self) -> TransactionId {
        self.owner
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}

impl fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn tx(id: u64) -> TransactionId {
        TransactionId::new(id)
    }

    #[test]
    fn lock_and_release() {
        let locks = LockManager::new();
        let key = ObjectKey::new("a");
        {
            let guard = locks.lock(&key, tx(1));
            assert_eq!(guard.key(), &key);
            assert_eq!(guard.owner(), tx(1));
            assert_eq!(locks.holder(&key), Some(tx(1)));
        }
        assert!(!locks.is_locked(&key));
        assert_eq!(locks.active_slots(), 0);
    }

    #[test]
    fn try_lock_fails_while_held_by_another_owner() {
        let locks = LockManager::new();
        let key = ObjectKey::new("a");
        let _guard = locks.lock(&key, tx(1));

        assert!(locks.try_lock(&key, tx(2)).is_none());
        assert_eq!(locks.active_slots(), 1);
    }

    #[test]
    #[should_panic(expected = "not re-entrant")]
    fn relocking_by_same_owner_panics() {
        let locks = LockManager::new();
        let key = ObjectKey::new("a");
        let _first = locks.lock(&key, tx(1));
        let _second = locks.lock(&key, tx(1));
    }

    #[test]
    fn waiters_are_serialized() {
        let locks = LockManager::new();
        let key = ObjectKey::new("hot");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8u64)
            .map(|worker| {
                let locks = locks.clone();
                let key = key.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for round in 0..20 {
                        let _guard = locks.lock(&key, tx(worker * 100 + round));
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(50));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_slots(), 0);
    }

    #[test]
    fn guard_can_move_between_threads() {
        let locks = LockManager::new();
        let key = ObjectKey::new("a");
        let guard = locks.lock(&key, tx(1));
        thread::spawn(move || drop(guard)).join().unwrap();
        assert!(!locks.is_locked(&key));
    }

    #[test]
    fn moved_guard_makes_its_old_thread_wait_not_panic() {
        let locks = LockManager::new();
        let key = ObjectKey::new("a");
        let guard = locks.lock(&key, tx(1));
        let holder = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(guard);
        });

        let second = locks.lock(&key, tx(2));
        assert_eq!(second.owner(), tx(2));
        holder.join().unwrap();
    }
}
