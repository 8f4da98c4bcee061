//! The structure lock.
//!
//! One readers-writer lock guards every in-memory structure that must change
//! atomically with respect to readers: the pending write map, the snapshot
//! index and the read cache's view of the backend. The value under the lock
//! is the structure version, bumped by every exclusive holder that changes
//! what a reader would see. Cursors compare versions to detect that they
//! must rebuild.
//!
//! Lock order: the structure lock is always taken before any inner lock of
//! the structures it guards.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Shared guard; the structure version can be read through it.
pub(crate) type SharedGuard<'a> = RwLockReadGuard<'a, u64>;

#[derive(Debug, Default)]
pub(crate) struct StructureLock {
    version: RwLock<u64>,
}

impl StructureLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn shared(&self) -> SharedGuard<'_> {
        self.version.read()
    }

    pub(crate) fn exclusive(&self) -> ExclusiveGuard<'_> {
        ExclusiveGuard {
            version: self.version.write(),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        *self.version.read()
    }
}

/// Exclusive guard handed to code that publishes structural changes.
pub(crate) struct ExclusiveGuard<'a> {
    version: RwLockWriteGuard<'a, u64>,
}

impl ExclusiveGuard<'_> {
    /// Marks the structure as changed.
    pub(crate) fn bump(&mut self) -> u64 {
        *self.version += 1;
        *self.version
    }
}
