//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::lock::KeyLockGuard;
use crate::record::{downcast_record, Record, VersionedRecord};
use crate::snapshot::Snapshot;
use crate::transaction::cursor::{TxCursor, TxView};
use crate::transaction::manager::TxShared;
use crate::types::TransactionId;
use objstore_cursor::{Cursor, IteratorStart};
use objstore_storage::ObjectKey;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

/// How a read protects the value it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingStrategy {
    /// Read without locking; commit validates that the value is unchanged.
    #[default]
    Optimistic,
    /// Lock the key until the transaction ends.
    Write,
}

/// A buffered mutation.
#[derive(Debug, Clone)]
pub enum TxWrite {
    /// Insert or replace the record under its key.
    Put(Arc<dyn Record>),
    /// Remove the key.
    Delete,
}

impl TxWrite {
    /// The record written, or `None` for a delete.
    #[must_use]
    pub fn record(&self) -> Option<&Arc<dyn Record>> {
        match self {
            Self::Put(record) => Some(record),
            Self::Delete => None,
        }
    }
}

/// An observation recorded in the read set.
#[derive(Debug, Clone)]
pub(crate) struct ReadEntry {
    pub(crate) observed: Option<VersionedRecord>,
}

/// A private, single-use unit of work.
///
/// Reads see the snapshot opened when the transaction began, with this
/// transaction's own buffered writes on top. Writes stay invisible to
/// everyone else until
/// [`TransactionManager::commit`](crate::TransactionManager::commit).
pub struct Transaction {
    id: TransactionId,
    shared: Arc<TxShared>,
    state: TransactionState,
    /// Released when the transaction ends.
    snapshot: Option<Snapshot>,
    /// Read set for validation: key -> value observed by the first read.
    reads: BTreeMap<ObjectKey, ReadEntry>,
    /// Locks held, taken by WRITE reads or by commit.
    locks: BTreeMap<ObjectKey, KeyLockGuard>,
    writes: BTreeMap<ObjectKey, TxWrite>,
    /// Keys written since the commit last drained them.
    fresh: BTreeSet<ObjectKey>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, snapshot: Snapshot, shared: Arc<TxShared>) -> Self {
        Self {
            id,
            shared,
            state: TransactionState::Active,
            snapshot: Some(snapshot),
            reads: BTreeMap::new(),
            locks: BTreeMap::new(),
            writes: BTreeMap::new(),
            fresh: BTreeSet::new(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the id of the snapshot reads are served from, or `None` once
    /// the transaction has ended.
    #[must_use]
    pub fn snapshot_id(&self) -> Option<TransactionId> {
        self.snapshot.as_ref().map(Snapshot::id)
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Buffers a put of `record` under its own key.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is no longer active.
    pub fn put(&mut self, record: Arc<dyn Record>) -> CoreResult<()> {
        self.ensure_active()?;
        let key = record.key();
        self.fresh.insert(key.clone());
        self.writes.insert(key, TxWrite::Put(record));
        Ok(())
    }

    /// Buffers a delete of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is no longer active.
    pub fn delete(&mut self, key: &ObjectKey) -> CoreResult<()> {
        self.ensure_active()?;
        self.fresh.insert(key.clone());
        self.writes.insert(key.clone(), TxWrite::Delete);
        Ok(())
    }

    /// Reads `key` as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] if the stored record is of another
    /// kind, and a conflict error if a locked read finds the key changed
    /// since the snapshot.
    pub fn get<T: Record>(&mut self, key: &ObjectKey, strategy: LockingStrategy) -> CoreResult<Option<Arc<T>>> {
        self.get_record(key, strategy)?
            .map(downcast_record::<T>)
            .transpose()
    }

    /// Reads `key` without a kind check.
    ///
    /// Own buffered writes are returned first. Otherwise the key is read from
    /// the transaction's snapshot and the observation joins the read set;
    /// later reads repeat it. A [`LockingStrategy::Write`] read also takes
    /// the key's lock for the rest of the transaction and then checks that no
    /// commit changed the key after the snapshot was taken.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SerializationConflict`] if a locked key carries a
    /// version above the snapshot, [`CoreError::ReadInstability`] if it was
    /// created or deleted after the snapshot, [`CoreError::LockContention`]
    /// if the lock cannot be taken without risking deadlock.
    pub fn get_record(&mut self, key: &ObjectKey, strategy: LockingStrategy) -> CoreResult<Option<Arc<dyn Record>>> {
        self.ensure_active()?;
        if let Some(write) = self.writes.get(key) {
            return Ok(write.record().cloned());
        }
        let locked_now = strategy == LockingStrategy::Write && !self.locks.contains_key(key);
        if strategy == LockingStrategy::Write {
            self.acquire(key)?;
        }
        let observed = match self.reads.get(key) {
            Some(entry) => entry.observed.clone(),
            None => {
                let seen = self.snapshot()?.read(key)?;
                self.reads.insert(
                    key.clone(),
                    ReadEntry {
                        observed: seen.clone(),
                    },
                );
                seen
            }
        };
        if locked_now {
            if let Err(error) = self.check_unchanged(key, observed.as_ref()) {
                self.locks.remove(key);
                return Err(error);
            }
        }
        observed.map(|record| record.record()).transpose()
    }

    /// Fails if the latest committed value of a locked `key` is not `seen`.
    fn check_unchanged(&self, key: &ObjectKey, seen: Option<&VersionedRecord>) -> CoreResult<()> {
        let anchor = self.snapshot()?.id();
        match (seen, self.shared.read_current(key)?) {
            (_, Some(now)) if now.version() > anchor => Err(CoreError::SerializationConflict {
                tx: self.id,
                key: key.clone(),
                current_version: now.version(),
            }),
            (None, None) => Ok(()),
            (Some(seen), Some(now)) if seen.same_value(&now) => Ok(()),
            _ => Err(CoreError::ReadInstability {
                tx: self.id,
                key: key.clone(),
            }),
        }
    }

    /// Opens a cursor over this transaction's view: its buffered writes over
    /// its snapshot, with buffered deletes hiding stored keys.
    ///
    /// Every stored key the cursor returns joins the read set.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is no longer active or a layer
    /// cannot be opened.
    pub fn iter(&mut self, start: IteratorStart, key: &ObjectKey) -> CoreResult<TxCursor<'_>> {
        self.ensure_active()?;
        let view = TxView::new(self.snapshot()?.clone(), &self.writes);
        Ok(TxCursor::new(view, start, key, &mut self.reads)?)
    }

    /// Collects the records with keys in `[from, to)`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is no longer active or a layer
    /// cannot be read.
    pub fn range(&mut self, from: &ObjectKey, to: &ObjectKey) -> CoreResult<Vec<(ObjectKey, Arc<dyn Record>)>> {
        let mut cursor = self.iter(IteratorStart::Ge, from)?;
        let mut out = Vec::new();
        while cursor.peek_next_key()?.is_some_and(|key| key < *to) {
            if let Some(entry) = cursor.next()? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Returns the buffered write for `key`, if any.
    #[must_use]
    pub fn pending_write(&self, key: &ObjectKey) -> Option<&TxWrite> {
        self.writes.get(key)
    }

    /// Returns all buffered writes in key order.
    pub fn pending_writes(&self) -> impl Iterator<Item = (&ObjectKey, &TxWrite)> {
        self.writes.iter()
    }

    /// Returns the number of buffered writes.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Returns the keys in the read set.
    pub fn read_keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.reads.keys()
    }

    /// Returns the keys this transaction holds locks on.
    pub fn locked_keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.locks.keys()
    }

    /// Locks `key` for the rest of the transaction.
    ///
    /// Keys ordered after every held lock are waited for. Any other key is
    /// only tried and fails with [`CoreError::LockContention`] when taken.
    pub(crate) fn acquire(&mut self, key: &ObjectKey) -> CoreResult<()> {
        if self.locks.contains_key(key) {
            return Ok(());
        }
        let in_order = self.locks.keys().next_back().map_or(true, |held| held < key);
        let guard = if in_order {
            self.shared.locks.lock(key, self.id)
        } else {
            self.shared
                .locks
                .try_lock(key, self.id)
                .ok_or_else(|| CoreError::LockContention {
                    tx: self.id,
                    key: key.clone(),
                })?
        };
        self.locks.insert(key.clone(), guard);
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<TxShared> {
        &self.shared
    }

    pub(crate) fn reads(&self) -> &BTreeMap<ObjectKey, ReadEntry> {
        &self.reads
    }

    pub(crate) fn writes(&self) -> &BTreeMap<ObjectKey, TxWrite> {
        &self.writes
    }

    /// Drains the keys written since the last call.
    pub(crate) fn take_fresh(&mut self) -> BTreeSet<ObjectKey> {
        std::mem::take(&mut self.fresh)
    }

    /// Drops the locks and the snapshot.
    pub(crate) fn release(&mut self) {
        self.locks.clear();
        self.snapshot = None;
    }

    fn snapshot(&self) -> CoreResult<&Snapshot> {
        self.snapshot
            .as_ref()
            .ok_or_else(|| CoreError::invalid_operation("transaction snapshot released"))
    }

    /// Marks the transaction as committed.
    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    /// Marks the transaction as aborted.
    pub(crate) fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
    }

    /// Ensures the transaction is active.
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(CoreError::invalid_operation("transaction already committed")),
            TransactionState::Aborted => Err(CoreError::invalid_operation("transaction already aborted")),
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("snapshot", &self.snapshot_id())
            .field("state", &self.state)
            .field("reads", &self.reads.len())
            .field("writes", &self.writes.len())
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}
