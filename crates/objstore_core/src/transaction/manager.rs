//! Transaction manager.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::record::{Record, VersionedRecord};
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::stats::StoreStats;
use crate::store::CachingStore;
use crate::structure::StructureLock;
use crate::transaction::hooks::{Change, PreCommitHook};
use crate::transaction::state::{Transaction, TxWrite};
use crate::types::{BundleId, TransactionId};
use crate::writeback::{Bundle, PendingEntry, WritebackPipeline};
use objstore_storage::ObjectKey;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// State every transaction of one manager reads through.
pub(crate) struct TxShared {
    structure: Arc<StructureLock>,
    writeback: Arc<WritebackPipeline>,
    store: Arc<CachingStore>,
    pub(crate) locks: LockManager,
}

impl TxShared {
    /// Latest committed value of `key`: the pending write if there is one,
    /// else the stored record.
    pub(crate) fn read_current(&self, key: &ObjectKey) -> CoreResult<Option<VersionedRecord>> {
        let _structure = self.structure.shared();
        match self.writeback.pending_write(key) {
            Some(PendingEntry::Write { record, .. }) => Ok(Some(record)),
            Some(PendingEntry::Delete { .. }) => Ok(None),
            None => self.store.read_object(key),
        }
    }
}

/// Coordinates optimistic transactions.
///
/// The transaction manager provides:
/// - Transaction ids from one global counter
/// - A snapshot per transaction, anchored at the newest commit when it began
/// - Per-key locking for WRITE reads and for every key a commit touches
/// - Pre-commit hooks run to a fixpoint
/// - Validation of the read set against concurrent commits
/// - Publication of the write set to the write-back pipeline
///
/// ## Commit order
///
/// A commit locks its keys in ascending key order, runs the hooks, checks
/// that no locked key carries a version at or above its own id and that
/// every read is still current, then publishes under the exclusive
/// structure lock. Locks are released whatever the outcome.
pub struct TransactionManager {
    shared: Arc<TxShared>,
    snapshots: Arc<SnapshotManager>,
    hooks: RwLock<Vec<Arc<dyn PreCommitHook>>>,
    next_id: AtomicU64,
    max_hook_iterations: usize,
    stats: Arc<StoreStats>,
}

impl TransactionManager {
    /// Creates a manager whose first transaction gets `first_id`.
    pub(crate) fn new(
        writeback: Arc<WritebackPipeline>,
        store: Arc<CachingStore>,
        snapshots: Arc<SnapshotManager>,
        config: &Config,
        stats: Arc<StoreStats>,
        first_id: TransactionId,
    ) -> Self {
        Self {
            shared: Arc::new(TxShared {
                structure: Arc::clone(writeback.structure()),
                writeback,
                store,
                locks: LockManager::new(),
            }),
            snapshots,
            hooks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(first_id.as_u64()),
            max_hook_iterations: config.max_hook_iterations,
            stats,
        }
    }

    fn allocate_id(&self) -> TransactionId {
        TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Begins a new transaction reading from a snapshot of everything
    /// committed so far.
    ///
    /// The snapshot is registered before the id is allocated, so it is
    /// always anchored below the transaction's own id.
    pub fn begin(&self) -> Transaction {
        let snapshot = self.snapshots.create_latest();
        let id = self.allocate_id();
        self.stats.record_transaction_start();
        trace!(tx = %id, snapshot = %snapshot.id(), "transaction started");
        Transaction::new(id, snapshot, Arc::clone(&self.shared))
    }

    /// Opens a snapshot of everything committed so far.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible alongside
    /// [`create_snapshot`](Self::create_snapshot).
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        Ok(self.snapshots.create_latest())
    }

    /// Opens a snapshot at an explicit id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalSnapshotId`] if `id` is below an id
    /// registered before or below the newest commit, and
    /// [`CoreError::SnapshotAhead`] if no transaction with that id has begun.
    pub fn create_snapshot(&self, id: TransactionId) -> CoreResult<Snapshot> {
        let next = TransactionId::new(self.next_id.load(Ordering::SeqCst));
        if id >= next {
            return Err(CoreError::SnapshotAhead { requested: id, next });
        }
        self.snapshots.create_snapshot(id)
    }

    /// Registers a pre-commit hook. Hooks of equal priority run in
    /// registration order.
    pub fn add_hook(&self, hook: Arc<dyn PreCommitHook>) {
        let mut hooks = self.hooks.write();
        let priority = hook.priority();
        let at = hooks.partition_point(|existing| existing.priority() <= priority);
        hooks.insert(at, hook);
    }

    /// Returns the per-key lock registry.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        &self.shared.locks
    }

    /// Returns the snapshot manager.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// Commits a transaction.
    ///
    /// The returned handle tells when the writes are durable; they are
    /// visible to new readers as soon as this returns.
    ///
    /// # Errors
    ///
    /// Returns a retryable conflict if validation fails (see
    /// [`CoreError::is_retryable`]), the first hook error, or
    /// [`CoreError::HookFixpointExceeded`]. The transaction is aborted on any
    /// error.
    pub fn commit(&self, tx: &mut Transaction) -> CoreResult<CommitHandle> {
        tx.ensure_active()?;
        let result = self.commit_inner(tx);
        tx.release();
        match result {
            Ok(handle) => {
                tx.mark_committed();
                self.stats.record_transaction_commit();
                debug!(
                    tx = %tx.id(),
                    writes = tx.write_count(),
                    bundle = ?handle.bundle_id(),
                    "transaction committed"
                );
                Ok(handle)
            }
            Err(error) => {
                tx.mark_aborted();
                self.stats.record_transaction_abort();
                if error.is_retryable() {
                    self.stats.record_conflict();
                    debug!(tx = %tx.id(), error = %error, "commit conflict");
                } else {
                    debug!(tx = %tx.id(), error = %error, "commit failed");
                }
                Err(error)
            }
        }
    }

    fn commit_inner(&self, tx: &mut Transaction) -> CoreResult<CommitHandle> {
        let id = tx.id();
        let hooks = self.hooks.read().clone();
        // Locked keys and their values as read under the lock.
        let mut locked: BTreeMap<ObjectKey, Option<VersionedRecord>> = BTreeMap::new();
        // Values as seen by the hooks: the locked value, then each processed write.
        let mut current: BTreeMap<ObjectKey, Option<Arc<dyn Record>>> = BTreeMap::new();
        let mut fresh = tx.take_fresh();
        let mut passes = 0;

        loop {
            Self::lock_dependencies(tx, &mut locked)?;
            if hooks.is_empty() || fresh.is_empty() {
                break;
            }
            if passes == self.max_hook_iterations {
                return Err(CoreError::HookFixpointExceeded { tx: id, iterations: passes });
            }
            passes += 1;
            trace!(tx = %id, pass = passes, writes = fresh.len(), "running pre-commit hooks");

            for key in fresh {
                let old = match current.get(&key) {
                    Some(value) => value.clone(),
                    None => locked
                        .get(&key)
                        .cloned()
                        .flatten()
                        .map(|record| record.record())
                        .transpose()?,
                };
                let new = tx.writes().get(&key).and_then(TxWrite::record).cloned();
                if let Some(change) = Change::classify(old, new.clone()) {
                    for hook in &hooks {
                        change.dispatch(hook.as_ref(), tx, &key)?;
                    }
                }
                current.insert(key, new);
            }
            fresh = tx.take_fresh();
        }

        Self::validate(tx, &locked)?;

        let writeback = &self.shared.writeback;
        if tx.writes().is_empty() {
            return Ok(CommitHandle {
                tx: id,
                bundle: None,
                writeback: Arc::clone(writeback),
            });
        }
        let bundle = writeback.create_bundle()?;
        let bundle_id = bundle.id();
        self.publish(tx, bundle)?;
        Ok(CommitHandle {
            tx: id,
            bundle: Some(bundle_id),
            writeback: Arc::clone(writeback),
        })
    }

    /// Locks every read or written key not locked yet, in key order.
    fn lock_dependencies(
        tx: &mut Transaction,
        locked: &mut BTreeMap<ObjectKey, Option<VersionedRecord>>,
    ) -> CoreResult<()> {
        let needed: BTreeSet<ObjectKey> = tx
            .reads()
            .keys()
            .chain(tx.writes().keys())
            .filter(|key| !locked.contains_key(*key))
            .cloned()
            .collect();
        for key in needed {
            tx.acquire(&key)?;
            let value = tx.shared().read_current(&key)?;
            locked.insert(key, value);
        }
        Ok(())
    }

    fn validate(tx: &Transaction, locked: &BTreeMap<ObjectKey, Option<VersionedRecord>>) -> CoreResult<()> {
        let id = tx.id();
        for (key, value) in locked {
            if let Some(record) = value {
                if record.version() >= id {
                    return Err(CoreError::SerializationConflict {
                        tx: id,
                        key: key.clone(),
                        current_version: record.version(),
                    });
                }
            }
        }
        for (key, entry) in tx.reads() {
            let now = locked.get(key).and_then(Option::as_ref);
            let stable = match (&entry.observed, now) {
                (None, None) => true,
                (Some(seen), Some(now)) => seen.same_value(now),
                _ => false,
            };
            if !stable {
                return Err(CoreError::ReadInstability {
                    tx: id,
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    fn publish(&self, tx: &Transaction, bundle: Bundle) -> CoreResult<()> {
        let writeback = &self.shared.writeback;
        for (key, write) in tx.writes() {
            let staged = match write {
                TxWrite::Put(record) => {
                    writeback.write(&bundle, key.clone(), VersionedRecord::new(tx.id(), Arc::clone(record)))
                }
                TxWrite::Delete => writeback.delete(&bundle, key.clone()),
            };
            if let Err(error) = staged {
                writeback.drop_bundle(bundle);
                return Err(error);
            }
        }

        let mut structure = self.shared.structure.exclusive();
        if let Err(error) = self.snapshots.prepare_commit(tx.id(), tx.writes().keys(), &structure) {
            drop(structure);
            writeback.drop_bundle(bundle);
            return Err(error);
        }
        writeback.publish(bundle, &mut structure)?;
        self.snapshots.note_committed(tx.id(), &structure);
        Ok(())
    }

    /// Aborts a transaction, releasing its locks. Nothing is written.
    pub fn rollback(&self, tx: &mut Transaction) {
        if !tx.is_active() {
            return;
        }
        tx.release();
        tx.mark_aborted();
        self.stats.record_transaction_abort();
        debug!(tx = %tx.id(), "transaction rolled back");
    }

    /// Runs `work` in a fresh transaction and commits it, retrying the whole
    /// unit on retryable failures up to `attempts` times.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last conflict once the
    /// attempts are used up.
    pub fn run_with_retry<T>(
        &self,
        attempts: usize,
        mut work: impl FnMut(&mut Transaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = self.begin();
            let outcome = work(&mut tx).and_then(|value| self.commit(&mut tx).map(|_| value));
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            self.rollback(&mut tx);
            if !error.is_retryable() {
                return Err(error);
            }
            if attempt >= attempts {
                warn!(attempts, error = %error, "transaction retries exhausted");
                return Err(error);
            }
            debug!(tx = %tx.id(), attempt, error = %error, "retrying transaction");
        }
    }
}

impl fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .field("hooks", &self.hooks.read().len())
            .field("locks", &self.shared.locks)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful commit.
#[derive(Clone)]
pub struct CommitHandle {
    tx: TransactionId,
    bundle: Option<BundleId>,
    writeback: Arc<WritebackPipeline>,
}

impl CommitHandle {
    /// The committed transaction.
    #[must_use]
    pub fn tx_id(&self) -> TransactionId {
        self.tx
    }

    /// The bundle carrying the writes; `None` for a read-only commit.
    #[must_use]
    pub fn bundle_id(&self) -> Option<BundleId> {
        self.bundle
    }

    /// Returns true once the writes are in the persistent store.
    #[must_use]
    pub fn is_durable(&self) -> bool {
        self.bundle
            .map_or(true, |bundle| self.writeback.durable_upto() >= bundle)
    }

    /// Blocks until the writes are in the persistent store.
    pub fn fence(&self) {
        if let Some(bundle) = self.bundle {
            self.writeback.fence(bundle);
        }
    }

    /// Runs `callback` once the writes are in the persistent store.
    pub fn on_flush(&self, callback: impl FnOnce() + Send + 'static) {
        match self.bundle {
            Some(bundle) => self.writeback.async_fence(bundle, callback),
            None => callback(),
        }
    }
}

impl fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHandle")
            .field("tx", &self.tx)
            .field("bundle", &self.bundle)
            .finish()
    }
}
