//! The object store facade.

use crate::codec::ObjectSerializer;
use crate::config::Config;
use crate::error::CoreResult;
use crate::lock::LockManager;
use crate::snapshot::{Snapshot, SnapshotManager};
use crate::stats::{StatsSnapshot, StoreStats};
use crate::store::{CachingStore, SerializingStore};
use crate::structure::StructureLock;
use crate::transaction::{CommitHandle, PreCommitHook, Transaction, TransactionManager};
use crate::types::TransactionId;
use crate::writeback::WritebackPipeline;
use objstore_storage::{InMemoryStore, PersistentStore};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// A transactional, multi-version object store.
///
/// `ObjectStore` wires the layers together: the persistent backend behind
/// a serializing store and read cache, the write-back pipeline, the
/// snapshot manager and the transaction manager.
///
/// # Example
///
/// ```rust,ignore
/// use objstore_core::{Config, LockingStrategy, ObjectStore, TaggedSerializer};
///
/// let serializer = Arc::new(TaggedSerializer::new().register::<Inode>("inode"));
/// let store = ObjectStore::open_in_memory(serializer)?;
///
/// store.run_with_retry_default(|tx| {
///     let root = tx.get::<Inode>(&ObjectKey::new("inode/1"), LockingStrategy::Write)?;
///     tx.put(Arc::new(Inode::child_of(root)))
/// })?;
/// ```
pub struct ObjectStore {
    config: Config,
    store: Arc<CachingStore>,
    writeback: Arc<WritebackPipeline>,
    transactions: TransactionManager,
    stats: Arc<StoreStats>,
}

impl ObjectStore {
    /// Opens a store over `backend`.
    ///
    /// Transaction ids continue above the highest version found in the
    /// backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be scanned or the write-back
    /// threads cannot be started.
    pub fn open(
        backend: Arc<dyn PersistentStore>,
        serializer: Arc<dyn ObjectSerializer>,
        config: Config,
    ) -> CoreResult<Self> {
        let stats = Arc::new(StoreStats::new());
        let store = Arc::new(CachingStore::new(
            SerializingStore::new(backend, serializer),
            config.cache_size_limit,
            Arc::clone(&stats),
        ));
        let recovered = store.inner().max_version()?;

        let structure = Arc::new(StructureLock::new());
        let writeback = Arc::new(WritebackPipeline::start(
            Arc::clone(&store),
            structure,
            &config,
            Arc::clone(&stats),
        )?);
        let snapshots = Arc::new(SnapshotManager::new(
            Arc::clone(&writeback),
            Arc::clone(&store),
            config.refresh_policy,
            Arc::clone(&stats),
        ));
        snapshots.recover_committed(recovered);

        let first_id = TransactionId::new(recovered.as_u64() + 1);
        let transactions = TransactionManager::new(
            Arc::clone(&writeback),
            Arc::clone(&store),
            snapshots,
            &config,
            Arc::clone(&stats),
            first_id,
        );
        info!(
            recovered = %recovered,
            next_tx = %first_id,
            workers = config.writeback_workers,
            "object store opened"
        );

        Ok(Self {
            config,
            store,
            writeback,
            transactions,
            stats,
        })
    }

    /// Opens an empty store kept in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the write-back threads cannot be started.
    pub fn open_in_memory(serializer: Arc<dyn ObjectSerializer>) -> CoreResult<Self> {
        Self::open(Arc::new(InMemoryStore::new()), serializer, Config::default())
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Transaction {
        self.transactions.begin()
    }

    /// Commits a transaction; see [`TransactionManager::commit`].
    ///
    /// # Errors
    ///
    /// Returns a conflict, hook or shutdown error; the transaction is
    /// aborted on any error.
    pub fn commit(&self, tx: &mut Transaction) -> CoreResult<CommitHandle> {
        self.transactions.commit(tx)
    }

    /// Aborts a transaction.
    pub fn rollback(&self, tx: &mut Transaction) {
        self.transactions.rollback(tx);
    }

    /// Runs `work` in a transaction, retrying conflicts up to `attempts` times.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error or the last conflict.
    pub fn run_with_retry<T>(
        &self,
        attempts: usize,
        work: impl FnMut(&mut Transaction) -> CoreResult<T>,
    ) -> CoreResult<T> {
        self.transactions.run_with_retry(attempts, work)
    }

    /// Like [`run_with_retry`](Self::run_with_retry) with
    /// [`Config::default_retry_attempts`].
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error or the last conflict.
    pub fn run_with_retry_default<T>(&self, work: impl FnMut(&mut Transaction) -> CoreResult<T>) -> CoreResult<T> {
        self.transactions
            .run_with_retry(self.config.default_retry_attempts, work)
    }

    /// Opens a snapshot of everything committed so far.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be registered.
    pub fn snapshot(&self) -> CoreResult<Snapshot> {
        self.transactions.snapshot()
    }

    /// Opens a snapshot at an explicit id.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CoreError::IllegalSnapshotId`] if `id` is below an
    /// id registered before or below the newest commit, and
    /// [`crate::CoreError::SnapshotAhead`] if `id` has not been handed to a
    /// transaction yet.
    pub fn create_snapshot(&self, id: TransactionId) -> CoreResult<Snapshot> {
        self.transactions.create_snapshot(id)
    }

    /// Registers a pre-commit hook.
    pub fn add_hook(&self, hook: Arc<dyn PreCommitHook>) {
        self.transactions.add_hook(hook);
    }

    /// Returns the per-key lock registry.
    #[must_use]
    pub fn locks(&self) -> &LockManager {
        self.transactions.locks()
    }

    /// Returns the write-back pipeline.
    #[must_use]
    pub fn writeback(&self) -> &Arc<WritebackPipeline> {
        &self.writeback
    }

    /// Returns the snapshot manager.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        self.transactions.snapshots()
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns a point-in-time copy of the store counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns `(records, bytes)` held by the read cache.
    #[must_use]
    pub fn cache_usage(&self) -> (usize, usize) {
        self.store.usage()
    }

    /// Blocks until every commit so far is durable.
    pub fn flush_all(&self) {
        self.writeback.flush_all();
    }

    /// Drains the write-back pipeline and stops it. Later commits with
    /// writes fail with [`crate::CoreError::ShuttingDown`].
    pub fn shutdown(&self) {
        self.writeback.shutdown();
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("transactions", &self.transactions)
            .field("writeback", &self.writeback)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::store::test_support::{serializer, Item};
    use crate::transaction::LockingStrategy;
    use objstore_storage::{FileStore, ObjectKey};
    use tempfile::tempdir;

    fn read(store: &ObjectStore, name: &str) -> Option<i64> {
        store
            .snapshot()
            .unwrap()
            .get::<Item>(&ObjectKey::new(name))
            .unwrap()
            .map(|item| item.value)
    }

    #[test]
    fn in_memory_round_trip() {
        let store = ObjectStore::open_in_memory(serializer()).unwrap();
        store
            .run_with_retry_default(|tx| tx.put(Item::new("a", 1)))
            .unwrap();
        assert_eq!(read(&store, "a"), Some(1));

        store.flush_all();
        assert_eq!(read(&store, "a"), Some(1));
        let stats = store.stats();
        assert_eq!(stats.transactions_committed, 1);
        assert!(stats.snapshots_opened >= 2);
    }

    #[test]
    fn reopen_sees_fenced_data() {
        let dir = tempdir().unwrap();
        let last = {
            let backend = Arc::new(FileStore::open(dir.path()).unwrap());
            let store = ObjectStore::open(backend, serializer(), Config::default()).unwrap();
            let mut tx = store.begin();
            tx.put(Item::new("a", 1)).unwrap();
            tx.put(Item::new("b", 2)).unwrap();
            let handle = store.commit(&mut tx).unwrap();
            handle.fence();
            handle.tx_id()
        };

        let backend = Arc::new(FileStore::open(dir.path()).unwrap());
        let store = ObjectStore::open(backend, serializer(), Config::default()).unwrap();
        assert_eq!(read(&store, "a"), Some(1));
        assert_eq!(read(&store, "b"), Some(2));

        let mut tx = store.begin();
        assert!(tx.id() > last);
        let b = tx.get::<Item>(&ObjectKey::new("b"), LockingStrategy::Optimistic).unwrap();
        assert_eq!(b.map(|item| item.value), Some(2));
        tx.put(Item::new("b", 3)).unwrap();
        store.commit(&mut tx).unwrap();
        assert_eq!(read(&store, "b"), Some(3));
    }

    #[test]
    fn explicit_snapshot_ids_follow_commits() {
        let store = ObjectStore::open_in_memory(serializer()).unwrap();
        let committed = store
            .run_with_retry_default(|tx| {
                tx.put(Item::new("a", 1))?;
                Ok(tx.id())
            })
            .unwrap();
        assert!(matches!(
            store.create_snapshot(TransactionId::ZERO),
            Err(CoreError::IllegalSnapshotId { .. })
        ));
        let snapshot = store.create_snapshot(committed).unwrap();
        assert_eq!(snapshot.id(), committed);
        assert_eq!(store.snapshots().live_snapshots(), 1);
    }

    #[test]
    fn shutdown_rejects_writes() {
        let store = ObjectStore::open_in_memory(serializer()).unwrap();
        store.run_with_retry_default(|tx| tx.put(Item::new("a", 1))).unwrap();
        store.shutdown();
        assert!(store.writeback().pending_write(&ObjectKey::new("a")).is_none());

        let mut tx = store.begin();
        tx.put(Item::new("b", 1)).unwrap();
        assert!(matches!(store.commit(&mut tx), Err(CoreError::ShuttingDown)));
        assert_eq!(read(&store, "a"), Some(1));
    }
}
