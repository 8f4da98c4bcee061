//! Snapshots: stable, point-in-time read views.
//!
//! A snapshot anchored at id `S` sees every transaction with id `<= S` and
//! none above, no matter what commits or flushes happen while it is open.
//!
//! Three layers make up the view, newest first:
//!
//! 1. the superseded-version index, for values replaced after `S`
//! 2. the write-back pending map, where versions above `S` act as tombstones
//! 3. the persistent store, again hiding versions above `S`
//!
//! Snapshots are reference counted per id. When the oldest one goes away,
//! index entries no live snapshot can see are collected.

mod index;

use crate::error::{CoreError, CoreResult};
use crate::record::{downcast_record, Record, VersionedRecord};
use crate::stats::StoreStats;
use crate::store::CachingStore;
use crate::structure::{ExclusiveGuard, SharedGuard, StructureLock};
use crate::types::TransactionId;
use crate::writeback::{PendingEntry, WritebackPipeline};
use index::{visible_in, SnapshotEntry, SnapshotIndex, SnapshotIndexCursor, SnapshotKey};
use objstore_cursor::{
    BoxedCursor, Cursor, CursorError, CursorResult, IteratorStart, MapCursor, MappingCursor, MaybeTombstone,
    RefreshPolicy, RefreshSource, RefreshingCursor, TombstoneMergingCursor, TypePredicateCursor,
};
use objstore_storage::ObjectKey;
use parking_lot::{Mutex, RwLock};
use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Forward cursor over a snapshot; see [`Snapshot::cursor`].
pub type SnapshotCursor = RefreshingCursor<ObjectKey, VersionedRecord, SnapshotView>;

#[derive(Debug, Default)]
struct Registry {
    /// Live snapshot ids and their reference counts.
    live: BTreeMap<TransactionId, usize>,
    /// Highest id ever registered.
    last: TransactionId,
    /// Highest committed transaction id.
    committed: TransactionId,
}

/// Tracks live snapshots and the versions they still need.
pub struct SnapshotManager {
    structure: Arc<StructureLock>,
    writeback: Arc<WritebackPipeline>,
    store: Arc<CachingStore>,
    registry: Mutex<Registry>,
    index: RwLock<Arc<SnapshotIndex>>,
    refresh_policy: RefreshPolicy,
    stats: Arc<StoreStats>,
}

impl SnapshotManager {
    pub(crate) fn new(
        writeback: Arc<WritebackPipeline>,
        store: Arc<CachingStore>,
        refresh_policy: RefreshPolicy,
        stats: Arc<StoreStats>,
    ) -> Self {
        Self {
            structure: Arc::clone(writeback.structure()),
            writeback,
            store,
            registry: Mutex::new(Registry::default()),
            index: RwLock::new(Arc::new(BTreeMap::new())),
            refresh_policy,
            stats,
        }
    }

    /// Registers a snapshot at `id`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IllegalSnapshotId`] if `id` is below a snapshot
    /// id registered earlier or below the newest committed transaction.
    pub(crate) fn create_snapshot(self: &Arc<Self>, id: TransactionId) -> CoreResult<Snapshot> {
        self.create_with(|_| id)
    }

    /// Registers a snapshot of everything committed so far.
    ///
    /// The snapshot is anchored at the highest id registered or committed,
    /// which never goes backwards, so this cannot fail.
    pub(crate) fn create_latest(self: &Arc<Self>) -> Snapshot {
        let _structure = self.structure.shared();
        let mut registry = self.registry.lock();
        let id = registry.last.max(registry.committed);
        self.register(&mut registry, id)
    }

    /// Registers a snapshot at the id `choose` picks given the lowest
    /// acceptable id. `choose` runs with the registry locked, so ids are
    /// registered in the order they are chosen.
    pub(crate) fn create_with(
        self: &Arc<Self>,
        choose: impl FnOnce(TransactionId) -> TransactionId,
    ) -> CoreResult<Snapshot> {
        let _structure = self.structure.shared();
        let mut registry = self.registry.lock();
        let floor = registry.last.max(registry.committed);
        let id = choose(floor);
        if id < floor {
            return Err(CoreError::IllegalSnapshotId {
                requested: id,
                last: floor,
            });
        }
        Ok(self.register(&mut registry, id))
    }

    fn register(self: &Arc<Self>, registry: &mut Registry, id: TransactionId) -> Snapshot {
        *registry.live.entry(id).or_insert(0) += 1;
        registry.last = id;
        self.stats.record_snapshot_open();
        trace!(snapshot = %id, "snapshot registered");
        Snapshot {
            handle: Arc::new(SnapshotHandle {
                id,
                manager: Arc::clone(self),
            }),
        }
    }

    /// Number of distinct live snapshot ids.
    #[must_use]
    pub fn live_snapshots(&self) -> usize {
        self.registry.lock().live.len()
    }

    /// Number of superseded versions currently retained.
    #[must_use]
    pub fn retained_versions(&self) -> usize {
        self.index.read().len()
    }

    /// Prepares the publication of a commit by `tx` writing `keys`.
    ///
    /// Rejects the commit if a live snapshot is anchored at or above `tx`,
    /// then preserves the values the commit replaces for every live snapshot.
    pub(crate) fn prepare_commit<'k>(
        &self,
        tx: TransactionId,
        keys: impl IntoIterator<Item = &'k ObjectKey>,
        _structure: &ExclusiveGuard<'_>,
    ) -> CoreResult<()> {
        let mut keys = keys.into_iter().peekable();
        let (oldest, newest) = {
            let registry = self.registry.lock();
            let oldest = registry.live.keys().next().copied();
            let newest = registry.live.keys().next_back().copied();
            (oldest, newest)
        };
        let Some(oldest) = oldest else {
            return Ok(());
        };
        if let (Some(newest), Some(key)) = (newest, keys.peek()) {
            if newest >= tx {
                return Err(CoreError::SerializationConflict {
                    tx,
                    key: (*key).clone(),
                    current_version: newest,
                });
            }
        }

        let mut superseded = Vec::new();
        for key in keys {
            let previous = match self.writeback.pending_write(key) {
                Some(PendingEntry::Write { record, .. }) => Some(record),
                Some(PendingEntry::Delete { .. }) => None,
                None => self.store.read_object(key)?,
            };
            // An absent value needs no entry: the new version is hidden from
            // older snapshots by the pending and store layers.
            if let Some(previous) = previous {
                let lower = previous.version().max(oldest);
                superseded.push((
                    SnapshotKey::new(key.clone(), lower),
                    SnapshotEntry {
                        value: previous,
                        upper: tx,
                    },
                ));
            }
        }
        if !superseded.is_empty() {
            let mut index = self.index.write();
            Arc::make_mut(&mut index).extend(superseded);
        }
        Ok(())
    }

    /// Records that `tx` has been published.
    pub(crate) fn note_committed(&self, tx: TransactionId, _structure: &ExclusiveGuard<'_>) {
        let mut registry = self.registry.lock();
        registry.committed = registry.committed.max(tx);
    }

    /// Raises the committed watermark, used after recovering an existing store.
    pub(crate) fn recover_committed(&self, tx: TransactionId) {
        let mut registry = self.registry.lock();
        registry.committed = registry.committed.max(tx);
        registry.last = registry.last.max(tx);
    }

    fn release(&self, id: TransactionId) {
        let _structure = self.structure.exclusive();
        let new_oldest = {
            let mut registry = self.registry.lock();
            let was_oldest = registry.live.keys().next() == Some(&id);
            match registry.live.get_mut(&id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    return;
                }
                Some(_) => {
                    registry.live.remove(&id);
                }
                None => return,
            }
            trace!(snapshot = %id, "snapshot released");
            if !was_oldest {
                return;
            }
            registry.live.keys().next().copied()
        };
        self.collect(new_oldest);
    }

    /// Drops index entries no live snapshot can see.
    fn collect(&self, oldest: Option<TransactionId>) {
        let mut index = self.index.write();
        let before = index.len();
        match oldest {
            None => *index = Arc::new(BTreeMap::new()),
            Some(oldest) => {
                let map = Arc::make_mut(&mut index);
                let mut moved = Vec::new();
                map.retain(|key, entry| {
                    if entry.upper <= oldest {
                        false
                    } else if key.lower < oldest {
                        moved.push((SnapshotKey::new(key.key.clone(), oldest), entry.clone()));
                        false
                    } else {
                        true
                    }
                });
                map.extend(moved);
            }
        }
        trace!(
            oldest = ?oldest,
            before,
            after = index.len(),
            "snapshot index collected"
        );
    }

    /// Point read of `key` as seen by snapshot `id`.
    fn read(&self, id: TransactionId, key: &ObjectKey) -> CoreResult<Option<VersionedRecord>> {
        let _structure = self.structure.shared();
        if let Some(record) = visible_in(&self.index.read(), id, key) {
            return Ok(Some(record));
        }
        match self.writeback.pending_write(key) {
            Some(PendingEntry::Write { record, .. }) => Ok((record.version() <= id).then_some(record)),
            Some(PendingEntry::Delete { .. }) => Ok(None),
            None => Ok(self
                .store
                .read_object(key)?
                .filter(|record| record.version() <= id)),
        }
    }

    /// Opens the merged layers for snapshot `id`. The caller holds the structure lock.
    fn open_layers(
        &self,
        id: TransactionId,
        kind: Option<TypeId>,
        start: IteratorStart,
        key: &ObjectKey,
    ) -> CoreResult<BoxedCursor<ObjectKey, VersionedRecord>> {
        let index = self.index.read().clone();
        let pending = self.writeback.pending_view();
        let stored = self.store.cursor(start, key)?;

        let sources: Vec<BoxedCursor<ObjectKey, MaybeTombstone<VersionedRecord>>> = vec![
            Box::new(SnapshotIndexCursor::new(index, id, start, key)),
            Box::new(MappingCursor::new(
                MapCursor::new(pending, start, key),
                move |_: &ObjectKey, entry: PendingEntry| {
                    Ok(match entry {
                        PendingEntry::Write { record, .. } => visible_at(id, record),
                        PendingEntry::Delete { .. } => MaybeTombstone::Tombstone,
                    })
                },
            )),
            Box::new(MappingCursor::new(stored, move |_: &ObjectKey, record: VersionedRecord| {
                Ok(visible_at(id, record))
            })),
        ];
        let merged = TombstoneMergingCursor::new("snapshot", start, key, sources)?;

        let Some(kind) = kind else {
            return Ok(Box::new(merged));
        };
        let decoded = MappingCursor::new(merged, |_: &ObjectKey, record: VersionedRecord| {
            record.record().map_err(CursorError::source_failure)?;
            Ok(record)
        });
        Ok(Box::new(TypePredicateCursor::with_kind(decoded, start, key, kind)?))
    }
}

fn visible_at(id: TransactionId, record: VersionedRecord) -> MaybeTombstone<VersionedRecord> {
    if record.version() <= id {
        MaybeTombstone::Data(record)
    } else {
        MaybeTombstone::Tombstone
    }
}

impl fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("registry", &*self.registry.lock())
            .field("retained_versions", &self.retained_versions())
            .finish_non_exhaustive()
    }
}

/// Keeps one snapshot registration alive.
struct SnapshotHandle {
    id: TransactionId,
    manager: Arc<SnapshotManager>,
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

/// A consistent read view anchored at a transaction id.
///
/// The registration is released when the snapshot and every cursor opened
/// from it are dropped. Clones share the registration.
#[derive(Clone)]
pub struct Snapshot {
    handle: Arc<SnapshotHandle>,
}

impl Snapshot {
    /// The id the snapshot is anchored at.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.handle.id
    }

    /// Reads `key` as of this snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub fn read(&self, key: &ObjectKey) -> CoreResult<Option<VersionedRecord>> {
        self.handle.manager.read(self.handle.id, key)
    }

    /// Reads `key` as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] if the record is of another kind.
    pub fn get<T: Record>(&self, key: &ObjectKey) -> CoreResult<Option<Arc<T>>> {
        self.read(key)?
            .map(|record| downcast_record(record.record()?))
            .transpose()
    }

    /// Opens a forward cursor over the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be opened.
    pub fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> CoreResult<SnapshotCursor> {
        self.open(None, start, key)
    }

    /// Opens a forward cursor over the records of type `T` only.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be opened.
    pub fn cursor_of<T: Record>(&self, start: IteratorStart, key: &ObjectKey) -> CoreResult<SnapshotCursor> {
        self.open(Some(TypeId::of::<T>()), start, key)
    }

    fn open(&self, kind: Option<TypeId>, start: IteratorStart, key: &ObjectKey) -> CoreResult<SnapshotCursor> {
        let view = Arc::new(SnapshotView {
            handle: Arc::clone(&self.handle),
            kind,
        });
        let policy = self.handle.manager.refresh_policy;
        Ok(RefreshingCursor::new("snapshot", view, start, key.clone(), policy)?)
    }

    /// Collects every record with a key at or after `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be read.
    pub fn scan_from(&self, key: &ObjectKey) -> CoreResult<Vec<(ObjectKey, VersionedRecord)>> {
        let mut cursor = self.cursor(IteratorStart::Ge, key)?;
        let mut out = Vec::new();
        while let Some(entry) = cursor.next()? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Releases this handle on the snapshot.
    pub fn close(self) {}

    /// Takes the shared side of the structure lock the layers are read under.
    pub(crate) fn lock_shared(&self) -> SharedGuard<'_> {
        self.handle.manager.structure.shared()
    }

    /// Opens the merged, unrefreshed layers. The caller holds the structure lock.
    pub(crate) fn open_layers(
        &self,
        start: IteratorStart,
        key: &ObjectKey,
    ) -> CoreResult<BoxedCursor<ObjectKey, VersionedRecord>> {
        self.handle.manager.open_layers(self.handle.id, None, start, key)
    }

    pub(crate) fn refresh_policy(&self) -> RefreshPolicy {
        self.handle.manager.refresh_policy
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Snapshot").field(&self.handle.id).finish()
    }
}

/// The refreshable source behind a [`SnapshotCursor`].
pub struct SnapshotView {
    handle: Arc<SnapshotHandle>,
    kind: Option<TypeId>,
}

impl RefreshSource<ObjectKey, VersionedRecord> for SnapshotView {
    type Guard<'a> = SharedGuard<'a>;

    fn lock_shared(&self) -> SharedGuard<'_> {
        self.handle.manager.structure.shared()
    }

    fn version(&self, guard: &SharedGuard<'_>) -> u64 {
        **guard
    }

    fn open(
        &self,
        _guard: &SharedGuard<'_>,
        start: IteratorStart,
        key: &ObjectKey,
    ) -> CursorResult<BoxedCursor<ObjectKey, VersionedRecord>> {
        self.handle
            .manager
            .open_layers(self.handle.id, self.kind, start, key)
            .map_err(CursorError::source_failure)
    }
}

impl fmt::Debug for SnapshotView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotView")
            .field("snapshot", &self.handle.id)
            .field("filtered", &self.kind.is_some())
            .finish()
    }
}
