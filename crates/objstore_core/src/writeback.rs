//! Write-back durability pipeline.
//!
//! Committed writes are grouped into bundles. A bundle is *allocated* with
//! [`WritebackPipeline::create_bundle`], filled while the committing
//! transaction still holds its key locks, then *published*: its entries
//! become visible to readers through the pending map and the bundle is
//! marked ready. A single flusher thread drains ready bundles strictly in
//! ascending id order, merging runs of consecutive ready bundles into one
//! batch, writes the batch's records in parallel on a worker pool, and
//! commits one manifest to the backend.
//!
//! A bundle that is still being filled blocks every later bundle, so
//! durability order always matches bundle order.
//!
//! # Backpressure
//!
//! When the unflushed bundles exceed `writeback_size_limit` bytes,
//! `create_bundle` waits for the flusher, for at most `backpressure_wait`.
//! After that it forces a flush of everything queued and waits up to
//! `forced_flush_timeout` for it to become durable, failing with
//! [`CoreError::WritebackStalled`] if the backend does not keep up.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::record::VersionedRecord;
use crate::stats::StoreStats;
use crate::store::CachingStore;
use crate::structure::{ExclusiveGuard, StructureLock};
use crate::types::BundleId;
use objstore_storage::{ObjectKey, TxManifest};
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Size accounted for a queued delete.
pub const DELETE_SIZE_ESTIMATE: usize = 64;

/// A committed mutation that is not durable yet.
#[derive(Debug, Clone)]
pub enum PendingEntry {
    /// A record waiting to be written.
    Write {
        /// The committed record.
        record: VersionedRecord,
        /// The bundle carrying it.
        bundle: BundleId,
    },
    /// A delete waiting to be applied.
    Delete {
        /// The bundle carrying it.
        bundle: BundleId,
    },
}

impl PendingEntry {
    /// The bundle carrying this entry.
    #[must_use]
    pub const fn bundle(&self) -> BundleId {
        match self {
            Self::Write { bundle, .. } | Self::Delete { bundle } => *bundle,
        }
    }

    /// The record, or `None` for a delete.
    #[must_use]
    pub const fn record(&self) -> Option<&VersionedRecord> {
        match self {
            Self::Write { record, .. } => Some(record),
            Self::Delete { .. } => None,
        }
    }
}

/// One mutation inside a bundle.
#[derive(Debug, Clone)]
pub(crate) enum BundleEntry {
    Write(VersionedRecord),
    Delete,
}

impl BundleEntry {
    fn size_estimate(&self) -> usize {
        match self {
            Self::Write(record) => record.size_estimate(),
            Self::Delete => DELETE_SIZE_ESTIMATE,
        }
    }
}

/// An allocated bundle, owned by the committer filling it.
#[derive(Debug)]
#[must_use = "a bundle must be committed or dropped, or it blocks every later bundle"]
pub struct Bundle {
    id: BundleId,
}

impl Bundle {
    /// The bundle id.
    #[must_use]
    pub const fn id(&self) -> BundleId {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Preparing,
    Ready,
    Flushing,
}

struct Slot {
    id: BundleId,
    /// Newest bundle merged into this slot; `id` unless a failed batch was
    /// put back as one slot.
    last: BundleId,
    state: SlotState,
    entries: BTreeMap<ObjectKey, BundleEntry>,
    size: usize,
}

type FlushCallback = Box<dyn FnOnce() + Send>;

struct Queue {
    /// Unflushed bundles in ascending id order.
    slots: VecDeque<Slot>,
    next_id: u64,
    /// Sum of the sizes of all slots.
    size: usize,
    accepting: bool,
    callbacks: BTreeMap<BundleId, Vec<FlushCallback>>,
}

impl Queue {
    /// Every bundle up to and including this id is durable or was dropped.
    fn durable_upto(&self) -> BundleId {
        self.slots
            .front()
            .map_or(BundleId::new(self.next_id - 1), |slot| BundleId::new(slot.id.as_u64() - 1))
    }

    fn newest(&self) -> BundleId {
        BundleId::new(self.next_id - 1)
    }

    fn slot_mut(&mut self, id: BundleId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|slot| slot.id == id)
    }

    fn due_callbacks(&mut self) -> Vec<FlushCallback> {
        let rest = self.callbacks.split_off(&self.durable_upto().next());
        std::mem::replace(&mut self.callbacks, rest)
            .into_values()
            .flatten()
            .collect()
    }

    /// Takes the run of ready bundles at the head of the queue.
    fn take_batch(&mut self) -> Batch {
        let mut batch = Batch {
            first: BundleId::default(),
            last: BundleId::default(),
            bundles: 0,
            accounted: 0,
            entries: BTreeMap::new(),
        };
        for slot in self.slots.iter_mut() {
            if slot.state != SlotState::Ready {
                break;
            }
            if batch.bundles == 0 {
                batch.first = slot.id;
            }
            slot.state = SlotState::Flushing;
            batch.last = slot.last;
            batch.bundles += 1;
            batch.accounted += slot.size;
            batch.entries.append(&mut slot.entries);
        }
        batch
    }
}

/// Merged entries of consecutive bundles, flushed together.
struct Batch {
    first: BundleId,
    last: BundleId,
    bundles: usize,
    /// Size charged to the queue for the merged bundles.
    accounted: usize,
    entries: BTreeMap<ObjectKey, BundleEntry>,
}

struct Shared {
    store: Arc<CachingStore>,
    structure: Arc<StructureLock>,
    queue: Mutex<Queue>,
    /// Signaled when a bundle becomes ready or shutdown starts.
    work: Condvar,
    /// Signaled whenever the durable watermark or the queue size moves.
    flushed: Condvar,
    pending: RwLock<Arc<BTreeMap<ObjectKey, PendingEntry>>>,
    pool: rayon::ThreadPool,
    config: Config,
    stats: Arc<StoreStats>,
}

impl Shared {
    fn run_flusher(&self) {
        loop {
            let batch = {
                let mut queue = self.queue.lock();
                loop {
                    if queue
                        .slots
                        .front()
                        .is_some_and(|slot| slot.state == SlotState::Ready)
                    {
                        break;
                    }
                    if !queue.accepting && queue.slots.is_empty() {
                        debug!("write-back flusher stopped");
                        return;
                    }
                    self.work.wait(&mut queue);
                }
                queue.take_batch()
            };

            match self.flush(&batch) {
                Ok(()) => self.finish(batch),
                Err(e) => {
                    error!(
                        error = %e,
                        first = %batch.first,
                        last = %batch.last,
                        "write-back flush failed"
                    );
                    self.stats.record_flush_failure();
                    if !self.requeue(batch) {
                        return;
                    }
                    thread::sleep(self.config.flush_retry_delay);
                }
            }
        }
    }

    fn flush(&self, batch: &Batch) -> CoreResult<()> {
        let started = Instant::now();
        let writes: Vec<(&ObjectKey, &VersionedRecord)> = batch
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                BundleEntry::Write(record) => Some((key, record)),
                BundleEntry::Delete => None,
            })
            .collect();
        let deleted: Vec<ObjectKey> = batch
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, BundleEntry::Delete))
            .map(|(key, _)| key.clone())
            .collect();
        trace!(
            first = %batch.first,
            last = %batch.last,
            writes = writes.len(),
            deletes = deleted.len(),
            "flushing bundles"
        );

        // The pool join is the barrier between record writes and the manifest.
        self.pool.install(|| {
            writes
                .par_iter()
                .try_for_each(|(key, record)| self.store.write_object(key, record))
        })?;

        let manifest = TxManifest::new(writes.iter().map(|(key, _)| (*key).clone()).collect(), deleted);
        let published: Vec<(ObjectKey, VersionedRecord)> = writes
            .iter()
            .map(|(key, record)| ((*key).clone(), (*record).clone()))
            .collect();

        // Readers keep finding these keys in the pending map until the swap
        // below, so the backend commit needs no structure lock.
        self.store.commit(&manifest, &published)?;

        let mut structure = self.structure.exclusive();
        {
            let mut pending = self.pending.write();
            let map = Arc::make_mut(&mut pending);
            for key in batch.entries.keys() {
                if map.get(key).is_some_and(|entry| entry.bundle() <= batch.last) {
                    map.remove(key);
                }
            }
        }
        structure.bump();
        drop(structure);

        debug!(
            first = %batch.first,
            last = %batch.last,
            objects = batch.entries.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "bundles flushed"
        );
        Ok(())
    }

    fn finish(&self, batch: Batch) {
        let callbacks = {
            let mut queue = self.queue.lock();
            for _ in 0..batch.bundles {
                queue.slots.pop_front();
            }
            queue.size -= batch.accounted;
            self.stats
                .record_flush(batch.bundles as u64, batch.entries.len() as u64);
            queue.due_callbacks()
        };
        self.flushed.notify_all();
        for callback in callbacks {
            callback();
        }
    }

    /// Puts a failed batch back at the head of the queue as one bundle.
    ///
    /// Returns false if the pipeline is shutting down and the batch was
    /// abandoned instead.
    fn requeue(&self, batch: Batch) -> bool {
        let mut queue = self.queue.lock();
        for _ in 0..batch.bundles {
            queue.slots.pop_front();
        }
        queue.size -= batch.accounted;

        if !queue.accepting {
            error!(
                first = %batch.first,
                last = %batch.last,
                objects = batch.entries.len(),
                "abandoning unflushed bundles at shutdown"
            );
            queue.slots.clear();
            queue.size = 0;
            let callbacks = queue.due_callbacks();
            drop(queue);
            self.flushed.notify_all();
            drop(callbacks);
            return false;
        }

        let size = batch.entries.values().map(BundleEntry::size_estimate).sum();
        queue.size += size;
        queue.slots.push_front(Slot {
            id: batch.first,
            last: batch.last,
            state: SlotState::Ready,
            entries: batch.entries,
            size,
        });
        true
    }
}

/// The asynchronous durability pipeline.
pub struct WritebackPipeline {
    shared: Arc<Shared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl WritebackPipeline {
    /// Starts the worker pool and the flusher thread.
    pub(crate) fn start(
        store: Arc<CachingStore>,
        structure: Arc<StructureLock>,
        config: &Config,
        stats: Arc<StoreStats>,
    ) -> CoreResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.writeback_workers.max(1))
            .thread_name(|i| format!("objstore-writeback-{i}"))
            .build()
            .map_err(|e| CoreError::Io(std::io::Error::other(e)))?;

        let shared = Arc::new(Shared {
            store,
            structure,
            queue: Mutex::new(Queue {
                slots: VecDeque::new(),
                next_id: 1,
                size: 0,
                accepting: true,
                callbacks: BTreeMap::new(),
            }),
            work: Condvar::new(),
            flushed: Condvar::new(),
            pending: RwLock::new(Arc::new(BTreeMap::new())),
            pool,
            config: config.clone(),
            stats,
        });

        let flusher_shared = Arc::clone(&shared);
        let flusher = thread::Builder::new()
            .name("objstore-flusher".to_string())
            .spawn(move || flusher_shared.run_flusher())?;

        Ok(Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Allocates the next bundle, waiting out backpressure first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] once shutdown has started, and
    /// [`CoreError::WritebackStalled`] if a forced flush outlives
    /// `forced_flush_timeout`.
    pub fn create_bundle(&self) -> CoreResult<Bundle> {
        let shared = &self.shared;
        let limit = shared.config.writeback_size_limit;
        let mut queue = shared.queue.lock();
        if !queue.accepting {
            return Err(CoreError::ShuttingDown);
        }

        if queue.size > limit {
            shared.stats.record_backpressure_wait();
            let started = Instant::now();
            let deadline = started + shared.config.backpressure_wait;
            while queue.size > limit && queue.accepting {
                if shared.flushed.wait_until(&mut queue, deadline).timed_out() {
                    break;
                }
            }
            if queue.size > limit && queue.accepting {
                let target = queue.newest();
                warn!(
                    queued = queue.size,
                    limit,
                    target = %target,
                    "backpressure wait expired, forcing flush"
                );
                shared.work.notify_one();
                let deadline = Instant::now() + shared.config.forced_flush_timeout;
                while queue.durable_upto() < target && queue.accepting {
                    if shared.flushed.wait_until(&mut queue, deadline).timed_out() {
                        break;
                    }
                }
                if queue.durable_upto() < target && queue.accepting {
                    error!(
                        queued = queue.size,
                        limit,
                        durable = %queue.durable_upto(),
                        target = %target,
                        "forced flush timed out"
                    );
                    return Err(CoreError::WritebackStalled {
                        queued: queue.size,
                        limit,
                    });
                }
            }
            debug!(
                waited_ms = started.elapsed().as_millis() as u64,
                queued = queue.size,
                "bundle creation waited for write-back"
            );
            if !queue.accepting {
                return Err(CoreError::ShuttingDown);
            }
        }

        let id = BundleId::new(queue.next_id);
        queue.next_id += 1;
        queue.slots.push_back(Slot {
            id,
            last: id,
            state: SlotState::Preparing,
            entries: BTreeMap::new(),
            size: 0,
        });
        trace!(bundle = %id, "bundle created");
        Ok(Bundle { id })
    }

    pub(crate) fn stage(&self, bundle: &Bundle, key: ObjectKey, entry: BundleEntry) -> CoreResult<()> {
        let mut queue = self.shared.queue.lock();
        let added = entry.size_estimate();
        let slot = queue
            .slot_mut(bundle.id)
            .filter(|slot| slot.state == SlotState::Preparing)
            .ok_or_else(|| CoreError::consistency(format!("{} is not being prepared", bundle.id)))?;
        let removed = slot
            .entries
            .insert(key, entry)
            .map_or(0, |old| old.size_estimate());
        slot.size = slot.size + added - removed;
        queue.size = queue.size + added - removed;
        Ok(())
    }

    /// Adds a record write to a bundle being prepared.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle was already published or dropped.
    pub fn write(&self, bundle: &Bundle, key: ObjectKey, record: VersionedRecord) -> CoreResult<()> {
        self.stage(bundle, key, BundleEntry::Write(record))
    }

    /// Adds a delete to a bundle being prepared.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle was already published or dropped.
    pub fn delete(&self, bundle: &Bundle, key: ObjectKey) -> CoreResult<()> {
        self.stage(bundle, key, BundleEntry::Delete)
    }

    /// Publishes a bundle and hands it to the flusher.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle was already published or dropped.
    pub fn commit_bundle(&self, bundle: Bundle) -> CoreResult<()> {
        let mut structure = self.shared.structure.exclusive();
        self.publish(bundle, &mut structure)
    }

    /// Publishes a bundle under an exclusive structure lock the caller holds.
    pub(crate) fn publish(&self, bundle: Bundle, structure: &mut ExclusiveGuard<'_>) -> CoreResult<()> {
        let mut queue = self.shared.queue.lock();
        let slot = queue
            .slot_mut(bundle.id)
            .filter(|slot| slot.state == SlotState::Preparing)
            .ok_or_else(|| CoreError::consistency(format!("{} is not being prepared", bundle.id)))?;
        {
            let mut pending = self.shared.pending.write();
            let map = Arc::make_mut(&mut pending);
            for (key, entry) in &slot.entries {
                let pending_entry = match entry {
                    BundleEntry::Write(record) => PendingEntry::Write {
                        record: record.clone(),
                        bundle: bundle.id,
                    },
                    BundleEntry::Delete => PendingEntry::Delete { bundle: bundle.id },
                };
                map.insert(key.clone(), pending_entry);
            }
        }
        slot.state = SlotState::Ready;
        structure.bump();
        drop(queue);
        self.shared.work.notify_one();
        trace!(bundle = %bundle.id, "bundle ready");
        Ok(())
    }

    /// Abandons a bundle that was never published.
    pub fn drop_bundle(&self, bundle: Bundle) {
        let callbacks = {
            let mut queue = self.shared.queue.lock();
            let Some(index) = queue.slots.iter().position(|slot| slot.id == bundle.id) else {
                return;
            };
            if queue.slots[index].state != SlotState::Preparing {
                warn!(bundle = %bundle.id, "refusing to drop a published bundle");
                return;
            }
            if let Some(slot) = queue.slots.remove(index) {
                queue.size -= slot.size;
            }
            queue.due_callbacks()
        };
        trace!(bundle = %bundle.id, "bundle dropped");
        self.shared.work.notify_one();
        self.shared.flushed.notify_all();
        for callback in callbacks {
            callback();
        }
    }

    /// Returns the committed but not yet durable mutation of `key`, if any.
    #[must_use]
    pub fn pending_write(&self, key: &ObjectKey) -> Option<PendingEntry> {
        self.shared.pending.read().get(key).cloned()
    }

    /// Returns the current pending map.
    pub(crate) fn pending_view(&self) -> Arc<BTreeMap<ObjectKey, PendingEntry>> {
        Arc::clone(&self.shared.pending.read())
    }

    /// Returns the highest id up to which every bundle is durable.
    #[must_use]
    pub fn durable_upto(&self) -> BundleId {
        self.shared.queue.lock().durable_upto()
    }

    /// Blocks until bundle `id` and every bundle before it are durable.
    ///
    /// An id that was never allocated returns at once with a warning.
    pub fn fence(&self, id: BundleId) {
        let mut queue = self.shared.queue.lock();
        if id > queue.newest() {
            warn!(bundle = %id, newest = %queue.newest(), "fence on a bundle that was never allocated");
            return;
        }
        while queue.durable_upto() < id {
            self.shared.flushed.wait(&mut queue);
        }
    }

    /// Runs `callback` once bundle `id` is durable, immediately if it already is.
    ///
    /// Callbacks registered for pending bundles run on the flusher thread.
    ///
    /// An id that was never allocated runs `callback` at once with a warning.
    pub fn async_fence(&self, id: BundleId, callback: impl FnOnce() + Send + 'static) {
        let mut queue = self.shared.queue.lock();
        if id > queue.newest() {
            warn!(bundle = %id, newest = %queue.newest(), "async fence on a bundle that was never allocated");
        }
        if queue.durable_upto() >= id || id > queue.newest() {
            drop(queue);
            callback();
            return;
        }
        queue.callbacks.entry(id).or_default().push(Box::new(callback));
    }

    /// Blocks until every bundle allocated so far is durable.
    pub fn flush_all(&self) {
        let newest = self.shared.queue.lock().newest();
        self.fence(newest);
    }

    /// Stops accepting bundles, drains the queue and joins the flusher.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if !queue.accepting {
                return;
            }
            queue.accepting = false;
        }
        self.shared.work.notify_all();
        self.shared.flushed.notify_all();

        if let Some(handle) = self.flusher.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("write-back flusher panicked");
            }
        }
        debug!("write-back pipeline shut down");
    }

    pub(crate) fn structure(&self) -> &Arc<StructureLock> {
        &self.shared.structure
    }
}

impl Drop for WritebackPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for WritebackPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("WritebackPipeline")
            .field("queued_bundles", &queue.slots.len())
            .field("queued_size", &queue.size)
            .field("durable_upto", &queue.durable_upto())
            .field("accepting", &queue.accepting)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{serializer, value_of, Item};
    use crate::store::SerializingStore;
    use crate::types::TransactionId;
    use bytes::Bytes;
    use objstore_cursor::{BoxedCursor, IteratorStart};
    use objstore_storage::{InMemoryStore, PersistentStore, StorageError, StorageResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    /// Fails the first `failures` manifest commits.
    struct FlakyStore {
        inner: InMemoryStore,
        failures: AtomicUsize,
    }

    impl PersistentStore for FlakyStore {
        fn find_all_objects(&self) -> StorageResult<Vec<ObjectKey>> {
            self.inner.find_all_objects()
        }

        fn read_object(&self, key: &ObjectKey) -> StorageResult<Option<Bytes>> {
            self.inner.read_object(key)
        }

        fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> StorageResult<BoxedCursor<ObjectKey, Bytes>> {
            self.inner.cursor(start, key)
        }

        fn write_object(&self, key: &ObjectKey, data: Bytes) -> StorageResult<()> {
            self.inner.write_object(key, data)
        }

        fn commit_manifest(&self, manifest: &TxManifest) -> StorageResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Io(std::io::Error::other("disk unplugged")));
            }
            self.inner.commit_manifest(manifest)
        }
    }

    struct Harness {
        pipeline: WritebackPipeline,
        store: Arc<CachingStore>,
        stats: Arc<StoreStats>,
    }

    fn harness_with(backend: Arc<dyn PersistentStore>, config: Config) -> Harness {
        let stats = Arc::new(StoreStats::new());
        let store = Arc::new(CachingStore::new(
            SerializingStore::new(backend, serializer()),
            1024 * 1024,
            Arc::clone(&stats),
        ));
        let pipeline = WritebackPipeline::start(
            Arc::clone(&store),
            Arc::new(StructureLock::new()),
            &config,
            Arc::clone(&stats),
        )
        .unwrap();
        Harness { pipeline, store, stats }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryStore::new()), Config::new().writeback_workers(2))
    }

    fn flaky(failures: usize, config: Config) -> Harness {
        harness_with(
            Arc::new(FlakyStore {
                inner: InMemoryStore::new(),
                failures: AtomicUsize::new(failures),
            }),
            config,
        )
    }

    fn record(version: u64, name: &str, value: i64) -> VersionedRecord {
        VersionedRecord::new(TransactionId::new(version), Item::new(name, value))
    }

    fn stored_value(h: &Harness, name: &str) -> Option<i64> {
        h.store
            .read_object(&ObjectKey::new(name))
            .unwrap()
            .map(|r| value_of(&r.record().unwrap()))
    }

    #[test]
    fn published_bundle_is_pending_until_durable() {
        let h = harness();
        let bundle = h.pipeline.create_bundle().unwrap();
        let id = bundle.id();
        h.pipeline
            .write(&bundle, ObjectKey::new("a"), record(1, "a", 10))
            .unwrap();
        assert!(h.pipeline.pending_write(&ObjectKey::new("a")).is_none());

        h.pipeline.commit_bundle(bundle).unwrap();
        h.pipeline.fence(id);

        assert!(h.pipeline.pending_write(&ObjectKey::new("a")).is_none());
        assert_eq!(stored_value(&h, "a"), Some(10));
        assert_eq!(h.pipeline.durable_upto(), id);
        assert_eq!(h.stats.bundles_flushed(), 1);
    }

    #[test]
    fn bundles_flush_in_id_order() {
        let h = harness();
        let first = h.pipeline.create_bundle().unwrap();
        let second = h.pipeline.create_bundle().unwrap();
        let second_id = second.id();
        h.pipeline
            .write(&first, ObjectKey::new("a"), record(1, "a", 1))
            .unwrap();
        h.pipeline
            .write(&second, ObjectKey::new("b"), record(2, "b", 2))
            .unwrap();

        h.pipeline.commit_bundle(second).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(h.pipeline.durable_upto(), BundleId::new(0));
        assert!(h.pipeline.pending_write(&ObjectKey::new("b")).is_some());
        assert_eq!(stored_value(&h, "b"), None);

        h.pipeline.commit_bundle(first).unwrap();
        h.pipeline.fence(second_id);
        assert_eq!(stored_value(&h, "a"), Some(1));
        assert_eq!(stored_value(&h, "b"), Some(2));
    }

    #[test]
    fn newer_bundle_wins_for_same_key() {
        let h = harness();
        let first = h.pipeline.create_bundle().unwrap();
        let second = h.pipeline.create_bundle().unwrap();
        let last = second.id();
        h.pipeline
            .write(&first, ObjectKey::new("k"), record(1, "k", 1))
            .unwrap();
        h.pipeline
            .write(&second, ObjectKey::new("k"), record(2, "k", 2))
            .unwrap();
        h.pipeline.commit_bundle(first).unwrap();
        h.pipeline.commit_bundle(second).unwrap();
        h.pipeline.fence(last);

        let stored = h.store.read_object(&ObjectKey::new("k")).unwrap().unwrap();
        assert_eq!(stored.version(), TransactionId::new(2));
    }

    #[test]
    fn pending_delete_hides_then_removes() {
        let h = harness();
        let put = h.pipeline.create_bundle().unwrap();
        h.pipeline
            .write(&put, ObjectKey::new("a"), record(1, "a", 1))
            .unwrap();
        h.pipeline.commit_bundle(put).unwrap();
        h.pipeline.flush_all();

        let del = h.pipeline.create_bundle().unwrap();
        let id = del.id();
        h.pipeline.delete(&del, ObjectKey::new("a")).unwrap();
        h.pipeline.commit_bundle(del).unwrap();
        h.pipeline.fence(id);

        assert_eq!(stored_value(&h, "a"), None);
    }

    #[test]
    fn dropped_bundle_does_not_block_later_ones() {
        let h = harness();
        let abandoned = h.pipeline.create_bundle().unwrap();
        let kept = h.pipeline.create_bundle().unwrap();
        let id = kept.id();
        h.pipeline
            .write(&abandoned, ObjectKey::new("x"), record(1, "x", 1))
            .unwrap();
        h.pipeline
            .write(&kept, ObjectKey::new("y"), record(2, "y", 2))
            .unwrap();

        h.pipeline.drop_bundle(abandoned);
        h.pipeline.commit_bundle(kept).unwrap();
        h.pipeline.fence(id);

        assert_eq!(stored_value(&h, "x"), None);
        assert_eq!(stored_value(&h, "y"), Some(2));
    }

    #[test]
    fn staging_into_published_bundle_fails() {
        let h = harness();
        let bundle = h.pipeline.create_bundle().unwrap();
        let again = Bundle { id: bundle.id() };
        h.pipeline.commit_bundle(bundle).unwrap();
        let err = h
            .pipeline
            .write(&again, ObjectKey::new("late"), record(1, "late", 0))
            .unwrap_err();
        assert!(matches!(err, CoreError::Consistency { .. }));
    }

    #[test]
    fn async_fence_runs_after_flush() {
        let h = harness();
        let bundle = h.pipeline.create_bundle().unwrap();
        let id = bundle.id();
        h.pipeline
            .write(&bundle, ObjectKey::new("a"), record(1, "a", 1))
            .unwrap();

        let (tx, rx) = mpsc::channel();
        h.pipeline.async_fence(id, move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_err());

        h.pipeline.commit_bundle(bundle).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let (tx, rx) = mpsc::channel();
        h.pipeline.async_fence(id, move || tx.send(()).unwrap());
        rx.try_recv().unwrap();
    }

    #[test]
    fn failed_flush_is_retried() {
        let h = flaky(2, Config::new().flush_retry_delay(Duration::from_millis(5)));
        let bundle = h.pipeline.create_bundle().unwrap();
        let id = bundle.id();
        h.pipeline
            .write(&bundle, ObjectKey::new("a"), record(1, "a", 7))
            .unwrap();
        h.pipeline.commit_bundle(bundle).unwrap();
        h.pipeline.fence(id);

        assert_eq!(stored_value(&h, "a"), Some(7));
        assert_eq!(h.stats.flush_failures(), 2);
        assert!(h.pipeline.pending_write(&ObjectKey::new("a")).is_none());
    }

    #[test]
    fn backpressure_waits_for_flusher() {
        let config = Config::new()
            .writeback_size_limit(1)
            .backpressure_wait(Duration::from_millis(10))
            .flush_retry_delay(Duration::from_millis(20));
        let h = flaky(3, config);

        let first = h.pipeline.create_bundle().unwrap();
        let first_id = first.id();
        h.pipeline
            .write(&first, ObjectKey::new("a"), record(1, "a", 1))
            .unwrap();
        h.pipeline.commit_bundle(first).unwrap();

        let second = h.pipeline.create_bundle().unwrap();
        assert!(h.pipeline.durable_upto() >= first_id);
        assert_eq!(h.stats.backpressure_waits(), 1);
        h.pipeline.drop_bundle(second);
    }

    #[test]
    fn failed_merged_flush_is_retried_as_a_whole() {
        let h = flaky(1, Config::new().flush_retry_delay(Duration::from_millis(5)));
        let first = h.pipeline.create_bundle().unwrap();
        let second = h.pipeline.create_bundle().unwrap();
        let last = second.id();
        h.pipeline
            .write(&first, ObjectKey::new("a"), record(1, "a", 1))
            .unwrap();
        h.pipeline
            .write(&second, ObjectKey::new("b"), record(2, "b", 2))
            .unwrap();

        // The second bundle waits behind the first, so both go out as one batch.
        h.pipeline.commit_bundle(second).unwrap();
        h.pipeline.commit_bundle(first).unwrap();
        h.pipeline.fence(last);

        assert_eq!(h.stats.flush_failures(), 1);
        assert_eq!(h.pipeline.durable_upto(), last);
        assert!(h.pipeline.pending_write(&ObjectKey::new("a")).is_none());
        assert!(h.pipeline.pending_write(&ObjectKey::new("b")).is_none());
        assert_eq!(stored_value(&h, "a"), Some(1));
        assert_eq!(stored_value(&h, "b"), Some(2));
    }

    #[test]
    fn backend_commit_proceeds_while_readers_hold_the_structure() {
        let h = harness();
        let bundle = h.pipeline.create_bundle().unwrap();
        let id = bundle.id();
        h.pipeline
            .write(&bundle, ObjectKey::new("a"), record(1, "a", 3))
            .unwrap();
        h.pipeline.commit_bundle(bundle).unwrap();

        let reader = h.pipeline.structure().shared();
        let deadline = Instant::now() + Duration::from_secs(5);
        while stored_value(&h, "a").is_none() {
            assert!(Instant::now() < deadline, "backend commit waited for the reader");
            thread::sleep(Duration::from_millis(1));
        }
        // The pending entry goes only once the reader lets go.
        assert!(h.pipeline.pending_write(&ObjectKey::new("a")).is_some());
        assert!(h.pipeline.durable_upto() < id);
        drop(reader);

        h.pipeline.fence(id);
        assert!(h.pipeline.pending_write(&ObjectKey::new("a")).is_none());
    }

    #[test]
    fn forced_flush_gives_up_after_its_timeout() {
        let config = Config::new()
            .writeback_size_limit(1)
            .backpressure_wait(Duration::from_millis(10))
            .forced_flush_timeout(Duration::from_millis(50))
            .flush_retry_delay(Duration::from_millis(5));
        let h = flaky(usize::MAX, config);

        let first = h.pipeline.create_bundle().unwrap();
        h.pipeline
            .write(&first, ObjectKey::new("a"), record(1, "a", 1))
            .unwrap();
        h.pipeline.commit_bundle(first).unwrap();

        let started = Instant::now();
        let err = h.pipeline.create_bundle().unwrap_err();
        assert!(matches!(err, CoreError::WritebackStalled { limit: 1, .. }), "{err:?}");
        assert!(!err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(h.pipeline.durable_upto(), BundleId::new(0));
    }

    #[test]
    fn fences_past_the_newest_bundle_return_at_once() {
        let h = harness();
        let bundle = h.pipeline.create_bundle().unwrap();
        h.pipeline.fence(BundleId::new(99));

        let (tx, rx) = mpsc::channel();
        h.pipeline.async_fence(BundleId::new(99), move || tx.send(()).unwrap());
        rx.try_recv().unwrap();
        h.pipeline.drop_bundle(bundle);
    }

    #[test]
    fn shutdown_drains_and_rejects_new_bundles() {
        let h = harness();
        for i in 0..10 {
            let bundle = h.pipeline.create_bundle().unwrap();
            let name = format!("k{i}");
            h.pipeline
                .write(&bundle, ObjectKey::new(&name), record(i + 1, &name, i as i64))
                .unwrap();
            h.pipeline.commit_bundle(bundle).unwrap();
        }
        h.pipeline.shutdown();

        for i in 0..10 {
            assert_eq!(stored_value(&h, &format!("k{i}")), Some(i));
        }
        assert!(matches!(h.pipeline.create_bundle(), Err(CoreError::ShuttingDown)));
    }
}
