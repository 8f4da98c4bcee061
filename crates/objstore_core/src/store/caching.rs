//! Byte-bounded read cache.

use crate::error::CoreResult;
use crate::record::VersionedRecord;
use crate::stats::StoreStats;
use crate::store::SerializingStore;
use objstore_cursor::{BoxedCursor, IteratorStart};
use objstore_storage::{ObjectKey, TxManifest};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

struct CacheEntry {
    record: VersionedRecord,
    size: usize,
    tick: u64,
}

/// LRU bookkeeping: entries by key plus their last-use order.
struct Lru {
    entries: HashMap<ObjectKey, CacheEntry>,
    order: BTreeMap<u64, ObjectKey>,
    tick: u64,
    size: usize,
    limit: usize,
    /// Bumped on every manifest commit; a miss filled from the backend is
    /// only cached if no commit happened in between.
    generation: u64,
}

impl Lru {
    fn new(limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            size: 0,
            limit,
            generation: 0,
        }
    }

    fn get(&mut self, key: &ObjectKey) -> Option<VersionedRecord> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&entry.tick);
        entry.tick = tick;
        self.order.insert(tick, key.clone());
        Some(entry.record.clone())
    }

    fn insert(&mut self, key: ObjectKey, record: VersionedRecord) {
        self.remove(&key);
        let size = record.size_estimate();
        if size > self.limit {
            return;
        }
        self.tick += 1;
        self.order.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                record,
                size,
                tick: self.tick,
            },
        );
        self.size += size;
        while self.size > self.limit {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&oldest) {
                self.size -= evicted.size;
                trace!(key = %oldest, size = evicted.size, "evicted cached record");
            }
        }
    }

    fn remove(&mut self, key: &ObjectKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.order.remove(&entry.tick);
            self.size -= entry.size;
        }
    }
}

/// Caches point reads of a [`SerializingStore`].
///
/// The cache is updated together with every manifest commit, so a cached
/// record is always the committed one. Cursors bypass the cache.
pub struct CachingStore {
    inner: SerializingStore,
    lru: Mutex<Lru>,
    stats: Arc<StoreStats>,
}

impl CachingStore {
    /// Creates a cache holding at most `limit` bytes of records.
    pub fn new(inner: SerializingStore, limit: usize, stats: Arc<StoreStats>) -> Self {
        Self {
            inner,
            lru: Mutex::new(Lru::new(limit)),
            stats,
        }
    }

    /// Returns the underlying serializing store.
    pub fn inner(&self) -> &SerializingStore {
        &self.inner
    }

    /// Reads the committed record under `key`, from cache when possible.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails.
    pub fn read_object(&self, key: &ObjectKey) -> CoreResult<Option<VersionedRecord>> {
        let generation = {
            let mut lru = self.lru.lock();
            if let Some(record) = lru.get(key) {
                self.stats.record_cache_hit();
                return Ok(Some(record));
            }
            lru.generation
        };
        self.stats.record_cache_miss();

        let record = self.inner.read_object(key)?;
        if let Some(record) = &record {
            let mut lru = self.lru.lock();
            if lru.generation == generation {
                lru.insert(key.clone(), record.clone());
            }
        }
        Ok(record)
    }

    /// Opens an uncached cursor over committed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot open a cursor.
    pub fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> CoreResult<BoxedCursor<ObjectKey, VersionedRecord>> {
        self.inner.cursor(start, key)
    }

    /// Stages a record write.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or staging fails.
    pub fn write_object(&self, key: &ObjectKey, record: &VersionedRecord) -> CoreResult<()> {
        self.inner.write_object(key, record)
    }

    /// Commits a manifest and brings the cache in line with it.
    ///
    /// `written` holds the records the manifest publishes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the manifest; the cache is
    /// left untouched in that case.
    pub fn commit(&self, manifest: &TxManifest, written: &[(ObjectKey, VersionedRecord)]) -> CoreResult<()> {
        self.inner.commit_manifest(manifest)?;

        let mut lru = self.lru.lock();
        lru.generation += 1;
        for key in &manifest.deleted {
            lru.remove(key);
        }
        for (key, record) in written {
            lru.insert(key.clone(), record.clone());
        }
        Ok(())
    }

    /// Returns the number of cached records and their total size.
    pub fn usage(&self) -> (usize, usize) {
        let lru = self.lru.lock();
        (lru.entries.len(), lru.size)
    }
}

impl fmt::Debug for CachingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (entries, size) = self.usage();
        f.debug_struct("CachingStore")
            .field("entries", &entries)
            .field("size", &size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{serializer, value_of, Item};
    use crate::types::TransactionId;
    use objstore_storage::InMemoryStore;

    fn cache(limit: usize) -> CachingStore {
        let inner = SerializingStore::new(Arc::new(InMemoryStore::new()), serializer());
        CachingStore::new(inner, limit, Arc::new(StoreStats::new()))
    }

    fn commit(cache: &CachingStore, version: u64, name: &str, value: i64) {
        let key = ObjectKey::new(name);
        let record = VersionedRecord::new(TransactionId::new(version), Item::new(name, value));
        cache.write_object(&key, &record).unwrap();
        cache
            .commit(&TxManifest::new(vec![key.clone()], vec![]), &[(key, record)])
            .unwrap();
    }

    #[test]
    fn commit_populates_cache() {
        let cache = cache(1024);
        commit(&cache, 1, "a", 5);

        let read = cache.read_object(&ObjectKey::new("a")).unwrap().unwrap();
        assert_eq!(value_of(&read.record().unwrap()), 5);
        assert_eq!(cache.stats.cache_hits(), 1);
        assert_eq!(cache.stats.cache_misses(), 0);
    }

    #[test]
    fn miss_is_filled_from_backend() {
        let cache = cache(1024);
        commit(&cache, 1, "a", 5);
        cache.lru.lock().remove(&ObjectKey::new("a"));

        assert!(cache.read_object(&ObjectKey::new("a")).unwrap().is_some());
        assert!(cache.read_object(&ObjectKey::new("a")).unwrap().is_some());
        assert_eq!(cache.stats.cache_misses(), 1);
        assert_eq!(cache.stats.cache_hits(), 1);
    }

    #[test]
    fn missing_key_is_not_cached() {
        let cache = cache(1024);
        assert!(cache.read_object(&ObjectKey::new("nope")).unwrap().is_none());
        assert_eq!(cache.usage(), (0, 0));
    }

    #[test]
    fn delete_evicts_entry() {
        let cache = cache(1024);
        commit(&cache, 1, "a", 5);
        cache
            .commit(&TxManifest::new(vec![], vec![ObjectKey::new("a")]), &[])
            .unwrap();
        assert!(cache.read_object(&ObjectKey::new("a")).unwrap().is_none());
    }

    #[test]
    fn least_recently_used_is_evicted_first() {
        // Each record is 9 bytes: one-character name plus 8.
        let cache = cache(20);
        commit(&cache, 1, "a", 1);
        commit(&cache, 2, "b", 2);
        cache.read_object(&ObjectKey::new("a")).unwrap();
        commit(&cache, 3, "c", 3);

        let lru = cache.lru.lock();
        assert!(lru.entries.contains_key(&ObjectKey::new("a")));
        assert!(!lru.entries.contains_key(&ObjectKey::new("b")));
        assert!(lru.entries.contains_key(&ObjectKey::new("c")));
        assert_eq!(lru.size, 18);
    }

    #[test]
    fn oversized_record_is_not_cached() {
        let cache = cache(4);
        commit(&cache, 1, "a", 1);
        assert_eq!(cache.usage(), (0, 0));
        assert!(cache.read_object(&ObjectKey::new("a")).unwrap().is_some());
    }
}
