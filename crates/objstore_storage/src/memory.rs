//! In-memory object store for testing.

use crate::backend::{PersistentStore, TxManifest};
use crate::error::{StorageError, StorageResult};
use crate::key::ObjectKey;
use bytes::Bytes;
use objstore_cursor::{BoxedCursor, IteratorStart, MapCursor};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An in-memory object store.
///
/// Committed objects live in a copy-on-write ordered map, so open cursors
/// keep iterating the map they were opened on while commits proceed.
///
/// This store is suitable for:
/// - Unit tests
/// - Integration tests, including simulated restarts (share the store
///   through an [`Arc`] and reopen the layers above it)
/// - Ephemeral stores that don't need persistence
///
/// # Example
///
/// ```rust
/// use bytes::Bytes;
/// use objstore_storage::{InMemoryStore, ObjectKey, PersistentStore, TxManifest};
///
/// let store = InMemoryStore::new();
/// store.write_object(&ObjectKey::new("a"), Bytes::from_static(b"1")).unwrap();
/// store.commit_manifest(&TxManifest::new(vec![ObjectKey::new("a")], vec![])).unwrap();
/// assert_eq!(store.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    objects: RwLock<Arc<BTreeMap<ObjectKey, Bytes>>>,
    staged: Mutex<HashMap<ObjectKey, Bytes>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with pre-existing committed objects.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_objects(objects: BTreeMap<ObjectKey, Bytes>) -> Self {
        Self {
            objects: RwLock::new(Arc::new(objects)),
            staged: Mutex::default(),
        }
    }

    /// Returns the number of committed objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if nothing is committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Returns the number of staged, uncommitted objects.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }
}

impl PersistentStore for InMemoryStore {
    fn find_all_objects(&self) -> StorageResult<Vec<ObjectKey>> {
        Ok(self.objects.read().keys().cloned().collect())
    }

    fn read_object(&self, key: &ObjectKey) -> StorageResult<Option<Bytes>> {
        Ok(self.objects.read().get(key).cloned())
    }

    fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> StorageResult<BoxedCursor<ObjectKey, Bytes>> {
        let objects = Arc::clone(&self.objects.read());
        Ok(Box::new(MapCursor::new(objects, start, key)))
    }

    fn write_object(&self, key: &ObjectKey, data: Bytes) -> StorageResult<()> {
        self.staged.lock().insert(key.clone(), data);
        Ok(())
    }

    fn commit_manifest(&self, manifest: &TxManifest) -> StorageResult<()> {
        let mut staged = self.staged.lock();
        // Check everything first so a failed commit changes nothing.
        if let Some(missing) = manifest.written.iter().find(|k| !staged.contains_key(*k)) {
            return Err(StorageError::NotStaged {
                key: missing.to_string(),
            });
        }

        let mut objects = self.objects.write();
        let map = Arc::make_mut(&mut objects);
        for key in &manifest.written {
            if let Some(data) = staged.remove(key) {
                map.insert(key.clone(), data);
            }
        }
        for key in &manifest.deleted {
            map.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore_cursor::Cursor;

    fn key(k: &str) -> ObjectKey {
        ObjectKey::new(k)
    }

    fn commit(store: &InMemoryStore, written: &[&str], deleted: &[&str]) {
        for k in written {
            store.write_object(&key(k), Bytes::copy_from_slice(k.as_bytes())).unwrap();
        }
        let manifest = TxManifest::new(written.iter().map(|k| key(k)).collect(), deleted.iter().map(|k| key(k)).collect());
        store.commit_manifest(&manifest).unwrap();
    }

    #[test]
    fn memory_new_is_empty() {
        let store = InMemoryStore::new();
        assert!(store.is_empty());
        assert!(store.find_all_objects().unwrap().is_empty());
    }

    #[test]
    fn memory_staged_objects_are_invisible() {
        let store = InMemoryStore::new();
        store.write_object(&key("a"), Bytes::from_static(b"1")).unwrap();
        assert_eq!(store.staged_len(), 1);
        assert!(store.read_object(&key("a")).unwrap().is_none());
        assert!(store.find_all_objects().unwrap().is_empty());
    }

    #[test]
    fn memory_commit_publishes_and_deletes() {
        let store = InMemoryStore::new();
        commit(&store, &["a", "b"], &[]);
        commit(&store, &["c"], &["a"]);
        assert_eq!(store.find_all_objects().unwrap(), vec![key("b"), key("c")]);
        assert_eq!(store.staged_len(), 0);
    }

    #[test]
    fn memory_commit_of_unstaged_key_fails_without_effect() {
        let store = InMemoryStore::new();
        store.write_object(&key("a"), Bytes::from_static(b"1")).unwrap();
        let manifest = TxManifest::new(vec![key("a"), key("b")], vec![]);
        let result = store.commit_manifest(&manifest);
        assert!(matches!(result, Err(StorageError::NotStaged { .. })));
        assert!(store.is_empty());
    }

    #[test]
    fn memory_cursor_is_isolated_from_later_commits() {
        let store = InMemoryStore::new();
        commit(&store, &["a", "c"], &[]);
        let mut cursor = store.cursor(IteratorStart::Ge, &ObjectKey::min()).unwrap();
        commit(&store, &["b"], &["c"]);
        let keys: Vec<String> = cursor.entries().map(|e| e.unwrap().0.to_string()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn memory_with_objects() {
        let objects = [(key("x"), Bytes::from_static(b"preloaded"))].into_iter().collect();
        let store = InMemoryStore::with_objects(objects);
        assert_eq!(store.read_object(&key("x")).unwrap().unwrap(), &b"preloaded"[..]);
    }
}
