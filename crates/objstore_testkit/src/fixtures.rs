//! Test fixtures and store helpers.
//!
//! Provides record kinds, a serializer that knows them, and stores that
//! clean up after themselves.

use objstore_core::{
    CommitHandle, Config, LockingStrategy, ObjectKey, ObjectStore, Record, TaggedSerializer, VersionedRecord,
};
use objstore_storage::{FileStore, InMemoryStore, PersistentStore};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// A named integer value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Key of the record.
    pub name: String,
    /// The value.
    pub value: i64,
}

impl Counter {
    /// Creates a counter record ready to be put.
    pub fn record(name: impl Into<String>, value: i64) -> Arc<dyn Record> {
        Arc::new(Self {
            name: name.into(),
            value,
        })
    }
}

impl Record for Counter {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.name)
    }

    fn size_estimate(&self) -> usize {
        self.name.len() + 8
    }
}

/// An opaque blob, used to test kind filtering and size accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    /// Key of the record.
    pub name: String,
    /// The payload.
    pub data: Vec<u8>,
}

impl Blob {
    /// Creates a blob record ready to be put.
    pub fn record(name: impl Into<String>, data: Vec<u8>) -> Arc<dyn Record> {
        Arc::new(Self {
            name: name.into(),
            data,
        })
    }
}

impl Record for Blob {
    fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.name)
    }

    fn size_estimate(&self) -> usize {
        self.name.len() + self.data.len()
    }
}

/// A serializer knowing every fixture record kind.
pub fn test_serializer() -> Arc<TaggedSerializer> {
    Arc::new(
        TaggedSerializer::new()
            .register::<Counter>("counter")
            .register::<Blob>("blob"),
    )
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Configuration used by fixture stores: small pools, short retry delays.
pub fn test_config() -> Config {
    Config::new()
        .writeback_workers(2)
        .flush_retry_delay(std::time::Duration::from_millis(5))
        .default_retry_attempts(1_000)
}

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store instance.
    pub store: ObjectStore,
    /// The backend under the store.
    pub backend: Arc<dyn PersistentStore>,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self::memory_with(test_config())
    }

    /// Creates a new in-memory test store with a custom configuration.
    pub fn memory_with(config: Config) -> Self {
        init_tracing();
        let backend: Arc<dyn PersistentStore> = Arc::new(InMemoryStore::new());
        let store =
            ObjectStore::open(Arc::clone(&backend), test_serializer(), config).expect("Failed to open in-memory store");
        Self {
            store,
            backend,
            temp_dir: None,
        }
    }

    /// Creates a new file-based test store.
    pub fn file() -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend: Arc<dyn PersistentStore> =
            Arc::new(FileStore::open(temp_dir.path()).expect("Failed to open file backend"));
        let store =
            ObjectStore::open(Arc::clone(&backend), test_serializer(), test_config()).expect("Failed to open store");
        Self {
            store,
            backend,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// Shuts the store down and opens it again over the same backend.
    ///
    /// File-based stores reopen the directory with a fresh backend, the way
    /// a restarted process would.
    pub fn reopen(self) -> Self {
        let Self {
            store,
            backend,
            temp_dir,
        } = self;
        store.shutdown();
        drop(store);

        let backend: Arc<dyn PersistentStore> = match &temp_dir {
            Some(dir) => Arc::new(FileStore::open(dir.path()).expect("Failed to reopen file backend")),
            None => backend,
        };
        let store =
            ObjectStore::open(Arc::clone(&backend), test_serializer(), test_config()).expect("Failed to reopen store");
        Self {
            store,
            backend,
            temp_dir,
        }
    }
}

impl std::ops::Deref for TestStore {
    type Target = ObjectStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a temporary in-memory store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&ObjectStore) -> R,
{
    let test_store = TestStore::memory();
    f(&test_store.store)
}

/// Runs a test with a temporary file-based store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&ObjectStore, &Path) -> R,
{
    let test_store = TestStore::file();
    let path = test_store.path().expect("File store should have a path").to_path_buf();
    f(&test_store.store, &path)
}

/// Commits one counter write.
pub fn put_counter(store: &ObjectStore, name: &str, value: i64) -> CommitHandle {
    let mut tx = store.begin();
    tx.put(Counter::record(name, value)).expect("Failed to buffer put");
    store.commit(&mut tx).expect("Failed to commit")
}

/// Commits one delete.
pub fn delete_key(store: &ObjectStore, name: &str) -> CommitHandle {
    let mut tx = store.begin();
    tx.delete(&ObjectKey::new(name)).expect("Failed to buffer delete");
    store.commit(&mut tx).expect("Failed to commit")
}

/// Reads a counter in a throwaway transaction.
pub fn read_counter(store: &ObjectStore, name: &str) -> Option<i64> {
    let mut tx = store.begin();
    let value = tx
        .get::<Counter>(&ObjectKey::new(name), LockingStrategy::Optimistic)
        .expect("Failed to read counter")
        .map(|counter| counter.value);
    store.rollback(&mut tx);
    value
}

/// Collects every counter visible in a fresh snapshot, in key order.
pub fn scan_counters(store: &ObjectStore) -> Vec<(String, i64)> {
    let snapshot = store.snapshot().expect("Failed to open snapshot");
    scan_snapshot(&snapshot.scan_from(&ObjectKey::min()).expect("Failed to scan snapshot"))
}

/// Converts scanned entries to `(key, value)` pairs of counters.
pub fn scan_snapshot(entries: &[(ObjectKey, VersionedRecord)]) -> Vec<(String, i64)> {
    entries
        .iter()
        .filter_map(|(key, record)| {
            let counter = record.downcast::<Counter>().ok()?;
            Some((key.to_string(), counter.value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trip() {
        let store = TestStore::memory();
        put_counter(&store, "a", 1);
        assert_eq!(read_counter(&store, "a"), Some(1));
        assert!(store.path().is_none());
    }

    #[test]
    fn file_store_survives_reopen() {
        let store = TestStore::file();
        assert!(store.path().is_some());
        put_counter(&store, "a", 1).fence();
        let store = store.reopen();
        assert_eq!(read_counter(&store, "a"), Some(1));
    }

    #[test]
    fn scan_skips_other_kinds() {
        let store = TestStore::memory();
        put_counter(&store, "a", 1);
        let mut tx = store.begin();
        tx.put(Blob::record("b", vec![1, 2, 3])).unwrap();
        store.commit(&mut tx).unwrap();
        assert_eq!(scan_counters(&store), vec![("a".to_string(), 1)]);
    }
}
