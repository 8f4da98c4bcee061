//! File-based object store for persistent storage.

use crate::backend::{PersistentStore, TxManifest};
use crate::error::{StorageError, StorageResult};
use crate::key::ObjectKey;
use bytes::Bytes;
use objstore_cursor::{BoxedCursor, CursorError, IteratorStart, MapCursor, MappingCursor};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const OBJECTS_DIR: &str = "objects";
const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";
const STAGED_SUFFIX: &str = "tmp";
const CHECKSUM_LEN: usize = 32;

/// A file-based object store.
///
/// Every object is a file under `objects/<bucket>/<name>`, where `name` is
/// the hex SHA-256 of the key and `bucket` its first byte, spreading objects
/// over 256 directories. The file starts with the key itself (a 4-byte
/// big-endian length and the key bytes), so the key set can be rebuilt by
/// scanning the buckets on open.
///
/// # Durability
///
/// - `write_object` writes and syncs `<name>.tmp` next to the final file
/// - `commit_manifest` first writes a checksummed `MANIFEST` file listing the
///   written and deleted keys, then renames the staged files into place and
///   removes deleted ones, then removes the manifest
/// - On open a leftover manifest is replayed, so a crash between those steps
///   never leaves a commit half applied; leftover staged files are removed
///
/// # Example
///
/// ```no_run
/// use bytes::Bytes;
/// use objstore_storage::{FileStore, ObjectKey, PersistentStore, TxManifest};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("objects.db")).unwrap();
/// let key = ObjectKey::new("inode/1");
/// store.write_object(&key, Bytes::from_static(b"data")).unwrap();
/// store.commit_manifest(&TxManifest::new(vec![key], vec![])).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    index: RwLock<Arc<BTreeMap<ObjectKey, PathBuf>>>,
    commit_lock: Mutex<()>,
}

impl FileStore {
    /// Opens or creates a store rooted at `root`.
    ///
    /// Replays an interrupted manifest commit if one is found.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or scanned, or if
    /// an object file is corrupted.
    pub fn open(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root.join(OBJECTS_DIR))?;
        let store = Self {
            root: root.to_path_buf(),
            index: RwLock::default(),
            commit_lock: Mutex::new(()),
        };
        store.recover()?;
        let index = store.scan()?;
        tracing::debug!(root = %root.display(), objects = index.len(), "opened file store");
        *store.index.write() = Arc::new(index);
        Ok(store)
    }

    /// Returns the root directory of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(name, "{byte:02x}");
        }
        self.root.join(OBJECTS_DIR).join(&name[..2]).join(name)
    }

    fn staged_path(&self, key: &ObjectKey) -> PathBuf {
        self.object_path(key).with_extension(STAGED_SUFFIX)
    }

    fn recover(&self) -> StorageResult<()> {
        let manifest_path = self.root.join(MANIFEST_FILE);
        match fs::read(&manifest_path) {
            Ok(raw) => match decode_manifest(&raw) {
                Ok(manifest) => {
                    tracing::info!(
                        written = manifest.written.len(),
                        deleted = manifest.deleted.len(),
                        "replaying interrupted manifest commit"
                    );
                    self.apply(&manifest)?;
                }
                Err(e) => {
                    // The manifest itself never became durable, so neither did the commit.
                    tracing::warn!(error = %e, "discarding unreadable manifest");
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        remove_if_exists(&manifest_path)?;
        remove_if_exists(&self.root.join(MANIFEST_TMP_FILE))?;
        Ok(())
    }

    // Rebuilds the key index and removes staged files left by an unfinished commit.
    fn scan(&self) -> StorageResult<BTreeMap<ObjectKey, PathBuf>> {
        let mut index = BTreeMap::new();
        for bucket in fs::read_dir(self.root.join(OBJECTS_DIR))? {
            let bucket = bucket?;
            if !bucket.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(bucket.path())? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == STAGED_SUFFIX) {
                    tracing::debug!(path = %path.display(), "removing abandoned staged object");
                    remove_if_exists(&path)?;
                    continue;
                }
                let raw = fs::read(&path)?;
                let (key, _) = split_object(&raw, &path)?;
                index.insert(ObjectKey::new(key), path);
            }
        }
        Ok(index)
    }

    fn write_manifest(&self, manifest: &TxManifest) -> StorageResult<()> {
        let tmp = self.root.join(MANIFEST_TMP_FILE);
        write_synced(&tmp, &encode_manifest(manifest))?;
        fs::rename(&tmp, self.root.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn apply(&self, manifest: &TxManifest) -> StorageResult<()> {
        for key in &manifest.written {
            let staged = self.staged_path(key);
            let target = self.object_path(key);
            match fs::rename(&staged, &target) {
                Ok(()) => {}
                // Already moved by an earlier, interrupted attempt.
                Err(e) if e.kind() == io::ErrorKind::NotFound && target.exists() => {}
                Err(e) => return Err(e.into()),
            }
        }
        for key in &manifest.deleted {
            remove_if_exists(&self.object_path(key))?;
        }
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn find_all_objects(&self) -> StorageResult<Vec<ObjectKey>> {
        Ok(self.index.read().keys().cloned().collect())
    }

    fn read_object(&self, key: &ObjectKey) -> StorageResult<Option<Bytes>> {
        let Some(path) = self.index.read().get(key).cloned() else {
            return Ok(None);
        };
        match read_object_file(&path, key) {
            Ok(data) => Ok(Some(data)),
            // Deleted by a commit that raced with the index lookup.
            Err(StorageError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> StorageResult<BoxedCursor<ObjectKey, Bytes>> {
        let index = Arc::clone(&self.index.read());
        let keys = MapCursor::new(index, start, key);
        Ok(Box::new(MappingCursor::new(keys, |key: &ObjectKey, path: PathBuf| {
            read_object_file(&path, key).map_err(CursorError::source_failure)
        })))
    }

    fn write_object(&self, key: &ObjectKey, data: Bytes) -> StorageResult<()> {
        let path = self.staged_path(key);
        if let Some(bucket) = path.parent() {
            fs::create_dir_all(bucket)?;
        }
        let key_len = u32::try_from(key.as_bytes().len())
            .map_err(|_| StorageError::corrupted(format!("key too long: {} bytes", key.as_bytes().len())))?;
        let mut contents = Vec::with_capacity(4 + key.as_bytes().len() + data.len());
        contents.extend_from_slice(&key_len.to_be_bytes());
        contents.extend_from_slice(key.as_bytes());
        contents.extend_from_slice(&data);
        write_synced(&path, &contents)
    }

    fn commit_manifest(&self, manifest: &TxManifest) -> StorageResult<()> {
        if manifest.is_empty() {
            return Ok(());
        }
        let _commit = self.commit_lock.lock();
        if let Some(missing) = manifest
            .written
            .iter()
            .find(|k| !self.staged_path(k).exists())
        {
            return Err(StorageError::NotStaged {
                key: missing.to_string(),
            });
        }

        self.write_manifest(manifest)?;
        self.apply(manifest)?;

        {
            let mut index = self.index.write();
            let map = Arc::make_mut(&mut index);
            for key in &manifest.written {
                map.insert(key.clone(), self.object_path(key));
            }
            for key in &manifest.deleted {
                map.remove(key);
            }
        }

        fs::remove_file(self.root.join(MANIFEST_FILE))?;
        tracing::trace!(
            written = manifest.written.len(),
            deleted = manifest.deleted.len(),
            "manifest committed"
        );
        Ok(())
    }
}

fn write_synced(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> StorageResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn split_object<'a>(raw: &'a [u8], path: &Path) -> StorageResult<(&'a str, usize)> {
    let corrupted = || StorageError::corrupted(format!("bad object header in {}", path.display()));
    let len_bytes: [u8; 4] = raw.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(corrupted)?;
    let key_end = 4 + u32::from_be_bytes(len_bytes) as usize;
    let key = raw.get(4..key_end).ok_or_else(corrupted)?;
    let key = std::str::from_utf8(key).map_err(|_| corrupted())?;
    Ok((key, key_end))
}

fn read_object_file(path: &Path, expected: &ObjectKey) -> StorageResult<Bytes> {
    let raw = fs::read(path)?;
    let (key, data_start) = split_object(&raw, path)?;
    if key != expected.as_str() {
        return Err(StorageError::corrupted(format!(
            "{} holds key {key:?}, expected {expected:?}",
            path.display()
        )));
    }
    Ok(Bytes::from(raw).slice(data_start..))
}

fn encode_keys(out: &mut Vec<u8>, keys: &[ObjectKey]) {
    out.extend_from_slice(&(keys.len() as u32).to_be_bytes());
    for key in keys {
        out.extend_from_slice(&(key.as_bytes().len() as u32).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
    }
}

fn encode_manifest(manifest: &TxManifest) -> Vec<u8> {
    let mut body = Vec::new();
    encode_keys(&mut body, &manifest.written);
    encode_keys(&mut body, &manifest.deleted);
    let mut out = Sha256::digest(&body).to_vec();
    out.extend_from_slice(&body);
    out
}

fn decode_manifest(raw: &[u8]) -> StorageResult<TxManifest> {
    if raw.len() < CHECKSUM_LEN {
        return Err(StorageError::corrupted("manifest shorter than its checksum"));
    }
    let (checksum, body) = raw.split_at(CHECKSUM_LEN);
    if Sha256::digest(body).as_slice() != checksum {
        return Err(StorageError::corrupted("manifest checksum mismatch"));
    }
    let mut reader = ManifestReader { body, pos: 0 };
    let written = reader.keys()?;
    let deleted = reader.keys()?;
    Ok(TxManifest { written, deleted })
}

struct ManifestReader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> ManifestReader<'a> {
    fn take(&mut self, len: usize) -> StorageResult<&'a [u8]> {
        let bytes = self
            .body
            .get(self.pos..self.pos + len)
            .ok_or_else(|| StorageError::corrupted("truncated manifest"))?;
        self.pos += len;
        Ok(bytes)
    }

    fn u32(&mut self) -> StorageResult<u32> {
        let bytes = self.take(4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Ok(u32::from_be_bytes(buf))
    }

    fn keys(&mut self) -> StorageResult<Vec<ObjectKey>> {
        let count = self.u32()?;
        let mut keys = Vec::new();
        for _ in 0..count {
            let len = self.u32()? as usize;
            let key = std::str::from_utf8(self.take(len)?)
                .map_err(|_| StorageError::corrupted("manifest key is not UTF-8"))?;
            keys.push(ObjectKey::new(key));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore_cursor::{Cursor, ReversibleCursor};
    use tempfile::tempdir;

    fn key(k: &str) -> ObjectKey {
        ObjectKey::new(k)
    }

    fn stage(store: &FileStore, k: &str, data: &'static [u8]) {
        store.write_object(&key(k), Bytes::from_static(data)).unwrap();
    }

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.find_all_objects().unwrap().is_empty());
        assert!(dir.path().join(OBJECTS_DIR).is_dir());
        assert_eq!(store.path(), dir.path());
    }

    #[test]
    fn file_commit_and_read() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        stage(&store, "a", b"alpha");
        assert!(store.read_object(&key("a")).unwrap().is_none());

        store.commit_manifest(&TxManifest::new(vec![key("a")], vec![])).unwrap();
        assert_eq!(store.read_object(&key("a")).unwrap().unwrap(), &b"alpha"[..]);
        assert!(!dir.path().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            stage(&store, "a", b"1");
            stage(&store, "b", b"2");
            store.commit_manifest(&TxManifest::new(vec![key("a"), key("b")], vec![])).unwrap();
            store.commit_manifest(&TxManifest::new(vec![], vec![key("a")])).unwrap();
        }
        {
            let store = FileStore::open(dir.path()).unwrap();
            assert_eq!(store.find_all_objects().unwrap(), vec![key("b")]);
            assert_eq!(store.read_object(&key("b")).unwrap().unwrap(), &b"2"[..]);
        }
    }

    #[test]
    fn file_uncommitted_staging_is_discarded_on_open() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            stage(&store, "lost", b"never committed");
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.find_all_objects().unwrap().is_empty());
        assert!(matches!(
            store.commit_manifest(&TxManifest::new(vec![key("lost")], vec![])),
            Err(StorageError::NotStaged { .. })
        ));
    }

    #[test]
    fn file_interrupted_commit_is_replayed() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            stage(&store, "old", b"x");
            store.commit_manifest(&TxManifest::new(vec![key("old")], vec![])).unwrap();

            // Crash right after the manifest became durable.
            stage(&store, "new", b"y");
            let manifest = TxManifest::new(vec![key("new")], vec![key("old")]);
            store.write_manifest(&manifest).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.find_all_objects().unwrap(), vec![key("new")]);
        assert_eq!(store.read_object(&key("new")).unwrap().unwrap(), &b"y"[..]);
    }

    #[test]
    fn file_corrupted_manifest_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            stage(&store, "a", b"1");
            let mut raw = encode_manifest(&TxManifest::new(vec![key("a")], vec![]));
            let last = raw.len() - 1;
            raw[last] ^= 0xff;
            fs::write(dir.path().join(MANIFEST_FILE), raw).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.find_all_objects().unwrap().is_empty());
        assert!(!dir.path().join(MANIFEST_FILE).exists());
    }

    #[test]
    fn file_cursor_reads_in_key_order() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        for (k, v) in [("c", b"3"), ("a", b"1"), ("b", b"2")] {
            stage(&store, k, v);
        }
        store
            .commit_manifest(&TxManifest::new(vec![key("a"), key("b"), key("c")], vec![]))
            .unwrap();

        let mut cursor = store.cursor(IteratorStart::Gt, &key("a")).unwrap();
        assert_eq!(cursor.next().unwrap(), Some((key("b"), Bytes::from_static(b"2"))));
        assert_eq!(cursor.peek_next_key().unwrap(), Some(key("c")));
        assert_eq!(cursor.prev().unwrap().map(|(k, _)| k), Some(key("b")));
        assert_eq!(cursor.prev().unwrap().map(|(k, _)| k), Some(key("a")));
    }

    #[test]
    fn file_manifest_encoding_roundtrip() {
        let manifest = TxManifest::new(vec![key("a"), key("ü/2")], vec![key("")]);
        assert_eq!(decode_manifest(&encode_manifest(&manifest)).unwrap(), manifest);
        assert!(decode_manifest(&[0u8; 8]).is_err());
    }
}
