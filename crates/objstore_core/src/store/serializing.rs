//! Serializing layer over a persistent backend.

use crate::codec::ObjectSerializer;
use crate::error::CoreResult;
use crate::record::VersionedRecord;
use crate::types::TransactionId;
use bytes::Bytes;
use objstore_codec::{decode_frame, encode_frame, peek_version};
use objstore_cursor::{BoxedCursor, Cursor, CursorError, IteratorStart, MappingCursor};
use objstore_storage::{ObjectKey, PersistentStore, TxManifest};
use std::fmt;
use std::sync::Arc;

/// Stores [`VersionedRecord`]s in a [`PersistentStore`].
///
/// Each object is a frame holding the 8-byte big-endian version followed by
/// the serializer's payload. Reads are lazy: the version is decoded
/// immediately and the payload on first access.
#[derive(Clone)]
pub struct SerializingStore {
    backend: Arc<dyn PersistentStore>,
    serializer: Arc<dyn ObjectSerializer>,
}

impl SerializingStore {
    /// Creates a store over `backend`.
    pub fn new(backend: Arc<dyn PersistentStore>, serializer: Arc<dyn ObjectSerializer>) -> Self {
        Self { backend, serializer }
    }

    /// Returns the serializer used for payloads.
    pub fn serializer(&self) -> &Arc<dyn ObjectSerializer> {
        &self.serializer
    }

    fn decode(serializer: &Arc<dyn ObjectSerializer>, frame: &Bytes) -> CoreResult<VersionedRecord> {
        let (version, payload) = decode_frame(frame)?;
        Ok(VersionedRecord::lazy(
            TransactionId::new(version),
            payload,
            Arc::clone(serializer),
        ))
    }

    /// Reads the committed record stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or the frame is truncated.
    pub fn read_object(&self, key: &ObjectKey) -> CoreResult<Option<VersionedRecord>> {
        self.backend
            .read_object(key)?
            .map(|frame| Self::decode(&self.serializer, &frame))
            .transpose()
    }

    /// Opens a cursor over committed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot open a cursor.
    pub fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> CoreResult<BoxedCursor<ObjectKey, VersionedRecord>> {
        let backing = self.backend.cursor(start, key)?;
        let serializer = Arc::clone(&self.serializer);
        Ok(Box::new(MappingCursor::new(backing, move |_: &ObjectKey, frame: Bytes| {
            Self::decode(&serializer, &frame).map_err(CursorError::source_failure)
        })))
    }

    /// Stages `record` under `key`; it stays invisible until a manifest commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or staged.
    pub fn write_object(&self, key: &ObjectKey, record: &VersionedRecord) -> CoreResult<()> {
        let payload = self.serializer.serialize(record.record()?.as_ref())?;
        let frame = encode_frame(record.version().as_u64(), &payload);
        self.backend.write_object(key, frame)?;
        Ok(())
    }

    /// Atomically publishes staged writes and applies deletions.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the manifest.
    pub fn commit_manifest(&self, manifest: &TxManifest) -> CoreResult<()> {
        self.backend.commit_manifest(manifest)?;
        Ok(())
    }

    /// Lists every committed key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn find_all_objects(&self) -> CoreResult<Vec<ObjectKey>> {
        Ok(self.backend.find_all_objects()?)
    }

    /// Returns the highest version of any committed object.
    ///
    /// Only version prefixes are decoded.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails or a frame is truncated.
    pub fn max_version(&self) -> CoreResult<TransactionId> {
        let mut cursor = self.backend.cursor(IteratorStart::Ge, &ObjectKey::min())?;
        let mut max = 0;
        while let Some((_, frame)) = cursor.next()? {
            max = max.max(peek_version(&frame)?);
        }
        Ok(TransactionId::new(max))
    }
}

impl fmt::Debug for SerializingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializingStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{serializer, value_of, Item};
    use objstore_storage::InMemoryStore;

    fn store() -> SerializingStore {
        SerializingStore::new(Arc::new(InMemoryStore::new()), serializer())
    }

    fn publish(store: &SerializingStore, version: u64, name: &str, value: i64) {
        let key = ObjectKey::new(name);
        let record = VersionedRecord::new(TransactionId::new(version), Item::new(name, value));
        store.write_object(&key, &record).unwrap();
        store
            .commit_manifest(&TxManifest::new(vec![key], vec![]))
            .unwrap();
    }

    #[test]
    fn write_commit_and_read_lazily() {
        let store = store();
        publish(&store, 4, "a", 10);

        let read = store.read_object(&ObjectKey::new("a")).unwrap().unwrap();
        assert_eq!(read.version(), TransactionId::new(4));
        assert!(read.decoded().is_none());
        assert_eq!(value_of(&read.record().unwrap()), 10);
        assert!(read.decoded().is_some());
    }

    #[test]
    fn staged_write_is_invisible() {
        let store = store();
        let key = ObjectKey::new("a");
        let record = VersionedRecord::new(TransactionId::new(1), Item::new("a", 1));
        store.write_object(&key, &record).unwrap();
        assert!(store.read_object(&key).unwrap().is_none());
    }

    #[test]
    fn cursor_decodes_frames_in_key_order() {
        let store = store();
        publish(&store, 2, "b", 2);
        publish(&store, 1, "a", 1);
        publish(&store, 3, "c", 3);

        let mut cursor = store.cursor(IteratorStart::Gt, &ObjectKey::new("a")).unwrap();
        let seen: Vec<(String, u64)> = cursor
            .entries()
            .map(|e| {
                let (k, v) = e.unwrap();
                (k.to_string(), v.version().as_u64())
            })
            .collect();
        assert_eq!(seen, vec![("b".to_string(), 2), ("c".to_string(), 3)]);
    }

    #[test]
    fn max_version_scans_prefixes() {
        let store = store();
        assert_eq!(store.max_version().unwrap(), TransactionId::ZERO);
        publish(&store, 7, "x", 0);
        publish(&store, 3, "y", 0);
        assert_eq!(store.max_version().unwrap(), TransactionId::new(7));
    }
}
