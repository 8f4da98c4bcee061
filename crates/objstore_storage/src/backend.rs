//! Persistent backend trait definition.

use crate::error::StorageResult;
use crate::key::ObjectKey;
use bytes::Bytes;
use objstore_cursor::{BoxedCursor, IteratorStart};

/// The set of object changes committed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxManifest {
    /// Keys whose staged objects become visible.
    pub written: Vec<ObjectKey>,
    /// Keys whose objects are removed.
    pub deleted: Vec<ObjectKey>,
}

impl TxManifest {
    /// Creates a manifest.
    #[must_use]
    pub fn new(written: Vec<ObjectKey>, deleted: Vec<ObjectKey>) -> Self {
        Self { written, deleted }
    }

    /// Returns true if the manifest changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written.is_empty() && self.deleted.is_empty()
    }
}

/// A durable store of opaque objects.
///
/// # Invariants
///
/// - `write_object` stages data; it is invisible to reads and cursors until
///   a manifest naming the key is committed
/// - `commit_manifest` is atomic: after a crash either all of its writes and
///   deletes are visible or none are
/// - Cursors and `find_all_objects` iterate in [`ObjectKey`] order
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait PersistentStore: Send + Sync {
    /// Returns every committed key, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn find_all_objects(&self) -> StorageResult<Vec<ObjectKey>>;

    /// Reads a committed object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object exists but cannot be read.
    fn read_object(&self, key: &ObjectKey) -> StorageResult<Option<Bytes>>;

    /// Opens an ordered cursor over committed objects.
    ///
    /// The cursor sees the key set as of the call. Values may be read lazily
    /// as the cursor advances.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor cannot be opened.
    fn cursor(&self, start: IteratorStart, key: &ObjectKey) -> StorageResult<BoxedCursor<ObjectKey, Bytes>>;

    /// Stages an object for the next manifest commit.
    ///
    /// Staging the same key again replaces the staged data.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be staged.
    fn write_object(&self, key: &ObjectKey, data: Bytes) -> StorageResult<()>;

    /// Atomically publishes staged writes and applies deletes.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::NotStaged`] if a written key has no
    /// staged data, or an I/O error if the commit fails.
    fn commit_manifest(&self, manifest: &TxManifest) -> StorageResult<()>;
}
