//! Cursors over a transaction's view: its own writes over its snapshot.

use crate::record::{Record, VersionedRecord};
use crate::snapshot::Snapshot;
use crate::structure::SharedGuard;
use crate::transaction::state::{ReadEntry, TxWrite};
use objstore_cursor::{
    BoxedCursor, Cursor, CursorError, CursorResult, IteratorStart, MapCursor, MappingCursor, MaybeTombstone,
    RefreshSource, RefreshingCursor, TombstoneMergingCursor,
};
use objstore_storage::ObjectKey;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Where a transaction cursor entry came from.
#[derive(Clone)]
pub(crate) enum TxEntry {
    /// Buffered by the transaction itself.
    Own(Arc<dyn Record>),
    /// Read from the transaction's snapshot.
    Stored(VersionedRecord),
}

/// The transaction's writes, frozen when the cursor was opened, layered over
/// its snapshot.
pub(crate) struct TxView {
    snapshot: Snapshot,
    writes: Arc<BTreeMap<ObjectKey, MaybeTombstone<TxEntry>>>,
}

impl TxView {
    pub(crate) fn new(snapshot: Snapshot, writes: &BTreeMap<ObjectKey, TxWrite>) -> Self {
        let writes = writes
            .iter()
            .map(|(key, write)| {
                let entry = match write {
                    TxWrite::Put(record) => MaybeTombstone::Data(TxEntry::Own(Arc::clone(record))),
                    TxWrite::Delete => MaybeTombstone::Tombstone,
                };
                (key.clone(), entry)
            })
            .collect();
        Self {
            snapshot,
            writes: Arc::new(writes),
        }
    }
}

impl RefreshSource<ObjectKey, TxEntry> for TxView {
    type Guard<'a> = SharedGuard<'a>;

    fn lock_shared(&self) -> SharedGuard<'_> {
        self.snapshot.lock_shared()
    }

    fn version(&self, guard: &SharedGuard<'_>) -> u64 {
        **guard
    }

    fn open(
        &self,
        _guard: &SharedGuard<'_>,
        start: IteratorStart,
        key: &ObjectKey,
    ) -> CursorResult<BoxedCursor<ObjectKey, TxEntry>> {
        let stored = self
            .snapshot
            .open_layers(start, key)
            .map_err(CursorError::source_failure)?;
        let sources: Vec<BoxedCursor<ObjectKey, MaybeTombstone<TxEntry>>> = vec![
            Box::new(MapCursor::new(Arc::clone(&self.writes), start, key)),
            Box::new(MappingCursor::new(stored, |_: &ObjectKey, record: VersionedRecord| {
                Ok(MaybeTombstone::Data(TxEntry::Stored(record)))
            })),
        ];
        Ok(Box::new(TombstoneMergingCursor::new("transaction", start, key, sources)?))
    }
}

/// A forward cursor over what a transaction sees.
///
/// Keys read from the snapshot join the transaction's read set as they are
/// returned, so a commit fails if any of them changed meanwhile. Keys only
/// peeked at are not recorded.
pub struct TxCursor<'a> {
    inner: RefreshingCursor<ObjectKey, TxEntry, TxView>,
    reads: &'a mut BTreeMap<ObjectKey, ReadEntry>,
}

impl<'a> TxCursor<'a> {
    pub(crate) fn new(
        view: TxView,
        start: IteratorStart,
        key: &ObjectKey,
        reads: &'a mut BTreeMap<ObjectKey, ReadEntry>,
    ) -> CursorResult<Self> {
        let policy = view.snapshot.refresh_policy();
        let inner = RefreshingCursor::new("transaction", Arc::new(view), start, key.clone(), policy)?;
        Ok(Self { inner, reads })
    }
}

impl Cursor<ObjectKey, Arc<dyn Record>> for TxCursor<'_> {
    fn peek_next_key(&mut self) -> CursorResult<Option<ObjectKey>> {
        self.inner.peek_next_key()
    }

    fn next(&mut self) -> CursorResult<Option<(ObjectKey, Arc<dyn Record>)>> {
        let Some((key, entry)) = self.inner.next()? else {
            return Ok(None);
        };
        let record = match entry {
            TxEntry::Own(record) => record,
            TxEntry::Stored(stored) => {
                let record = stored.record().map_err(CursorError::source_failure)?;
                self.reads.entry(key.clone()).or_insert(ReadEntry {
                    observed: Some(stored),
                });
                record
            }
        };
        Ok(Some((key, record)))
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.next()?.map(|_| ()).ok_or(CursorError::Exhausted)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

impl fmt::Debug for TxCursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxCursor")
            .field("cursor", &self.inner)
            .field("reads", &self.reads.len())
            .finish()
    }
}
