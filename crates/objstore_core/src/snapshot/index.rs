//! Index of superseded record versions.
//!
//! When a commit replaces a value that a live snapshot can still see, the
//! old value is kept here under `(key, lower)` together with the id of the
//! replacing transaction (`upper`). Snapshot `S` sees the entry exactly when
//! `lower <= S < upper`. Intervals for one key never overlap.

use crate::record::VersionedRecord;
use crate::types::TransactionId;
use objstore_cursor::{Cursor, CursorError, CursorResult, IteratorStart, MaybeTombstone, ReversibleCursor};
use objstore_storage::ObjectKey;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Position of a superseded version in the index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SnapshotKey {
    pub(crate) key: ObjectKey,
    pub(crate) lower: TransactionId,
}

impl SnapshotKey {
    pub(crate) fn new(key: ObjectKey, lower: TransactionId) -> Self {
        Self { key, lower }
    }

    fn floor(key: &ObjectKey) -> Self {
        Self::new(key.clone(), TransactionId::ZERO)
    }

    fn ceiling(key: &ObjectKey) -> Self {
        Self::new(key.clone(), TransactionId::new(u64::MAX))
    }
}

/// A superseded value and the transaction that replaced it.
#[derive(Debug, Clone)]
pub(crate) struct SnapshotEntry {
    pub(crate) value: VersionedRecord,
    pub(crate) upper: TransactionId,
}

pub(crate) type SnapshotIndex = BTreeMap<SnapshotKey, SnapshotEntry>;

/// Looks up the superseded value of `key` visible to snapshot `id`.
pub(crate) fn visible_in(index: &SnapshotIndex, id: TransactionId, key: &ObjectKey) -> Option<VersionedRecord> {
    index
        .range(SnapshotKey::floor(key)..=SnapshotKey::new(key.clone(), id))
        .next_back()
        .filter(|(_, entry)| id < entry.upper)
        .map(|(_, entry)| entry.value.clone())
}

/// Reversible cursor over the index entries visible to one snapshot.
pub(crate) struct SnapshotIndexCursor {
    index: Arc<SnapshotIndex>,
    id: TransactionId,
    gap: Bound<ObjectKey>,
}

impl SnapshotIndexCursor {
    pub(crate) fn new(index: Arc<SnapshotIndex>, id: TransactionId, start: IteratorStart, key: &ObjectKey) -> Self {
        let gap = match start {
            IteratorStart::Ge | IteratorStart::Lt => Bound::Included(key.clone()),
            IteratorStart::Gt | IteratorStart::Le => Bound::Excluded(key.clone()),
        };
        let mut cursor = Self { index, id, gap };
        if start.is_backward() {
            cursor.gap = cursor
                .behind()
                .map_or(Bound::Unbounded, |(k, _)| Bound::Included(k.key.clone()));
        }
        cursor
    }

    /// The version of `key` this snapshot sees, found with one range probe.
    fn covering(&self, key: &ObjectKey) -> Option<(&SnapshotKey, &SnapshotEntry)> {
        self.index
            .range(SnapshotKey::floor(key)..=SnapshotKey::new(key.clone(), self.id))
            .next_back()
            .filter(|(_, entry)| self.id < entry.upper)
    }

    // Both directions seek key by key: a key whose versions are all hidden is
    // passed over with a single range seek, not entry by entry.
    fn ahead(&self) -> Option<(&SnapshotKey, &SnapshotEntry)> {
        let mut lower = match &self.gap {
            Bound::Included(k) => Bound::Included(SnapshotKey::floor(k)),
            Bound::Excluded(k) => Bound::Excluded(SnapshotKey::ceiling(k)),
            Bound::Unbounded => Bound::Unbounded,
        };
        loop {
            let (candidate, _) = self.index.range((lower, Bound::Unbounded)).next()?;
            if let Some(found) = self.covering(&candidate.key) {
                return Some(found);
            }
            lower = Bound::Excluded(SnapshotKey::ceiling(&candidate.key));
        }
    }

    fn behind(&self) -> Option<(&SnapshotKey, &SnapshotEntry)> {
        let mut upper = match &self.gap {
            Bound::Included(k) => Bound::Excluded(SnapshotKey::floor(k)),
            Bound::Excluded(k) => Bound::Included(SnapshotKey::ceiling(k)),
            Bound::Unbounded => return None,
        };
        loop {
            let (candidate, _) = self.index.range((Bound::Unbounded, upper)).next_back()?;
            if let Some(found) = self.covering(&candidate.key) {
                return Some(found);
            }
            upper = Bound::Excluded(SnapshotKey::floor(&candidate.key));
        }
    }
}

type Item = (ObjectKey, MaybeTombstone<VersionedRecord>);

impl Cursor<ObjectKey, MaybeTombstone<VersionedRecord>> for SnapshotIndexCursor {
    fn peek_next_key(&mut self) -> CursorResult<Option<ObjectKey>> {
        Ok(self.ahead().map(|(k, _)| k.key.clone()))
    }

    fn next(&mut self) -> CursorResult<Option<Item>> {
        let Some((key, value)) = self
            .ahead()
            .map(|(k, e)| (k.key.clone(), e.value.clone()))
        else {
            return Ok(None);
        };
        self.gap = Bound::Excluded(key.clone());
        Ok(Some((key, MaybeTombstone::Data(value))))
    }

    fn skip(&mut self) -> CursorResult<()> {
        let key = self
            .ahead()
            .map(|(k, _)| k.key.clone())
            .ok_or(CursorError::Exhausted)?;
        self.gap = Bound::Excluded(key);
        Ok(())
    }
}

impl ReversibleCursor<ObjectKey, MaybeTombstone<VersionedRecord>> for SnapshotIndexCursor {
    fn peek_prev_key(&mut self) -> CursorResult<Option<ObjectKey>> {
        Ok(self.behind().map(|(k, _)| k.key.clone()))
    }

    fn prev(&mut self) -> CursorResult<Option<Item>> {
        let Some((key, value)) = self
            .behind()
            .map(|(k, e)| (k.key.clone(), e.value.clone()))
        else {
            return Ok(None);
        };
        self.gap = Bound::Included(key.clone());
        Ok(Some((key, MaybeTombstone::Data(value))))
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        let key = self
            .behind()
            .map(|(k, _)| k.key.clone())
            .ok_or(CursorError::Exhausted)?;
        self.gap = Bound::Included(key);
        Ok(())
    }
}

impl fmt::Debug for SnapshotIndexCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotIndexCursor")
            .field("snapshot", &self.id)
            .field("gap", &self.gap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::Item as TestItem;

    fn entry(key: &str, lower: u64, upper: u64) -> (SnapshotKey, SnapshotEntry) {
        (
            SnapshotKey::new(ObjectKey::new(key), TransactionId::new(lower)),
            SnapshotEntry {
                value: VersionedRecord::new(TransactionId::new(lower), TestItem::new(key, lower as i64)),
                upper: TransactionId::new(upper),
            },
        )
    }

    fn index() -> Arc<SnapshotIndex> {
        Arc::new(
            [
                entry("a", 2, 5),
                entry("a", 5, 8),
                entry("b", 1, 3),
                entry("c", 4, 10),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn walk(cursor: &mut SnapshotIndexCursor) -> Vec<(String, u64)> {
        cursor
            .entries()
            .map(|e| {
                let (k, v) = e.unwrap();
                (k.to_string(), v.into_data().unwrap().version().as_u64())
            })
            .collect()
    }

    #[test]
    fn only_covering_entries_are_visible() {
        let mut at4 = SnapshotIndexCursor::new(index(), TransactionId::new(4), IteratorStart::Ge, &ObjectKey::min());
        assert_eq!(walk(&mut at4), vec![("a".into(), 2), ("c".into(), 4)]);

        let mut at6 = SnapshotIndexCursor::new(index(), TransactionId::new(6), IteratorStart::Ge, &ObjectKey::min());
        assert_eq!(walk(&mut at6), vec![("a".into(), 5), ("c".into(), 4)]);

        let mut at2 = SnapshotIndexCursor::new(index(), TransactionId::new(2), IteratorStart::Ge, &ObjectKey::min());
        assert_eq!(walk(&mut at2), vec![("a".into(), 2), ("b".into(), 1)]);
    }

    #[test]
    fn le_start_finds_visible_floor() {
        let mut cursor = SnapshotIndexCursor::new(index(), TransactionId::new(4), IteratorStart::Le, &ObjectKey::new("bz"));
        assert_eq!(walk(&mut cursor), vec![("a".into(), 2), ("c".into(), 4)]);

        let mut cursor = SnapshotIndexCursor::new(index(), TransactionId::new(4), IteratorStart::Lt, &ObjectKey::new("c"));
        assert_eq!(cursor.peek_next_key().unwrap(), Some(ObjectKey::new("a")));
    }

    #[test]
    fn walks_backwards() {
        let mut cursor = SnapshotIndexCursor::new(index(), TransactionId::new(6), IteratorStart::Gt, &ObjectKey::new("z"));
        assert!(!cursor.has_next().unwrap());
        let (k, _) = cursor.prev().unwrap().unwrap();
        assert_eq!(k.as_str(), "c");
        let (k, v) = cursor.prev().unwrap().unwrap();
        assert_eq!(k.as_str(), "a");
        assert_eq!(v.into_data().unwrap().version(), TransactionId::new(5));
        assert!(cursor.prev().unwrap().is_none());
        assert!(matches!(cursor.skip_prev(), Err(CursorError::Exhausted)));
    }

    #[test]
    fn hidden_version_runs_are_skipped_per_key() {
        let mut entries: SnapshotIndex = (0..50).map(|v| entry("m", 10 + 2 * v, 11 + 2 * v)).collect();
        entries.extend([entry("a", 1, 3), entry("z", 1, 200)]);
        let index = Arc::new(entries);

        let mut cursor = SnapshotIndexCursor::new(Arc::clone(&index), TransactionId::new(2), IteratorStart::Ge, &ObjectKey::min());
        assert_eq!(walk(&mut cursor), vec![("a".into(), 1), ("z".into(), 1)]);

        let mut cursor = SnapshotIndexCursor::new(Arc::clone(&index), TransactionId::new(50), IteratorStart::Ge, &ObjectKey::min());
        assert_eq!(walk(&mut cursor), vec![("m".into(), 50), ("z".into(), 1)]);

        let mut cursor = SnapshotIndexCursor::new(index, TransactionId::new(2), IteratorStart::Le, &ObjectKey::new("y"));
        assert_eq!(cursor.peek_next_key().unwrap(), Some(ObjectKey::new("a")));
    }

    #[test]
    fn point_lookup_respects_interval() {
        let index = index();
        let a = ObjectKey::new("a");
        assert_eq!(visible_in(&index, TransactionId::new(1), &a).map(|r| r.version()), None);
        assert_eq!(
            visible_in(&index, TransactionId::new(4), &a).map(|r| r.version()),
            Some(TransactionId::new(2))
        );
        assert_eq!(
            visible_in(&index, TransactionId::new(7), &a).map(|r| r.version()),
            Some(TransactionId::new(5))
        );
        assert_eq!(visible_in(&index, TransactionId::new(8), &a).map(|r| r.version()), None);
    }
}
