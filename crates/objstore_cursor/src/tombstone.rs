//! Layered merge that hides deletions.

use crate::cursor::{Cursor, IteratorStart, ReversibleCursor};
use crate::error::CursorResult;
use crate::merging::MergingCursor;
use crate::predicate::PredicateCursor;
use crate::BoxedCursor;
use std::fmt;

/// A value in a layered source: either live data or a deletion marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaybeTombstone<V> {
    /// A live value.
    Data(V),
    /// The key was deleted in this layer; lower layers must not show through.
    Tombstone,
}

impl<V> MaybeTombstone<V> {
    /// Returns the live value, or `None` for a tombstone.
    pub fn into_data(self) -> Option<V> {
        match self {
            Self::Data(value) => Some(value),
            Self::Tombstone => None,
        }
    }

    /// Returns true for a deletion marker.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone)
    }
}

impl<V> From<Option<V>> for MaybeTombstone<V> {
    fn from(value: Option<V>) -> Self {
        value.map_or(Self::Tombstone, Self::Data)
    }
}

fn strip_tombstone<K, V>(_: &K, value: MaybeTombstone<V>) -> Option<V> {
    value.into_data()
}

type Strip<K, V> = fn(&K, MaybeTombstone<V>) -> Option<V>;

/// Merges layers of possibly-deleted entries, newest layer first.
///
/// For each key the first source holding it decides: data is returned, a
/// tombstone hides the key entirely, including any data in later sources.
pub struct TombstoneMergingCursor<K, V> {
    inner: PredicateCursor<K, MaybeTombstone<V>, V, MergingCursor<K, MaybeTombstone<V>>, Strip<K, V>>,
}

impl<K, V> TombstoneMergingCursor<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    /// Merges `sources`, each of which must have been opened with `start` and `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if any source fails while positioning.
    pub fn new(
        name: &'static str,
        start: IteratorStart,
        key: &K,
        sources: Vec<BoxedCursor<K, MaybeTombstone<V>>>,
    ) -> CursorResult<Self> {
        let merged = MergingCursor::new(name, start, key, sources)?;
        let strip: Strip<K, V> = strip_tombstone::<K, V>;
        let inner = PredicateCursor::new(merged, start, key, strip)?;
        Ok(Self { inner })
    }
}

impl<K, V> Cursor<K, V> for TombstoneMergingCursor<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.inner.peek_next_key()
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        self.inner.next()
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.inner.skip()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

impl<K, V> ReversibleCursor<K, V> for TombstoneMergingCursor<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.inner.peek_prev_key()
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        self.inner.prev()
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.inner.skip_prev()
    }
}
