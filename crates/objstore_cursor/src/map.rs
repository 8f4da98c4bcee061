//! Cursor over a shared ordered map.

use crate::cursor::{Cursor, IteratorStart, ReversibleCursor};
use crate::error::{CursorError, CursorResult};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// A reversible cursor over an immutable [`BTreeMap`] snapshot.
///
/// The map is shared through an [`Arc`], so owners can keep mutating their
/// own copy with [`Arc::make_mut`] while cursors hold on to the old one.
///
/// The position is stored as a bound: the next entry is the first one
/// inside `(gap, ..)`. Each step is a single range lookup.
pub struct MapCursor<K, V> {
    map: Arc<BTreeMap<K, V>>,
    gap: Bound<K>,
}

impl<K: Ord + Clone, V: Clone> MapCursor<K, V> {
    /// Opens a cursor over `map` positioned according to `start` and `key`.
    #[must_use]
    pub fn new(map: Arc<BTreeMap<K, V>>, start: IteratorStart, key: &K) -> Self {
        let gap = match start {
            IteratorStart::Ge => Bound::Included(key.clone()),
            IteratorStart::Gt => Bound::Excluded(key.clone()),
            IteratorStart::Le => map
                .range::<K, _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
                .map_or(Bound::Unbounded, |(k, _)| Bound::Included(k.clone())),
            IteratorStart::Lt => map
                .range::<K, _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
                .map_or(Bound::Unbounded, |(k, _)| Bound::Included(k.clone())),
        };
        Self { map, gap }
    }

    /// Opens a cursor before the first entry of `map`.
    #[must_use]
    pub fn from_start(map: Arc<BTreeMap<K, V>>) -> Self {
        Self {
            map,
            gap: Bound::Unbounded,
        }
    }

    fn ahead(&self) -> Option<(&K, &V)> {
        self.map
            .range::<K, _>((self.gap.as_ref(), Bound::Unbounded))
            .next()
    }

    fn behind(&self) -> Option<(&K, &V)> {
        let upper = match &self.gap {
            Bound::Included(k) => Bound::Excluded(k),
            Bound::Excluded(k) => Bound::Included(k),
            Bound::Unbounded => return None,
        };
        self.map
            .range::<K, _>((Bound::Unbounded, upper))
            .next_back()
    }
}

impl<K, V> Cursor<K, V> for MapCursor<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        Ok(self.ahead().map(|(k, _)| k.clone()))
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        let Some((k, v)) = self.ahead().map(|(k, v)| (k.clone(), v.clone())) else {
            return Ok(None);
        };
        self.gap = Bound::Excluded(k.clone());
        Ok(Some((k, v)))
    }

    fn skip(&mut self) -> CursorResult<()> {
        let key = self
            .ahead()
            .map(|(k, _)| k.clone())
            .ok_or(CursorError::Exhausted)?;
        self.gap = Bound::Excluded(key);
        Ok(())
    }
}

impl<K, V> ReversibleCursor<K, V> for MapCursor<K, V>
where
    K: Ord + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        Ok(self.behind().map(|(k, _)| k.clone()))
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        let Some((k, v)) = self.behind().map(|(k, v)| (k.clone(), v.clone())) else {
            return Ok(None);
        };
        self.gap = Bound::Included(k.clone());
        Ok(Some((k, v)))
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        let key = self
            .behind()
            .map(|(k, _)| k.clone())
            .ok_or(CursorError::Exhausted)?;
        self.gap = Bound::Included(key);
        Ok(())
    }
}

impl<K: fmt::Debug, V> fmt::Debug for MapCursor<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapCursor")
            .field("len", &self.map.len())
            .field("gap", &self.gap)
            .finish()
    }
}
