//! Direction-swapping view of a reversible cursor.

use crate::cursor::{Cursor, ReversibleCursor};
use crate::error::CursorResult;

/// A reversible cursor with `next` and `prev` swapped.
///
/// Reversing twice gives back the original cursor through
/// [`Reversed::into_inner`].
#[derive(Debug)]
pub struct Reversed<C> {
    inner: C,
}

impl<C> Reversed<C> {
    /// Wraps `inner`.
    pub const fn new(inner: C) -> Self {
        Self { inner }
    }

    /// Unwraps the original cursor.
    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<K, V, C: ReversibleCursor<K, V>> Cursor<K, V> for Reversed<C> {
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.inner.peek_prev_key()
    }

    fn has_next(&mut self) -> CursorResult<bool> {
        self.inner.has_prev()
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        self.inner.prev()
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.inner.skip_prev()
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

impl<K, V, C: ReversibleCursor<K, V>> ReversibleCursor<K, V> for Reversed<C> {
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.inner.peek_next_key()
    }

    fn has_prev(&mut self) -> CursorResult<bool> {
        self.inner.has_next()
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        self.inner.next()
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.inner.skip()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Cursor, IteratorStart, MapCursor, ReversibleCursor};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    fn reversed_walks_backwards() {
        let map: BTreeMap<u8, u8> = (1..=4).map(|i| (i, i * 10)).collect();
        let mut cursor = MapCursor::new(Arc::new(map), IteratorStart::Gt, &4).reversed();
        let keys: Vec<u8> = cursor.entries().map(|e| e.unwrap().0).collect();
        assert_eq!(keys, vec![4, 3, 2, 1]);
    }

    #[test]
    fn reversed_twice_restores_direction() {
        let map: BTreeMap<u8, u8> = (1..=3).map(|i| (i, i)).collect();
        let mut cursor = MapCursor::new(Arc::new(map), IteratorStart::Ge, &2)
            .reversed()
            .into_inner();
        assert_eq!(cursor.next().unwrap(), Some((2, 2)));
    }
}
