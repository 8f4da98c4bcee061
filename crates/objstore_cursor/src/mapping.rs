//! Value-transforming cursor.

use crate::cursor::{Cursor, ReversibleCursor};
use crate::error::CursorResult;
use std::marker::PhantomData;

/// Applies a fallible function to every value produced by the backing cursor.
///
/// Keys and positions are untouched, and `skip` never calls the function.
pub struct MappingCursor<K, V, T, C, F> {
    backing: C,
    map: F,
    _marker: PhantomData<fn(K, V) -> T>,
}

impl<K, V, T, C, F> MappingCursor<K, V, T, C, F>
where
    C: Cursor<K, V>,
    F: FnMut(&K, V) -> CursorResult<T> + Send,
{
    /// Wraps `backing`.
    pub fn new(backing: C, map: F) -> Self {
        Self {
            backing,
            map,
            _marker: PhantomData,
        }
    }

    fn apply(&mut self, entry: Option<(K, V)>) -> CursorResult<Option<(K, T)>> {
        entry
            .map(|(k, v)| {
                let mapped = (self.map)(&k, v)?;
                Ok((k, mapped))
            })
            .transpose()
    }
}

impl<K, V, T, C, F> Cursor<K, T> for MappingCursor<K, V, T, C, F>
where
    C: Cursor<K, V>,
    F: FnMut(&K, V) -> CursorResult<T> + Send,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.backing.peek_next_key()
    }

    fn has_next(&mut self) -> CursorResult<bool> {
        self.backing.has_next()
    }

    fn next(&mut self) -> CursorResult<Option<(K, T)>> {
        let entry = self.backing.next()?;
        self.apply(entry)
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.backing.skip()
    }

    fn close(&mut self) {
        self.backing.close();
    }
}

impl<K, V, T, C, F> ReversibleCursor<K, T> for MappingCursor<K, V, T, C, F>
where
    C: ReversibleCursor<K, V>,
    F: FnMut(&K, V) -> CursorResult<T> + Send,
{
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.backing.peek_prev_key()
    }

    fn has_prev(&mut self) -> CursorResult<bool> {
        self.backing.has_prev()
    }

    fn prev(&mut self) -> CursorResult<Option<(K, T)>> {
        let entry = self.backing.prev()?;
        self.apply(entry)
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.backing.skip_prev()
    }
}
