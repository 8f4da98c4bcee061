//! Cursor traits and start bounds.

use crate::error::CursorResult;
use crate::reversed::Reversed;
use std::marker::PhantomData;

/// Where a freshly opened cursor sits relative to its anchor key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IteratorStart {
    /// Before the first key greater than or equal to the anchor.
    Ge,
    /// Before the first key strictly greater than the anchor.
    Gt,
    /// Before the greatest key less than or equal to the anchor.
    ///
    /// If no key qualifies the cursor starts at the beginning of the source.
    Le,
    /// Before the greatest key strictly less than the anchor.
    ///
    /// If no key qualifies the cursor starts at the beginning of the source.
    Lt,
}

impl IteratorStart {
    /// Returns true if `key` satisfies this bound relative to `anchor`.
    #[must_use]
    pub fn admits<K: Ord>(self, key: &K, anchor: &K) -> bool {
        match self {
            Self::Ge => key >= anchor,
            Self::Gt => key > anchor,
            Self::Le => key <= anchor,
            Self::Lt => key < anchor,
        }
    }

    /// Returns true for the bounds that look backwards from the anchor.
    #[must_use]
    pub const fn is_backward(self) -> bool {
        matches!(self, Self::Le | Self::Lt)
    }
}

/// A forward cursor over a sorted, unique-keyed source.
///
/// `next` returns `Ok(None)` once the cursor is exhausted; `skip` on an
/// exhausted cursor fails with [`crate::CursorError::Exhausted`].
pub trait Cursor<K, V>: Send {
    /// Returns the key `next` would return, without moving.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn peek_next_key(&mut self) -> CursorResult<Option<K>>;

    /// Returns true if `next` would return an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn has_next(&mut self) -> CursorResult<bool> {
        Ok(self.peek_next_key()?.is_some())
    }

    /// Returns the next entry and moves past it.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn next(&mut self) -> CursorResult<Option<(K, V)>>;

    /// Moves past the next entry without producing its value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CursorError::Exhausted`] if there is no next entry.
    fn skip(&mut self) -> CursorResult<()>;

    /// Releases resources held by the cursor. Dropping has the same effect.
    fn close(&mut self) {}

    /// Adapts the cursor into an [`Iterator`] over the remaining entries.
    fn entries(&mut self) -> Entries<'_, K, V, Self>
    where
        Self: Sized,
    {
        Entries {
            cursor: self,
            _marker: PhantomData,
        }
    }
}

/// A cursor that can also walk backwards.
pub trait ReversibleCursor<K, V>: Cursor<K, V> {
    /// Returns the key `prev` would return, without moving.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>>;

    /// Returns true if `prev` would return an entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn has_prev(&mut self) -> CursorResult<bool> {
        Ok(self.peek_prev_key()?.is_some())
    }

    /// Returns the previous entry and moves before it.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying source fails.
    fn prev(&mut self) -> CursorResult<Option<(K, V)>>;

    /// Moves before the previous entry without producing its value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::CursorError::Exhausted`] if there is no previous entry.
    fn skip_prev(&mut self) -> CursorResult<()>;

    /// Returns a view of this cursor with the directions swapped.
    fn reversed(self) -> Reversed<Self>
    where
        Self: Sized,
    {
        Reversed::new(self)
    }
}

/// Iterator over the remaining entries of a cursor, see [`Cursor::entries`].
pub struct Entries<'a, K, V, C: ?Sized> {
    cursor: &'a mut C,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C: Cursor<K, V> + ?Sized> Iterator for Entries<'_, K, V, C> {
    type Item = CursorResult<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        <C as Cursor<K, V>>::next(self.cursor).transpose()
    }
}

impl<K, V, C: Cursor<K, V> + ?Sized> Cursor<K, V> for Box<C> {
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        (**self).peek_next_key()
    }

    fn has_next(&mut self) -> CursorResult<bool> {
        (**self).has_next()
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        (**self).next()
    }

    fn skip(&mut self) -> CursorResult<()> {
        (**self).skip()
    }

    fn close(&mut self) {
        (**self).close();
    }
}

impl<K, V, C: ReversibleCursor<K, V> + ?Sized> ReversibleCursor<K, V> for Box<C> {
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        (**self).peek_prev_key()
    }

    fn has_prev(&mut self) -> CursorResult<bool> {
        (**self).has_prev()
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        (**self).prev()
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        (**self).skip_prev()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_admits() {
        assert!(IteratorStart::Ge.admits(&5, &5));
        assert!(!IteratorStart::Gt.admits(&5, &5));
        assert!(IteratorStart::Le.admits(&4, &5));
        assert!(!IteratorStart::Lt.admits(&5, &5));
    }

    #[test]
    fn start_direction() {
        assert!(IteratorStart::Le.is_backward());
        assert!(IteratorStart::Lt.is_backward());
        assert!(!IteratorStart::Ge.is_backward());
        assert!(!IteratorStart::Gt.is_backward());
    }
}
