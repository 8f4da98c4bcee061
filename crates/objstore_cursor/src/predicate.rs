//! Filtering cursors.

use crate::cursor::{Cursor, IteratorStart, ReversibleCursor};
use crate::error::{CursorError, CursorResult};
use std::any::{Any, TypeId};
use std::marker::PhantomData;

/// Skips entries whose value the filter rejects, transforming the rest.
///
/// The filter maps each backing value to `Some(output)` to keep it or `None`
/// to drop it. One accepted entry is prefetched in the current direction;
/// the backing cursor always sits just past it.
pub struct PredicateCursor<K, V, T, C, F> {
    backing: C,
    filter: F,
    forward: bool,
    next: Option<(K, T)>,
    checked: bool,
    _marker: PhantomData<fn(V)>,
}

impl<K, V, T, C, F> PredicateCursor<K, V, T, C, F>
where
    K: Ord + Clone + Send,
    V: Send,
    T: Send,
    C: ReversibleCursor<K, V>,
    F: FnMut(&K, V) -> Option<T> + Send,
{
    /// Filters `backing`, which must have been opened with `start` and `key`.
    ///
    /// For backward starts the backing cursor may have landed on an entry
    /// that the filter rejects; the cursor then looks behind for the nearest
    /// accepted entry that still satisfies the bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing cursor fails while positioning.
    pub fn new(backing: C, start: IteratorStart, key: &K, filter: F) -> CursorResult<Self> {
        let mut cursor = Self {
            backing,
            filter,
            forward: true,
            next: None,
            checked: false,
            _marker: PhantomData,
        };
        if !start.is_backward() {
            return Ok(cursor);
        }

        cursor.fill()?;
        let overshot = cursor
            .next
            .as_ref()
            .map_or(true, |(k, _)| !start.admits(k, key));
        if overshot {
            if cursor.next.take().is_some() {
                cursor.backing.skip_prev()?;
            }
            cursor.forward = false;
            cursor.checked = false;
            cursor.fill()?;
            cursor.forward = true;
            if cursor.next.is_some() {
                cursor.backing.skip()?;
            } else {
                // Nothing accepted behind us: restart from the beginning.
                cursor.checked = false;
            }
        }
        Ok(cursor)
    }

    fn fill(&mut self) -> CursorResult<()> {
        if self.checked {
            return Ok(());
        }
        while self.next.is_none() {
            let entry = if self.forward {
                self.backing.next()?
            } else {
                self.backing.prev()?
            };
            let Some((key, value)) = entry else {
                break;
            };
            if let Some(kept) = (self.filter)(&key, value) {
                self.next = Some((key, kept));
            }
        }
        self.checked = true;
        Ok(())
    }

    fn set_direction(&mut self, forward: bool) -> CursorResult<()> {
        if self.forward == forward {
            return Ok(());
        }
        self.forward = forward;
        // Hand the prefetched entry back to the backing cursor.
        if self.next.take().is_some() {
            if forward {
                self.backing.skip()?;
            } else {
                self.backing.skip_prev()?;
            }
        }
        self.checked = false;
        Ok(())
    }

    fn peek_impl(&mut self) -> CursorResult<Option<K>> {
        self.fill()?;
        Ok(self.next.as_ref().map(|(k, _)| k.clone()))
    }

    fn take_impl(&mut self) -> CursorResult<Option<(K, T)>> {
        self.fill()?;
        let taken = self.next.take();
        self.checked = false;
        Ok(taken)
    }

    fn skip_impl(&mut self) -> CursorResult<()> {
        self.fill()?;
        self.next.take().ok_or(CursorError::Exhausted)?;
        self.checked = false;
        Ok(())
    }
}

impl<K, V, T, C, F> Cursor<K, T> for PredicateCursor<K, V, T, C, F>
where
    K: Ord + Clone + Send,
    V: Send,
    T: Send,
    C: ReversibleCursor<K, V>,
    F: FnMut(&K, V) -> Option<T> + Send,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.set_direction(true)?;
        self.peek_impl()
    }

    fn next(&mut self) -> CursorResult<Option<(K, T)>> {
        self.set_direction(true)?;
        self.take_impl()
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.set_direction(true)?;
        self.skip_impl()
    }

    fn close(&mut self) {
        self.backing.close();
    }
}

impl<K, V, T, C, F> ReversibleCursor<K, T> for PredicateCursor<K, V, T, C, F>
where
    K: Ord + Clone + Send,
    V: Send,
    T: Send,
    C: ReversibleCursor<K, V>,
    F: FnMut(&K, V) -> Option<T> + Send,
{
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.set_direction(false)?;
        self.peek_impl()
    }

    fn prev(&mut self) -> CursorResult<Option<(K, T)>> {
        self.set_direction(false)?;
        self.take_impl()
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.set_direction(false)?;
        self.skip_impl()
    }
}

/// Skips entries whose key the predicate rejects.
///
/// Values of rejected entries are never read from the backing cursor.
pub struct KeyPredicateCursor<C, P> {
    backing: C,
    predicate: P,
}

impl<C, P> KeyPredicateCursor<C, P> {
    /// Filters `backing`, which must have been opened with `start` and `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing cursor fails while positioning.
    pub fn new<K, V>(backing: C, start: IteratorStart, key: &K, predicate: P) -> CursorResult<Self>
    where
        K: Ord + Clone + Send,
        C: ReversibleCursor<K, V>,
        P: FnMut(&K) -> bool + Send,
    {
        let mut cursor = Self { backing, predicate };
        if start.is_backward() {
            let landed = cursor.settle(true)?;
            let overshot = landed.as_ref().map_or(true, |k| !start.admits(k, key));
            if overshot && cursor.settle(false)?.is_some() {
                cursor.backing.skip_prev()?;
            }
        }
        Ok(cursor)
    }

    // Skips rejected keys in the given direction and returns the first accepted one.
    fn settle<K, V>(&mut self, forward: bool) -> CursorResult<Option<K>>
    where
        C: ReversibleCursor<K, V>,
        P: FnMut(&K) -> bool,
    {
        loop {
            let peeked = if forward {
                self.backing.peek_next_key()?
            } else {
                self.backing.peek_prev_key()?
            };
            match peeked {
                Some(key) if !(self.predicate)(&key) => {
                    if forward {
                        self.backing.skip()?;
                    } else {
                        self.backing.skip_prev()?;
                    }
                }
                other => return Ok(other),
            }
        }
    }
}

impl<K, V, C, P> Cursor<K, V> for KeyPredicateCursor<C, P>
where
    C: ReversibleCursor<K, V>,
    P: FnMut(&K) -> bool + Send,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.settle(true)
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        if self.settle(true)?.is_none() {
            return Ok(None);
        }
        self.backing.next()
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.settle(true)?.ok_or(CursorError::Exhausted)?;
        self.backing.skip()
    }

    fn close(&mut self) {
        self.backing.close();
    }
}

impl<K, V, C, P> ReversibleCursor<K, V> for KeyPredicateCursor<C, P>
where
    C: ReversibleCursor<K, V>,
    P: FnMut(&K) -> bool + Send,
{
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.settle(false)
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        if self.settle(false)?.is_none() {
            return Ok(None);
        }
        self.backing.prev()
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.settle(false)?.ok_or(CursorError::Exhausted)?;
        self.backing.skip_prev()
    }
}

/// Values that can report the concrete type of what they carry.
pub trait Kinded {
    /// Returns the [`TypeId`] of the carried value.
    fn kind(&self) -> TypeId;
}

impl<T: Any> Kinded for std::sync::Arc<T> {
    fn kind(&self) -> TypeId {
        TypeId::of::<T>()
    }
}

type KindFilter<K, V> = Box<dyn FnMut(&K, V) -> Option<V> + Send>;

/// Keeps only the entries whose value carries a given concrete type.
pub struct TypePredicateCursor<K, V, C> {
    inner: PredicateCursor<K, V, V, C, KindFilter<K, V>>,
}

impl<K, V, C> TypePredicateCursor<K, V, C>
where
    K: Ord + Clone + Send + 'static,
    V: Kinded + Send + 'static,
    C: ReversibleCursor<K, V>,
{
    /// Keeps entries whose value kind is `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing cursor fails while positioning.
    pub fn of<T: Any>(backing: C, start: IteratorStart, key: &K) -> CursorResult<Self> {
        Self::with_kind(backing, start, key, TypeId::of::<T>())
    }

    /// Keeps entries whose value kind is `kind`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing cursor fails while positioning.
    pub fn with_kind(backing: C, start: IteratorStart, key: &K, kind: TypeId) -> CursorResult<Self> {
        let keep: KindFilter<K, V> = Box::new(move |_, value: V| (value.kind() == kind).then_some(value));
        let inner = PredicateCursor::new(backing, start, key, keep)?;
        Ok(Self { inner })
    }
}

impl<K, V, C> Cursor<K, V> for TypePredicateCursor<K, V, C>
where
    K: Ord + Clone + Send,
    V: Send,
    C: ReversibleCursor<K, V>,
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

impl<K, V, C> ReversibleCursor<K, V> for TypePredicateCursor<K, V, C>
where
    K: Ord + Clone + Send,
    V: Send,
    C: ReversibleCursor<K, V>,
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
