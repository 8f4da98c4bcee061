//! Cursors over concurrently restructured sources.
//!
//! A [`RefreshSource`] is a structure guarded by a reader/writer lock whose
//! layout can change underneath open cursors (entries move between layers,
//! layers are merged) without changing the content a cursor is meant to see.
//! Every change bumps the structure version.
//!
//! - [`InvalidatableCursor`] checks the version on every call and reports
//!   [`CursorError::Stale`] once it moved.
//! - [`RefreshingCursor`] rebuilds its backing cursor after a version change
//!   and checks that the rebuilt cursor resumes at the same entry.

use crate::cursor::{Cursor, IteratorStart, ReversibleCursor};
use crate::error::{CursorError, CursorResult};
use crate::BoxedCursor;
use std::fmt;
use std::sync::Arc;

/// A versioned structure that can open cursors over itself.
pub trait RefreshSource<K, V>: Send + Sync {
    /// Shared guard that keeps the structure from changing while held.
    type Guard<'a>
    where
        Self: 'a;

    /// Takes the shared side of the structure lock.
    fn lock_shared(&self) -> Self::Guard<'_>;

    /// Returns the structure version observed under `guard`.
    fn version(&self, guard: &Self::Guard<'_>) -> u64;

    /// Opens a cursor over the structure as seen under `guard`.
    ///
    /// Implementations must not take the structure lock again.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer of the structure cannot be read.
    fn open(&self, guard: &Self::Guard<'_>, start: IteratorStart, key: &K) -> CursorResult<BoxedCursor<K, V>>;
}

/// A cursor that fails with [`CursorError::Stale`] once its source changes.
pub struct InvalidatableCursor<K, V, S> {
    source: Arc<S>,
    backing: BoxedCursor<K, V>,
    version: u64,
}

impl<K, V, S: RefreshSource<K, V>> InvalidatableCursor<K, V, S> {
    /// Opens a cursor over the current state of `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened.
    pub fn new(source: Arc<S>, start: IteratorStart, key: &K) -> CursorResult<Self> {
        let (backing, version) = {
            let guard = source.lock_shared();
            (source.open(&guard, start, key)?, source.version(&guard))
        };
        Ok(Self {
            source,
            backing,
            version,
        })
    }

    /// Structure version this cursor was built against.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    fn checked<T>(&mut self, op: impl FnOnce(&mut BoxedCursor<K, V>) -> CursorResult<T>) -> CursorResult<T> {
        let source = Arc::clone(&self.source);
        let guard = source.lock_shared();
        let current = source.version(&guard);
        if current != self.version {
            return Err(CursorError::Stale {
                built: self.version,
                current,
            });
        }
        op(&mut self.backing)
    }
}

impl<K, V, S: RefreshSource<K, V>> Cursor<K, V> for InvalidatableCursor<K, V, S> {
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.checked(|c| c.peek_next_key())
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        self.checked(|c| c.next())
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.checked(|c| c.skip())
    }

    fn close(&mut self) {
        self.backing.close();
    }
}

impl<K, V, S: RefreshSource<K, V>> ReversibleCursor<K, V> for InvalidatableCursor<K, V, S> {
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.checked(|c| c.peek_prev_key())
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        self.checked(|c| c.prev())
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.checked(|c| c.skip_prev())
    }
}

impl<K, V, S> fmt::Debug for InvalidatableCursor<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidatableCursor")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// How a [`RefreshingCursor`] notices structure changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPolicy {
    /// Prefetch one entry and compare versions on every step.
    Eager,
    /// Walk an [`InvalidatableCursor`] and rebuild when it reports staleness.
    #[default]
    Lazy,
}

enum Strategy<K, V, S> {
    Eager {
        backing: BoxedCursor<K, V>,
        version: u64,
        next: Option<(K, V)>,
    },
    Lazy {
        backing: InvalidatableCursor<K, V, S>,
        peeked: Option<K>,
        last_returned: Option<K>,
    },
}

/// A forward cursor that survives restructuring of its source.
///
/// After a version change the backing cursor is reopened just past the last
/// entry handed out. If the rebuilt cursor does not reproduce an entry this
/// cursor already committed to (a prefetched or peeked key), the walk fails
/// with [`CursorError::Consistency`].
pub struct RefreshingCursor<K, V, S> {
    name: &'static str,
    source: Arc<S>,
    start: IteratorStart,
    anchor: K,
    strategy: Strategy<K, V, S>,
}

impl<K, V, S> RefreshingCursor<K, V, S>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
    S: RefreshSource<K, V>,
{
    /// Opens a cursor over `source` positioned by `start` and `anchor`.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be opened.
    pub fn new(
        name: &'static str,
        source: Arc<S>,
        start: IteratorStart,
        anchor: K,
        policy: RefreshPolicy,
    ) -> CursorResult<Self> {
        let strategy = match policy {
            RefreshPolicy::Eager => {
                let guard = source.lock_shared();
                let mut backing = source.open(&guard, start, &anchor)?;
                let next = backing.next()?;
                Strategy::Eager {
                    backing,
                    version: source.version(&guard),
                    next,
                }
            }
            RefreshPolicy::Lazy => Strategy::Lazy {
                backing: InvalidatableCursor::new(Arc::clone(&source), start, &anchor)?,
                peeked: None,
                last_returned: None,
            },
        };
        Ok(Self {
            name,
            source,
            start,
            anchor,
            strategy,
        })
    }

    /// Returns the policy this cursor was opened with.
    #[must_use]
    pub const fn policy(&self) -> RefreshPolicy {
        match self.strategy {
            Strategy::Eager { .. } => RefreshPolicy::Eager,
            Strategy::Lazy { .. } => RefreshPolicy::Lazy,
        }
    }

    fn consistency_failure(name: &'static str, expected: &K, found: Option<&K>) -> CursorError {
        tracing::error!(
            cursor = name,
            expected = ?expected,
            found = ?found,
            "refreshed cursor lost its position"
        );
        CursorError::consistency(format!("{expected:?}"), format!("{found:?}"))
    }

    fn eager_step(&mut self) -> CursorResult<Option<(K, V)>> {
        let source = Arc::clone(&self.source);
        let guard = source.lock_shared();
        let current = source.version(&guard);
        let Strategy::Eager { backing, version, next } = &mut self.strategy else {
            unreachable!("eager step on a lazy cursor");
        };
        let Some((key, value)) = next.take() else {
            return Ok(None);
        };
        if current != *version {
            tracing::debug!(cursor = self.name, from = *version, to = current, "refreshing cursor");
            let mut reopened = source.open(&guard, IteratorStart::Ge, &key)?;
            match reopened.next()? {
                Some((found, _)) if found == key => {}
                other => {
                    let found = other.map(|(k, _)| k);
                    return Err(Self::consistency_failure(self.name, &key, found.as_ref()));
                }
            }
            *backing = reopened;
            *version = current;
        }
        *next = backing.next()?;
        Ok(Some((key, value)))
    }

    fn rebuild_lazy(&mut self) -> CursorResult<()> {
        let Strategy::Lazy { peeked, last_returned, .. } = &self.strategy else {
            return Ok(());
        };
        let peeked = peeked.clone();
        let (start, key) = match (&peeked, last_returned) {
            (Some(peeked), _) => (IteratorStart::Ge, peeked.clone()),
            (None, Some(last)) => (IteratorStart::Gt, last.clone()),
            (None, None) => (self.start, self.anchor.clone()),
        };
        let mut rebuilt = InvalidatableCursor::new(Arc::clone(&self.source), start, &key)?;
        tracing::debug!(cursor = self.name, version = rebuilt.version(), "refreshing cursor");
        if let Some(expected) = &peeked {
            match rebuilt.peek_next_key() {
                Ok(found) if found.as_ref() == Some(expected) => {}
                Ok(found) => return Err(Self::consistency_failure(self.name, expected, found.as_ref())),
                // Moved again while reopening: the caller retries.
                Err(e) if e.is_stale() => {}
                Err(e) => return Err(e),
            }
        }
        if let Strategy::Lazy { backing, .. } = &mut self.strategy {
            *backing = rebuilt;
        }
        Ok(())
    }

    fn lazy_op<T>(&mut self, mut op: impl FnMut(&mut InvalidatableCursor<K, V, S>) -> CursorResult<T>) -> CursorResult<T> {
        loop {
            let Strategy::Lazy { backing, .. } = &mut self.strategy else {
                unreachable!("lazy step on an eager cursor");
            };
            match op(backing) {
                Err(e) if e.is_stale() => self.rebuild_lazy()?,
                other => return other,
            }
        }
    }

    fn lazy_next(&mut self) -> CursorResult<Option<(K, V)>> {
        let entry = self.lazy_op(|c| c.next())?;
        if let Strategy::Lazy { peeked, last_returned, .. } = &mut self.strategy {
            *peeked = None;
            if let Some((key, _)) = &entry {
                *last_returned = Some(key.clone());
            }
        }
        Ok(entry)
    }
}

impl<K, V, S> Cursor<K, V> for RefreshingCursor<K, V, S>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
    S: RefreshSource<K, V>,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        if let Strategy::Eager { next, .. } = &self.strategy {
            return Ok(next.as_ref().map(|(k, _)| k.clone()));
        }
        let key = self.lazy_op(|c| c.peek_next_key())?;
        if let Strategy::Lazy { peeked, .. } = &mut self.strategy {
            peeked.clone_from(&key);
        }
        Ok(key)
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        match self.strategy {
            Strategy::Eager { .. } => self.eager_step(),
            Strategy::Lazy { .. } => self.lazy_next(),
        }
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.next()?.map(|_| ()).ok_or(CursorError::Exhausted)
    }

    fn close(&mut self) {
        match &mut self.strategy {
            Strategy::Eager { backing, next, .. } => {
                backing.close();
                *next = None;
            }
            Strategy::Lazy { backing, .. } => backing.close(),
        }
    }
}

impl<K: fmt::Debug, V, S> fmt::Debug for RefreshingCursor<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshingCursor")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("anchor", &self.anchor)
            .finish_non_exhaustive()
    }
}
