//! K-way merge of reversible cursors.

use crate::cursor::{Cursor, IteratorStart, ReversibleCursor};
use crate::error::{CursorError, CursorResult};
use crate::BoxedCursor;
use std::collections::BTreeMap;
use std::fmt;
use tracing::trace;

/// Merges several sorted sources into one sorted stream.
///
/// Sources are given in priority order: when two sources hold the same key,
/// the entry from the earlier source wins and the later one is skipped.
/// Only the source that supplied the returned entry is advanced.
///
/// All sources must have been opened with the same start bound and anchor
/// that is passed to [`MergingCursor::new`].
pub struct MergingCursor<K, V> {
    name: &'static str,
    sources: Vec<BoxedCursor<K, V>>,
    // Current candidate key of every non-exhausted source -> source index.
    candidates: BTreeMap<K, usize>,
    forward: bool,
}

impl<K, V> MergingCursor<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    /// Merges `sources`, earlier sources taking precedence.
    ///
    /// # Errors
    ///
    /// Returns an error if positioning any source fails.
    pub fn new(
        name: &'static str,
        start: IteratorStart,
        key: &K,
        sources: Vec<BoxedCursor<K, V>>,
    ) -> CursorResult<Self> {
        let mut merged = Self {
            name,
            sources,
            candidates: BTreeMap::new(),
            forward: true,
        };

        if start.is_backward() {
            merged.align_backward_start(start, key)?;
        }

        for idx in 0..merged.sources.len() {
            merged.advance(idx)?;
        }
        trace!(cursor = merged.name, candidates = ?merged.candidates.keys().collect::<Vec<_>>(), "merge initialized");
        Ok(merged)
    }

    // Every source has positioned itself at its own greatest key under the
    // anchor, or at its first key if it has none. The merged start is the
    // greatest of the admitted keys, or the least of the rest.
    fn align_backward_start(&mut self, start: IteratorStart, key: &K) -> CursorResult<()> {
        let mut admitted: Option<K> = None;
        let mut rest: Option<K> = None;
        for source in &mut self.sources {
            let Some(peeked) = source.peek_next_key()? else {
                continue;
            };
            if start.admits(&peeked, key) {
                if admitted.as_ref().map_or(true, |a| peeked > *a) {
                    admitted = Some(peeked);
                }
            } else if rest.as_ref().map_or(true, |r| peeked < *r) {
                rest = Some(peeked);
            }
        }

        let Some(from) = admitted.or(rest) else {
            return Ok(());
        };
        for source in &mut self.sources {
            while let Some(peeked) = source.peek_next_key()? {
                if peeked >= from {
                    break;
                }
                source.skip()?;
            }
        }
        Ok(())
    }

    fn source_peek(&mut self, idx: usize) -> CursorResult<Option<K>> {
        if self.forward {
            self.sources[idx].peek_next_key()
        } else {
            self.sources[idx].peek_prev_key()
        }
    }

    fn source_skip(&mut self, idx: usize) -> CursorResult<()> {
        if self.forward {
            self.sources[idx].skip()
        } else {
            self.sources[idx].skip_prev()
        }
    }

    fn source_take(&mut self, idx: usize) -> CursorResult<Option<(K, V)>> {
        if self.forward {
            self.sources[idx].next()
        } else {
            self.sources[idx].prev()
        }
    }

    // Registers the current key of source `idx` as a candidate, resolving
    // collisions in favour of the lower source index.
    fn advance(&mut self, mut idx: usize) -> CursorResult<()> {
        loop {
            let Some(key) = self.source_peek(idx)? else {
                return Ok(());
            };
            match self.candidates.get(&key).copied() {
                None => {
                    self.candidates.insert(key, idx);
                    return Ok(());
                }
                Some(theirs) if idx < theirs => {
                    self.candidates.insert(key, idx);
                    // The displaced source still sits on the same key.
                    idx = theirs;
                }
                Some(_) => {
                    trace!(cursor = self.name, ?key, source = idx, "shadowed entry skipped");
                    self.source_skip(idx)?;
                }
            }
        }
    }

    fn pop_candidate(&mut self) -> Option<(K, usize)> {
        if self.forward {
            self.candidates.pop_first()
        } else {
            self.candidates.pop_last()
        }
    }

    fn peek_candidate(&self) -> Option<&K> {
        if self.forward {
            self.candidates.keys().next()
        } else {
            self.candidates.keys().next_back()
        }
    }

    fn set_direction(&mut self, forward: bool) -> CursorResult<()> {
        if self.forward == forward {
            return Ok(());
        }

        let pivot = self.peek_candidate().cloned();
        self.candidates.clear();
        self.forward = forward;
        for idx in 0..self.sources.len() {
            self.advance(idx)?;
        }

        // Sources that had run dry or skipped shadowed keys come back on the
        // other side of the pivot; drop them until the merge is past it.
        if let Some(pivot) = pivot {
            while let Some(key) = self.peek_candidate() {
                let behind = if forward { *key <= pivot } else { *key >= pivot };
                if !behind {
                    break;
                }
                self.skip_impl()?;
            }
        }
        Ok(())
    }

    fn take_impl(&mut self) -> CursorResult<Option<(K, V)>> {
        let Some((key, idx)) = self.pop_candidate() else {
            return Ok(None);
        };
        let entry = self.source_take(idx)?;
        match &entry {
            Some((found, _)) if *found == key => {}
            other => {
                return Err(CursorError::consistency(
                    format!("{key:?}"),
                    format!("{:?}", other.as_ref().map(|(k, _)| k)),
                ));
            }
        }
        self.advance(idx)?;
        Ok(entry)
    }

    fn skip_impl(&mut self) -> CursorResult<()> {
        let (_, idx) = self.pop_candidate().ok_or(CursorError::Exhausted)?;
        self.source_skip(idx)?;
        self.advance(idx)
    }
}

impl<K, V> Cursor<K, V> for MergingCursor<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    fn peek_next_key(&mut self) -> CursorResult<Option<K>> {
        self.set_direction(true)?;
        Ok(self.peek_candidate().cloned())
    }

    fn next(&mut self) -> CursorResult<Option<(K, V)>> {
        self.set_direction(true)?;
        self.take_impl()
    }

    fn skip(&mut self) -> CursorResult<()> {
        self.set_direction(true)?;
        self.skip_impl()
    }

    fn close(&mut self) {
        for source in &mut self.sources {
            source.close();
        }
    }
}

impl<K, V> ReversibleCursor<K, V> for MergingCursor<K, V>
where
    K: Ord + Clone + fmt::Debug + Send + 'static,
    V: Send + 'static,
{
    fn peek_prev_key(&mut self) -> CursorResult<Option<K>> {
        self.set_direction(false)?;
        Ok(self.peek_candidate().cloned())
    }

    fn prev(&mut self) -> CursorResult<Option<(K, V)>> {
        self.set_direction(false)?;
        self.take_impl()
    }

    fn skip_prev(&mut self) -> CursorResult<()> {
        self.set_direction(false)?;
        self.skip_impl()
    }
}

impl<K: fmt::Debug, V> fmt::Debug for MergingCursor<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergingCursor")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .field("forward", &self.forward)
            .finish_non_exhaustive()
    }
}
