//! # objstore Cursor
//!
//! Composable ordered cursors for objstore.
//!
//! A cursor walks a sorted, unique-keyed source of `(key, value)` pairs.
//! Cursors sit *between* entries: `next` returns the entry after the current
//! position and moves past it, `prev` returns the entry before it. Calling
//! `prev` right after `next` therefore yields the same entry again.
//!
//! ## Building blocks
//!
//! - [`MapCursor`] - walks a shared ordered map snapshot
//! - [`MergingCursor`] - k-way merge, earlier sources win on equal keys
//! - [`TombstoneMergingCursor`] - merge of layers that hides [`MaybeTombstone::Tombstone`] entries
//! - [`PredicateCursor`], [`KeyPredicateCursor`], [`TypePredicateCursor`] - filtering
//! - [`MappingCursor`] - lazy value transform
//! - [`Reversed`] - swaps the direction of a reversible cursor
//! - [`InvalidatableCursor`], [`RefreshingCursor`] - cursors over concurrently
//!   mutating structures that rebuild themselves when the structure version moves
//!
//! ## Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use objstore_cursor::{Cursor, IteratorStart, MapCursor, MergingCursor, ReversibleCursor};
//!
//! let left: BTreeMap<&str, u32> = [("a", 1), ("c", 3)].into_iter().collect();
//! let right: BTreeMap<&str, u32> = [("b", 2)].into_iter().collect();
//!
//! let sources: Vec<Box<dyn ReversibleCursor<&str, u32>>> = vec![
//!     Box::new(MapCursor::new(Arc::new(left), IteratorStart::Ge, &"")),
//!     Box::new(MapCursor::new(Arc::new(right), IteratorStart::Ge, &"")),
//! ];
//! let mut merged = MergingCursor::new("example", IteratorStart::Ge, &"", sources).unwrap();
//! let keys: Vec<&str> = merged.entries().map(|e| e.unwrap().0).collect();
//! assert_eq!(keys, vec!["a", "b", "c"]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cursor;
mod error;
mod map;
mod mapping;
mod merging;
mod predicate;
mod refresh;
mod reversed;
mod tombstone;

pub use cursor::{Cursor, Entries, IteratorStart, ReversibleCursor};
pub use error::{CursorError, CursorResult};
pub use map::MapCursor;
pub use mapping::MappingCursor;
pub use merging::MergingCursor;
pub use predicate::{KeyPredicateCursor, Kinded, PredicateCursor, TypePredicateCursor};
pub use refresh::{InvalidatableCursor, RefreshPolicy, RefreshSource, RefreshingCursor};
pub use reversed::Reversed;
pub use tombstone::{MaybeTombstone, TombstoneMergingCursor};

/// A boxed reversible cursor, the common currency between layers.
pub type BoxedCursor<K, V> = Box<dyn ReversibleCursor<K, V>>;
