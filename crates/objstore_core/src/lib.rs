//! # objstore Core
//!
//! Transactional, multi-version object store engine for objstore.
//!
//! This crate provides:
//! - Records: immutable, typed values addressed by [`ObjectKey`]
//! - A serializing, caching view of a [`objstore_storage::PersistentStore`]
//! - The write-back pipeline that makes commits durable asynchronously
//! - Snapshots: stable point-in-time views with self-refreshing cursors
//! - Optimistic transactions with per-key locks and pre-commit hooks
//!
//! ## Layers
//!
//! ```text
//! ObjectStore
//!   TransactionManager ── PreCommitHook
//!   SnapshotManager ───── superseded-version index
//!   WritebackPipeline ─── pending map, bundles, flusher thread
//!   CachingStore > SerializingStore > PersistentStore
//! ```
//!
//! Versions are transaction ids. A commit publishes its writes to the
//! pending map under the exclusive structure lock; the flusher later moves
//! them into the persistent store under the same lock. Readers combine the
//! layers under the shared side, so every reader sees a commit entirely or
//! not at all.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod config;
mod error;
mod lock;
mod object_store;
mod record;
mod snapshot;
mod stats;
mod store;
mod structure;
mod transaction;
mod types;
mod writeback;

pub use codec::{ObjectSerializer, TaggedSerializer};
pub use config::Config;
pub use error::{CoreError, CoreResult};
pub use lock::{KeyLockGuard, LockManager};
pub use object_store::ObjectStore;
pub use record::{downcast_record, AsAny, Record, Undecoded, VersionedRecord, DEFAULT_SIZE_ESTIMATE};
pub use snapshot::{Snapshot, SnapshotCursor, SnapshotManager, SnapshotView};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::{CachingStore, SerializingStore};
pub use transaction::{
    CommitHandle, LockingStrategy, PreCommitHook, Transaction, TransactionManager, TransactionState, TxCursor,
    TxWrite,
};
pub use types::{BundleId, TransactionId};
pub use writeback::{Bundle, PendingEntry, WritebackPipeline};

pub use objstore_cursor::{Cursor, IteratorStart, RefreshPolicy, ReversibleCursor};
pub use objstore_storage::ObjectKey;
