//! Object store statistics.
//!
//! Counters for monitoring commit throughput, conflicts and the health of the
//! write-back pipeline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use objstore_core::ObjectStore;
//!
//! let store = ObjectStore::open(backend, serializer, Config::default())?;
//!
//! // Run transactions...
//!
//! let stats = store.stats();
//! println!("Committed: {}", stats.transactions_committed);
//! println!("Conflicts: {}", stats.conflicts);
//! println!("Bundles flushed: {}", stats.bundles_flushed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Object store statistics.
///
/// All counters are atomic and can be read while operations are in progress.
#[derive(Debug, Default)]
pub struct StoreStats {
    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    /// Commits rejected with a retryable error.
    conflicts: AtomicU64,

    // Write-back counters
    bundles_flushed: AtomicU64,
    objects_flushed: AtomicU64,
    flush_failures: AtomicU64,
    backpressure_waits: AtomicU64,

    // Read cache counters
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    snapshots_opened: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful flush of `bundles` bundles holding `objects` objects.
    pub(crate) fn record_flush(&self, bundles: u64, objects: u64) {
        self.bundles_flushed.fetch_add(bundles, Ordering::Relaxed);
        self.objects_flushed.fetch_add(objects, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure_wait(&self) {
        self.backpressure_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_snapshot_open(&self) {
        self.snapshots_opened.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the total number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the total number of transactions rolled back or failed.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of commits rejected with a retryable conflict.
    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    /// Returns the number of bundles made durable.
    pub fn bundles_flushed(&self) -> u64 {
        self.bundles_flushed.load(Ordering::Relaxed)
    }

    /// Returns the number of objects written or deleted by flushes.
    pub fn objects_flushed(&self) -> u64 {
        self.objects_flushed.load(Ordering::Relaxed)
    }

    /// Returns the number of flush attempts that hit an I/O error.
    pub fn flush_failures(&self) -> u64 {
        self.flush_failures.load(Ordering::Relaxed)
    }

    /// Returns how often bundle creation had to wait for the flusher.
    ///
    /// A steadily growing value means commits outpace the backend.
    pub fn backpressure_waits(&self) -> u64 {
        self.backpressure_waits.load(Ordering::Relaxed)
    }

    /// Returns the number of reads served from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of reads that went to the backend.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of snapshots created.
    pub fn snapshots_opened(&self) -> u64 {
        self.snapshots_opened.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            conflicts: self.conflicts(),
            bundles_flushed: self.bundles_flushed(),
            objects_flushed: self.objects_flushed(),
            flush_failures: self.flush_failures(),
            backpressure_waits: self.backpressure_waits(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            snapshots_opened: self.snapshots_opened(),
        }
    }
}

/// A point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Total number of transactions started.
    pub transactions_started: u64,
    /// Total number of transactions committed.
    pub transactions_committed: u64,
    /// Total number of transactions rolled back or failed.
    pub transactions_aborted: u64,
    /// Commits rejected with a retryable conflict.
    pub conflicts: u64,
    /// Bundles made durable.
    pub bundles_flushed: u64,
    /// Objects written or deleted by flushes.
    pub objects_flushed: u64,
    /// Flush attempts that hit an I/O error.
    pub flush_failures: u64,
    /// Bundle creations that waited for the flusher.
    pub backpressure_waits: u64,
    /// Reads served from the cache.
    pub cache_hits: u64,
    /// Reads that went to the backend.
    pub cache_misses: u64,
    /// Snapshots created.
    pub snapshots_opened: u64,
}
