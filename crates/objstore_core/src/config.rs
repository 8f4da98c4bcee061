//! Object store configuration.

use objstore_cursor::RefreshPolicy;
use std::time::Duration;

/// Configuration for opening an object store.
#[derive(Debug, Clone)]
pub struct Config {
    /// Aggregate size of unflushed bundles above which new bundles wait.
    pub writeback_size_limit: usize,

    /// Number of threads writing records in parallel during a flush.
    pub writeback_workers: usize,

    /// How long bundle creation waits for the flusher before forcing a flush.
    pub backpressure_wait: Duration,

    /// How long bundle creation waits on a forced flush before giving up.
    pub forced_flush_timeout: Duration,

    /// Delay before a failed flush is attempted again.
    pub flush_retry_delay: Duration,

    /// Byte budget of the read cache over the persistent store.
    pub cache_size_limit: usize,

    /// How snapshot cursors rebuild themselves after concurrent commits.
    pub refresh_policy: RefreshPolicy,

    /// Maximum number of pre-commit hook passes per commit.
    pub max_hook_iterations: usize,

    /// Attempts used by [`crate::ObjectStore::run_with_retry_default`].
    pub default_retry_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            writeback_size_limit: 64 * 1024 * 1024, // 64 MB
            writeback_workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            backpressure_wait: Duration::from_secs(10),
            forced_flush_timeout: Duration::from_secs(60),
            flush_retry_delay: Duration::from_millis(100),
            cache_size_limit: 16 * 1024 * 1024, // 16 MB
            refresh_policy: RefreshPolicy::Lazy,
            max_hook_iterations: 64,
            default_retry_attempts: 10,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the write-back backpressure threshold in bytes.
    #[must_use]
    pub const fn writeback_size_limit(mut self, bytes: usize) -> Self {
        self.writeback_size_limit = bytes;
        self
    }

    /// Sets the flush worker pool size (at least one).
    #[must_use]
    pub const fn writeback_workers(mut self, workers: usize) -> Self {
        self.writeback_workers = if workers == 0 { 1 } else { workers };
        self
    }

    /// Sets the bounded backpressure wait.
    #[must_use]
    pub const fn backpressure_wait(mut self, wait: Duration) -> Self {
        self.backpressure_wait = wait;
        self
    }

    /// Sets how long a forced flush may take before bundle creation fails.
    #[must_use]
    pub const fn forced_flush_timeout(mut self, timeout: Duration) -> Self {
        self.forced_flush_timeout = timeout;
        self
    }

    /// Sets the delay between flush attempts after an I/O failure.
    #[must_use]
    pub const fn flush_retry_delay(mut self, delay: Duration) -> Self {
        self.flush_retry_delay = delay;
        self
    }

    /// Sets the read cache budget in bytes.
    #[must_use]
    pub const fn cache_size_limit(mut self, bytes: usize) -> Self {
        self.cache_size_limit = bytes;
        self
    }

    /// Selects the snapshot cursor refresh strategy.
    #[must_use]
    pub const fn refresh_policy(mut self, policy: RefreshPolicy) -> Self {
        self.refresh_policy = policy;
        self
    }

    /// Sets the pre-commit hook pass limit.
    #[must_use]
    pub const fn max_hook_iterations(mut self, iterations: usize) -> Self {
        self.max_hook_iterations = iterations;
        self
    }

    /// Sets the attempts used by the default retry helper.
    #[must_use]
    pub const fn default_retry_attempts(mut self, attempts: usize) -> Self {
        self.default_retry_attempts = attempts;
        self
    }
}
