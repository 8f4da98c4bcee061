//! Stress tests for the object store.
//!
//! These drive the store from several threads at once and report
//! throughput alongside the invariants they check.

use crate::fixtures::{scan_snapshot, Counter};
use objstore_core::{CoreError, LockingStrategy, ObjectKey, ObjectStore};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Transactions each writer thread commits.
    pub operations: usize,
    /// Number of concurrent writer threads.
    pub threads: usize,
    /// Number of distinct keys.
    pub key_count: usize,
    /// Attempts per transaction before giving up.
    pub retry_attempts: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            key_count: 8,
            retry_attempts: 10_000,
        }
    }
}

fn account(index: usize) -> String {
    format!("account/{index:04}")
}

/// Increments one shared counter from every thread.
///
/// Returns the result and the final counter value, which equals the
/// number of successful increments when commits serialize correctly.
pub fn stress_counter_increments(store: Arc<ObjectStore>, config: &StressConfig) -> (StressTestResult, i64) {
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..config.threads)
        .map(|_| {
            let store = Arc::clone(&store);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();

            thread::spawn(move || {
                let key = ObjectKey::new("counter");
                for _ in 0..config.operations {
                    let result = store.run_with_retry(config.retry_attempts, |tx| {
                        let current = tx
                            .get::<Counter>(&key, LockingStrategy::Optimistic)?
                            .map_or(0, |counter| counter.value);
                        tx.put(Counter::record("counter", current + 1))
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    let total = store
        .snapshot()
        .and_then(|snapshot| snapshot.get::<Counter>(&ObjectKey::new("counter")))
        .ok()
        .flatten()
        .map_or(0, |counter| counter.value);
    (result, total)
}

/// Moves value between accounts while readers check that snapshots always
/// see the same total.
///
/// Writers lock both accounts with [`LockingStrategy::Write`] in key order.
/// Returns the writer result and the number of snapshots that saw a wrong
/// total (zero when snapshots are consistent).
pub fn stress_transfers(store: Arc<ObjectStore>, config: &StressConfig, initial: i64) -> (StressTestResult, usize) {
    store
        .run_with_retry(config.retry_attempts, |tx| {
            for index in 0..config.key_count {
                tx.put(Counter::record(account(index), initial))?;
            }
            Ok(())
        })
        .expect("Failed to seed accounts");
    let expected = initial * config.key_count as i64;

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let torn = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(false));
    let start = Instant::now();

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            let torn = Arc::clone(&torn);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let Ok(snapshot) = store.snapshot() else {
                        continue;
                    };
                    let Ok(entries) = snapshot.scan_from(&ObjectKey::new("account/")) else {
                        continue;
                    };
                    let total: i64 = scan_snapshot(&entries).iter().map(|(_, value)| value).sum();
                    if total != expected {
                        torn.fetch_add(1, Ordering::Relaxed);
                    }
                    drop(snapshot);
                    thread::sleep(Duration::from_micros(200));
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..config.threads)
        .map(|t| {
            let store = Arc::clone(&store);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let config = config.clone();

            thread::spawn(move || {
                for i in 0..config.operations {
                    let a = (t + i) % config.key_count;
                    let b = (t + 2 * i + 1) % config.key_count;
                    if a == b {
                        continue;
                    }
                    let (from, to) = (account(a.min(b)), account(a.max(b)));
                    let result = store.run_with_retry(config.retry_attempts, |tx| {
                        let balance = |tx: &mut objstore_core::Transaction, name: &str| {
                            tx.get::<Counter>(&ObjectKey::new(name), LockingStrategy::Write)?
                                .map(|counter| counter.value)
                                .ok_or_else(|| CoreError::consistency(format!("missing account {name}")))
                        };
                        let from_balance = balance(tx, &from)?;
                        let to_balance = balance(tx, &to)?;
                        tx.put(Counter::record(from.as_str(), from_balance - 1))?;
                        tx.put(Counter::record(to.as_str(), to_balance + 1))
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for handle in writers {
        let _ = handle.join();
    }
    done.store(true, Ordering::Release);
    for handle in readers {
        let _ = handle.join();
    }

    let result = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );
    (result, torn.load(Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestStore;

    fn shared_store() -> Arc<ObjectStore> {
        let TestStore { store, .. } = TestStore::memory();
        Arc::new(store)
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let config = StressConfig {
            operations: 50,
            ..Default::default()
        };
        let (result, total) = stress_counter_increments(shared_store(), &config);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.successful_ops, config.operations * config.threads);
        assert_eq!(total, result.successful_ops as i64);
    }

    #[test]
    fn transfers_keep_snapshot_totals() {
        let config = StressConfig {
            operations: 50,
            ..Default::default()
        };
        let store = shared_store();
        let (result, torn) = stress_transfers(Arc::clone(&store), &config, 100);
        result.print_summary("transfers");
        assert_eq!(result.failed_ops, 0);
        assert_eq!(torn, 0);
        store.flush_all();
    }
}
