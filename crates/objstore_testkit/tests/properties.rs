//! End-to-end properties of the object store.

use objstore_codec::decode_frame;
use objstore_core::{downcast_record, CoreError, LockingStrategy, ObjectKey, Snapshot, TransactionId};
use objstore_storage::PersistentStore;
use objstore_testkit::prelude::*;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn value_in(snapshot: &Snapshot, name: &str) -> Option<i64> {
    snapshot
        .get::<Counter>(&ObjectKey::new(name))
        .unwrap()
        .map(|counter| counter.value)
}

#[test]
fn commits_become_visible_atomically() {
    let TestStore { store, .. } = TestStore::memory();
    let store = Arc::new(store);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut checked = 0usize;
            while !done.load(Ordering::Acquire) {
                let snapshot = store.snapshot().unwrap();
                let pair = (value_in(&snapshot, "left"), value_in(&snapshot, "right"));
                assert_eq!(pair.0, pair.1, "snapshot {} saw half a commit", snapshot.id());
                checked += 1;
                drop(snapshot);
                thread::sleep(Duration::from_micros(50));
            }
            checked
        })
    };

    for round in 0..200 {
        store
            .run_with_retry_default(|tx| {
                tx.put(Counter::record("left", round))?;
                tx.put(Counter::record("right", round))
            })
            .unwrap();
        if round % 50 == 0 {
            store.flush_all();
        }
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);
}

#[test]
fn transactions_never_see_half_a_commit() {
    let TestStore { store, .. } = TestStore::memory();
    let store = Arc::new(store);
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut checked = 0usize;
            while !done.load(Ordering::Acquire) {
                let mut tx = store.begin();
                let left = tx
                    .get::<Counter>(&ObjectKey::new("left"), LockingStrategy::Optimistic)
                    .unwrap()
                    .map(|counter| counter.value);
                thread::sleep(Duration::from_micros(100));
                let right = tx
                    .get::<Counter>(&ObjectKey::new("right"), LockingStrategy::Optimistic)
                    .unwrap()
                    .map(|counter| counter.value);
                assert_eq!(left, right, "transaction {} saw half a commit", tx.id());

                let scanned: Vec<i64> = tx
                    .range(&ObjectKey::new("left"), &ObjectKey::new("s"))
                    .unwrap()
                    .into_iter()
                    .map(|(_, record)| downcast_record::<Counter>(record).unwrap().value)
                    .collect();
                if let Some(value) = left {
                    assert_eq!(scanned, vec![value, value]);
                }
                store.rollback(&mut tx);
                checked += 1;
            }
            checked
        })
    };

    for round in 0..200 {
        store
            .run_with_retry_default(|tx| {
                tx.put(Counter::record("left", round))?;
                tx.put(Counter::record("right", round))
            })
            .unwrap();
        if round % 50 == 0 {
            store.flush_all();
        }
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);
}

#[test]
fn snapshot_is_stable_across_commits_and_flushes() {
    with_temp_store(|store| {
        put_counter(store, "a", 1);
        put_counter(store, "b", 1);
        let snapshot = store.snapshot().unwrap();

        put_counter(store, "a", 2);
        delete_key(store, "b");
        put_counter(store, "c", 3);
        store.flush_all();

        assert_eq!(value_in(&snapshot, "a"), Some(1));
        assert_eq!(value_in(&snapshot, "b"), Some(1));
        assert_eq!(value_in(&snapshot, "c"), None);
        assert_eq!(
            scan_snapshot(&snapshot.scan_from(&ObjectKey::min()).unwrap()),
            vec![("a".to_string(), 1), ("b".to_string(), 1)]
        );
        assert_eq!(scan_counters(store), vec![("a".to_string(), 2), ("c".to_string(), 3)]);
    });
}

#[test]
fn versions_follow_commit_ids() {
    with_temp_store(|store| {
        let mut last = TransactionId::ZERO;
        for value in 0..10 {
            let handle = put_counter(store, "k", value);
            assert!(handle.tx_id() > last);
            last = handle.tx_id();

            let record = store.snapshot().unwrap().read(&ObjectKey::new("k")).unwrap().unwrap();
            assert_eq!(record.version(), handle.tx_id());
        }
    });
}

mod conflict_detection {
    use super::*;

    /// Opens two transactions that both read `k` at its current version.
    fn contenders(store: &objstore_core::ObjectStore) -> (objstore_core::Transaction, objstore_core::Transaction) {
        let key = ObjectKey::new("k");
        let mut older = store.begin();
        let mut newer = store.begin();
        assert!(older.id() < newer.id());
        for tx in [&mut older, &mut newer] {
            let seen = tx.get::<Counter>(&key, LockingStrategy::Optimistic).unwrap();
            assert_eq!(seen.map(|counter| counter.value), Some(3));
            tx.put(Counter::record("k", tx.id().as_u64() as i64)).unwrap();
        }
        (older, newer)
    }

    #[test]
    fn newer_commit_first_rejects_older() {
        with_temp_store(|store| {
            put_counter(store, "k", 3);
            let (mut older, mut newer) = contenders(store);

            store.commit(&mut newer).unwrap();
            let err = store.commit(&mut older).unwrap_err();
            assert!(matches!(err, CoreError::SerializationConflict { .. }), "{err:?}");
            assert!(err.is_retryable());
            assert_eq!(read_counter(store, "k"), Some(newer.id().as_u64() as i64));
        });
    }

    #[test]
    fn older_commit_first_rejects_newer() {
        with_temp_store(|store| {
            put_counter(store, "k", 3);
            let (mut older, mut newer) = contenders(store);

            store.commit(&mut older).unwrap();
            let err = store.commit(&mut newer).unwrap_err();
            assert!(matches!(err, CoreError::ReadInstability { .. }), "{err:?}");
            assert!(err.is_retryable());
            assert_eq!(read_counter(store, "k"), Some(older.id().as_u64() as i64));
        });
    }
}

#[test]
fn deletes_hide_older_versions() {
    with_temp_store(|store| {
        let written = put_counter(store, "k", 5);
        put_counter(store, "other", 1);
        let before = store.snapshot().unwrap();
        store.flush_all();

        let deleted = delete_key(store, "k");
        assert!(deleted.tx_id() > written.tx_id());
        let after = store.snapshot().unwrap();

        assert_eq!(value_in(&before, "k"), Some(5));
        assert_eq!(value_in(&after, "k"), None);
        assert_eq!(scan_snapshot(&after.scan_from(&ObjectKey::min()).unwrap()), vec![("other".to_string(), 1)]);

        store.flush_all();
        assert_eq!(value_in(&before, "k"), Some(5));
        assert_eq!(read_counter(store, "k"), None);
    });
}

#[test]
fn fenced_commits_reach_the_backend() {
    let store = TestStore::file();
    let handle = put_counter(&store, "k", 7);
    handle.fence();
    assert!(handle.is_durable());

    let frame = store.backend.read_object(&ObjectKey::new("k")).unwrap().unwrap();
    let (version, _) = decode_frame(&frame).unwrap();
    assert_eq!(version, handle.tx_id().as_u64());

    let deleted = delete_key(&store, "k");
    deleted.fence();
    assert!(store.backend.read_object(&ObjectKey::new("k")).unwrap().is_none());

    let store = store.reopen();
    assert_eq!(read_counter(&store, "k"), None);
    assert!(store.begin().id() > deleted.tx_id());
}

#[test]
fn scans_merge_flushed_and_pending_in_key_order() {
    with_temp_store(|store| {
        put_counter(store, "c", 3);
        put_counter(store, "a", 1);
        store.flush_all();
        put_counter(store, "d", 4);
        put_counter(store, "b", 2);

        let keys: Vec<String> = scan_counters(store).into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, ["a", "b", "c", "d"]);
    });
}

#[test]
fn releasing_last_snapshot_collects_versions() {
    with_temp_store(|store| {
        put_counter(store, "k", 1);
        let first = store.snapshot().unwrap();
        let same = store.create_snapshot(first.id()).unwrap();
        assert_eq!(store.snapshots().live_snapshots(), 1);

        put_counter(store, "k", 2);
        put_counter(store, "k", 3);
        assert!(store.snapshots().retained_versions() > 0);

        drop(first);
        assert_eq!(value_in(&same, "k"), Some(1));
        assert!(store.snapshots().retained_versions() > 0);

        drop(same);
        assert_eq!(store.snapshots().live_snapshots(), 0);
        assert_eq!(store.snapshots().retained_versions(), 0);
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_matches_model(history in history_strategy(), flush_every in 1usize..5) {
        let mut harness = ModelHarness::new();
        let mut snapshots = Vec::new();
        for (round, batch) in history.iter().enumerate() {
            harness.apply(batch);
            if round % flush_every == 0 {
                harness.store.flush_all();
            }
            snapshots.push(harness.store.snapshot().unwrap());
        }

        harness.verify();
        for snapshot in &snapshots {
            harness.verify_snapshot(snapshot, &harness.model_at(snapshot.id()));
            harness.verify_bounds(snapshot);
        }
    }
}
