//! Model-checking harness.
//!
//! Applies operations to a store and to a plain `BTreeMap`, then checks
//! that every view of the store agrees with the model.

use crate::fixtures::{scan_snapshot, Counter, TestStore};
use crate::generators::Op;
use objstore_core::{Cursor, IteratorStart, LockingStrategy, ObjectKey, Snapshot, TransactionId};
use std::collections::BTreeMap;

/// A store paired with the state it should hold.
pub struct ModelHarness {
    /// The store under test.
    pub store: TestStore,
    model: BTreeMap<String, i64>,
    history: Vec<(TransactionId, BTreeMap<String, i64>)>,
}

impl ModelHarness {
    /// Creates a harness over an in-memory store.
    pub fn new() -> Self {
        Self::over(TestStore::memory())
    }

    /// Creates a harness over an existing, empty store.
    pub fn over(store: TestStore) -> Self {
        Self {
            store,
            model: BTreeMap::new(),
            history: Vec::new(),
        }
    }

    /// Commits `ops` as one transaction and applies them to the model.
    ///
    /// Returns the id the transaction committed under.
    pub fn apply(&mut self, ops: &[Op]) -> TransactionId {
        let mut tx = self.store.begin();
        for op in ops {
            match op {
                Op::Put(key, value) => tx.put(Counter::record(key.as_str(), *value)),
                Op::Delete(key) => tx.delete(&ObjectKey::new(key)),
            }
            .expect("Failed to buffer write");
        }
        let id = tx.id();
        self.store.commit(&mut tx).expect("Failed to commit");

        for op in ops {
            match op {
                Op::Put(key, value) => {
                    self.model.insert(key.clone(), *value);
                }
                Op::Delete(key) => {
                    self.model.remove(key);
                }
            }
        }
        self.history.push((id, self.model.clone()));
        id
    }

    /// Returns the modelled state.
    pub fn model(&self) -> &BTreeMap<String, i64> {
        &self.model
    }

    /// Returns the modelled state as of commit `id`.
    pub fn model_at(&self, id: TransactionId) -> BTreeMap<String, i64> {
        self.history
            .iter()
            .rev()
            .find(|(committed, _)| *committed <= id)
            .map(|(_, state)| state.clone())
            .unwrap_or_default()
    }

    /// Checks a snapshot scan, point reads and transactional reads against the model.
    pub fn verify(&self) {
        let snapshot = self.store.snapshot().expect("Failed to open snapshot");
        self.verify_snapshot(&snapshot, &self.model);

        let mut tx = self.store.begin();
        for (key, expected) in &self.model {
            let actual = tx
                .get::<Counter>(&ObjectKey::new(key), LockingStrategy::Optimistic)
                .expect("Failed to read")
                .map(|counter| counter.value);
            assert_eq!(actual, Some(*expected), "transactional read mismatch for {key}");
        }
        self.store.rollback(&mut tx);
    }

    /// Checks that `snapshot` shows exactly `expected`.
    pub fn verify_snapshot(&self, snapshot: &Snapshot, expected: &BTreeMap<String, i64>) {
        let scanned = scan_snapshot(&snapshot.scan_from(&ObjectKey::min()).expect("Failed to scan"));
        let wanted: Vec<(String, i64)> = expected.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(scanned, wanted, "snapshot {} diverged from model", snapshot.id());

        for (key, value) in expected {
            let actual = snapshot
                .get::<Counter>(&ObjectKey::new(key))
                .expect("Failed to read")
                .map(|counter| counter.value);
            assert_eq!(actual, Some(*value), "snapshot point read mismatch for {key}");
        }
    }

    /// Opens a cursor under every start bound at every modelled key and
    /// checks the first entry against the model.
    pub fn verify_bounds(&self, snapshot: &Snapshot) {
        let state = self.model_at(snapshot.id());
        for anchor in state.keys() {
            for start in [IteratorStart::Ge, IteratorStart::Gt, IteratorStart::Le, IteratorStart::Lt] {
                let expected = match start {
                    IteratorStart::Ge | IteratorStart::Gt => state.keys().find(|key| start.admits(*key, anchor)),
                    IteratorStart::Le | IteratorStart::Lt => state
                        .keys()
                        .rev()
                        .find(|key| start.admits(*key, anchor))
                        .or_else(|| state.keys().next()),
                };
                let mut cursor = snapshot
                    .cursor(start, &ObjectKey::new(anchor))
                    .expect("Failed to open cursor");
                let first = cursor.next().expect("Failed to step cursor").map(|(key, _)| key.to_string());
                assert_eq!(first.as_ref(), expected, "{start:?} {anchor} diverged from model");
            }
        }
    }

    /// Returns the number of modelled keys.
    pub fn tracked_count(&self) -> usize {
        self.model.len()
    }
}

impl Default for ModelHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_tracks_puts_and_deletes() {
        let mut harness = ModelHarness::new();
        harness.apply(&[Op::Put("a".into(), 1), Op::Put("b".into(), 2)]);
        harness.apply(&[Op::Delete("a".into()), Op::Put("c".into(), 3)]);
        assert_eq!(harness.tracked_count(), 2);
        harness.verify();
    }

    #[test]
    fn model_at_returns_earlier_state() {
        let mut harness = ModelHarness::new();
        let first = harness.apply(&[Op::Put("a".into(), 1)]);
        harness.apply(&[Op::Put("a".into(), 2)]);
        assert_eq!(harness.model_at(first).get("a"), Some(&1));
        assert!(harness.model_at(TransactionId::ZERO).is_empty());
    }
}
