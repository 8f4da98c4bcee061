//! Property-based test generators using proptest.
//!
//! Keys are drawn from a small alphabet so generated operations collide
//! often enough to exercise overwrites, deletes and tombstones.

use proptest::prelude::*;

/// One write applied by a generated workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Store `value` under `key`.
    Put(String, i64),
    /// Remove `key`.
    Delete(String),
}

impl Op {
    /// Returns the key the operation touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Put(key, _) | Self::Delete(key) => key,
        }
    }
}

/// Strategy for generating keys from a small, colliding key space.
pub fn key_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-f]{1,2}").expect("Invalid regex")
}

/// Strategy for generating one operation, puts three times as likely as deletes.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key_strategy(), any::<i64>()).prop_map(|(key, value)| Op::Put(key, value)),
        1 => key_strategy().prop_map(Op::Delete),
    ]
}

/// Strategy for generating a transaction's worth of operations.
pub fn batch_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..8)
}

/// Strategy for generating a history of transactions.
pub fn history_strategy() -> impl Strategy<Value = Vec<Vec<Op>>> {
    prop::collection::vec(batch_strategy(), 1..12)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::test_runner::TestRunner;
    use proptest::strategy::ValueTree;

    #[test]
    fn keys_stay_in_alphabet() {
        let mut runner = TestRunner::default();
        for _ in 0..100 {
            let key = key_strategy().new_tree(&mut runner).unwrap().current();
            assert!(!key.is_empty() && key.len() <= 2);
            assert!(key.chars().all(|c| ('a'..='f').contains(&c)));
        }
    }

    proptest! {
        #[test]
        fn batches_are_never_empty(batch in batch_strategy()) {
            prop_assert!(!batch.is_empty());
            prop_assert!(batch.iter().all(|op| !op.key().is_empty()));
        }
    }
}
