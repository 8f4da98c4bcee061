//! Pre-commit hooks.

use crate::error::CoreResult;
use crate::record::Record;
use crate::transaction::state::Transaction;
use objstore_storage::ObjectKey;
use std::sync::Arc;

/// Observer of the writes a commit is about to publish.
///
/// During commit every buffered write is classified against the key's
/// current value and handed to each registered hook in ascending
/// [`priority`](PreCommitHook::priority). Hooks may read through and write
/// to the committing transaction; writes they add are classified and passed
/// through the hooks again, until a pass adds nothing.
///
/// An error returned by a hook aborts the commit.
pub trait PreCommitHook: Send + Sync {
    /// Ordering among hooks; lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// A key without a current value is being written.
    fn on_create(&self, _tx: &mut Transaction, _key: &ObjectKey, _record: &Arc<dyn Record>) -> CoreResult<()> {
        Ok(())
    }

    /// An existing value is being replaced.
    fn on_change(
        &self,
        _tx: &mut Transaction,
        _key: &ObjectKey,
        _old: &Arc<dyn Record>,
        _new: &Arc<dyn Record>,
    ) -> CoreResult<()> {
        Ok(())
    }

    /// An existing value is being deleted.
    fn on_delete(&self, _tx: &mut Transaction, _key: &ObjectKey, _old: &Arc<dyn Record>) -> CoreResult<()> {
        Ok(())
    }
}

/// Classification of one write against the key's current value.
pub(crate) enum Change {
    Create(Arc<dyn Record>),
    Update(Arc<dyn Record>, Arc<dyn Record>),
    Remove(Arc<dyn Record>),
}

impl Change {
    /// Returns `None` for a delete of a key that has no value.
    pub(crate) fn classify(old: Option<Arc<dyn Record>>, new: Option<Arc<dyn Record>>) -> Option<Self> {
        match (old, new) {
            (None, Some(new)) => Some(Self::Create(new)),
            (Some(old), Some(new)) => Some(Self::Update(old, new)),
            (Some(old), None) => Some(Self::Remove(old)),
            (None, None) => None,
        }
    }

    pub(crate) fn dispatch(&self, hook: &dyn PreCommitHook, tx: &mut Transaction, key: &ObjectKey) -> CoreResult<()> {
        match self {
            Self::Create(new) => hook.on_create(tx, key, new),
            Self::Update(old, new) => hook.on_change(tx, key, old, new),
            Self::Remove(old) => hook.on_delete(tx, key, old),
        }
    }
}
