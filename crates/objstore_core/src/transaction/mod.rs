//! Optimistic transactions.
//!
//! objstore transactions provide:
//! - **Atomicity**: a commit publishes all of its writes or none
//! - **Isolation**: reads served from a snapshot taken at `begin`, validated
//!   at commit; WRITE reads locked
//! - **Derived state**: pre-commit hooks run to a fixpoint inside the commit
//! - **Durability on demand**: [`CommitHandle::fence`] waits for write-back

mod cursor;
mod hooks;
mod manager;
mod state;

pub use cursor::TxCursor;
pub use hooks::PreCommitHook;
pub use manager::{CommitHandle, TransactionManager};
pub use state::{LockingStrategy, Transaction, TransactionState, TxWrite};
