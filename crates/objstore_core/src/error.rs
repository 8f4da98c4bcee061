//! Error types for objstore core.

use crate::types::TransactionId;
use objstore_storage::ObjectKey;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in objstore core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Persistent backend error.
    #[error("storage error: {0}")]
    Storage(#[from] objstore_storage::StorageError),

    /// I/O error outside the backend, such as failing to spawn the flusher.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame or payload codec error.
    #[error("codec error: {0}")]
    Codec(#[from] objstore_codec::CodecError),

    /// Cursor error.
    #[error("cursor error: {0}")]
    Cursor(#[from] objstore_cursor::CursorError),

    /// A key the transaction depends on was already written by a transaction
    /// with an id at least as high, or a live snapshot pins the transaction's id.
    #[error("serialization conflict for {tx} on {key}: current version {current_version}")]
    SerializationConflict {
        /// The aborted transaction.
        tx: TransactionId,
        /// The conflicting key.
        key: ObjectKey,
        /// The version that blocked the commit.
        current_version: TransactionId,
    },

    /// A value in the read set changed between the read and the commit.
    #[error("read of {key} by {tx} is no longer current")]
    ReadInstability {
        /// The aborted transaction.
        tx: TransactionId,
        /// The key whose value changed.
        key: ObjectKey,
    },

    /// A lock needed out of key order was held by someone else.
    #[error("{tx} could not lock {key} without risking deadlock")]
    LockContention {
        /// The aborted transaction.
        tx: TransactionId,
        /// The contended key.
        key: ObjectKey,
    },

    /// A record was read as a different kind than it is stored as.
    #[error("record {key} is a {found}, not a {expected}")]
    TypeMismatch {
        /// The key that was read.
        key: ObjectKey,
        /// The requested record type.
        expected: &'static str,
        /// The stored record type.
        found: &'static str,
    },

    /// A snapshot id below an already registered or committed id was requested.
    #[error("snapshot id {requested} is below {last}")]
    IllegalSnapshotId {
        /// The requested snapshot id.
        requested: TransactionId,
        /// The lowest id that may be registered now.
        last: TransactionId,
    },

    /// A forced flush did not make room in the write-back queue in time.
    #[error("write-back stalled: {queued} bytes queued over a limit of {limit}")]
    WritebackStalled {
        /// Bytes waiting to be flushed.
        queued: usize,
        /// The configured queue limit.
        limit: usize,
    },

    /// A snapshot id no transaction has been given yet was requested.
    #[error("snapshot id {requested} is not below the next transaction id {next}")]
    SnapshotAhead {
        /// The requested snapshot id.
        requested: TransactionId,
        /// The id the next transaction will get.
        next: TransactionId,
    },

    /// Pre-commit hooks kept producing writes past the configured bound.
    #[error("pre-commit hooks of {tx} did not settle after {iterations} passes")]
    HookFixpointExceeded {
        /// The aborted transaction.
        tx: TransactionId,
        /// Number of passes run.
        iterations: usize,
    },

    /// No serializer is registered for a record kind.
    #[error("unknown record kind: {kind}")]
    UnknownKind {
        /// The tag or type name that was not recognized.
        kind: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The store is shutting down and accepts no more commits.
    #[error("object store is shutting down")]
    ShuttingDown,

    /// An internal consistency check failed.
    #[error("consistency violation: {message}")]
    Consistency {
        /// Description of the violation.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a consistency error.
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency {
            message: message.into(),
        }
    }

    /// Creates an unknown kind error.
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
    }

    /// Returns true if re-running the whole unit of work may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SerializationConflict { .. } | Self::ReadInstability { .. } | Self::LockContention { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_retryable() {
        let key = ObjectKey::new("k");
        let tx = TransactionId::new(6);
        assert!(CoreError::SerializationConflict {
            tx,
            key: key.clone(),
            current_version: TransactionId::new(6)
        }
        .is_retryable());
        assert!(CoreError::ReadInstability { tx, key: key.clone() }.is_retryable());
        assert!(CoreError::LockContention { tx, key }.is_retryable());
    }

    #[test]
    fn caller_bugs_are_not_retryable() {
        let err = CoreError::IllegalSnapshotId {
            requested: TransactionId::new(1),
            last: TransactionId::new(2),
        };
        assert!(!err.is_retryable());
        assert!(!CoreError::SnapshotAhead {
            requested: TransactionId::new(9),
            next: TransactionId::new(3),
        }
        .is_retryable());
        assert!(!CoreError::WritebackStalled { queued: 10, limit: 1 }.is_retryable());
        assert!(!CoreError::ShuttingDown.is_retryable());
        assert!(!CoreError::invalid_operation("closed").is_retryable());
    }

    #[test]
    fn messages_name_the_key() {
        let err = CoreError::TypeMismatch {
            key: ObjectKey::new("inode/1"),
            expected: "Dir",
            found: "File",
        };
        assert_eq!(err.to_string(), "record inode/1 is a File, not a Dir");
    }
}
