//! Error types for cursor operations.

use std::error::Error as StdError;
use thiserror::Error;

/// Result type for cursor operations.
pub type CursorResult<T> = Result<T, CursorError>;

/// Errors that can occur while walking a cursor.
#[derive(Debug, Error)]
pub enum CursorError {
    /// The structure under the cursor changed since it was built.
    ///
    /// This is an internal signal: [`crate::RefreshingCursor`] catches it and
    /// rebuilds the backing cursor. Seeing it anywhere else is a bug.
    #[error("cursor is stale: built at version {built}, structure is at {current}")]
    Stale {
        /// Structure version the cursor was built against.
        built: u64,
        /// Structure version observed now.
        current: u64,
    },

    /// A rebuilt cursor did not reproduce the entry it was expected to.
    #[error("cursor refresh lost its position: expected {expected}, found {found}")]
    Consistency {
        /// The key the cursor was positioned at.
        expected: String,
        /// What the rebuilt cursor offered instead.
        found: String,
    },

    /// `skip` was called on a cursor with no entry left in that direction.
    #[error("cursor has no more entries")]
    Exhausted,

    /// The source behind the cursor failed.
    #[error("cursor source failed: {0}")]
    Source(#[source] Box<dyn StdError + Send + Sync>),
}

impl CursorError {
    /// Wraps a source failure.
    pub fn source_failure(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Source(error.into())
    }

    /// Creates a consistency error from the expected key and what was found.
    pub fn consistency(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::Consistency {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Returns true for the internal staleness signal.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}
