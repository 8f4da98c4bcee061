//! # objstore Testkit
//!
//! Test utilities for objstore.
//!
//! This crate provides:
//! - Record fixtures and store helpers
//! - Property-based test generators using proptest
//! - A model-checking harness comparing the store with a `BTreeMap`
//! - Stress testing utilities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use objstore_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_store() {
//!     with_temp_store(|store| {
//!         put_counter(store, "a", 1).fence();
//!         assert_eq!(read_counter(store, "a"), Some(1));
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod integration;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::integration::*;
    pub use crate::stress::*;
}

pub use fixtures::*;
pub use generators::*;
pub use integration::*;
pub use stress::*;
