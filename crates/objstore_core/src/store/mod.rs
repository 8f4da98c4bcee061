//! Record-level views of the persistent backend.
//!
//! - [`SerializingStore`] converts between [`crate::VersionedRecord`] and
//!   versioned frames in the backend
//! - [`CachingStore`] keeps recently read records in a byte-bounded LRU

mod caching;
mod serializing;

pub use caching::CachingStore;
pub use serializing::SerializingStore;
