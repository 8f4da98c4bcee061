//! # objstore Storage
//!
//! Persistent object backends for objstore.
//!
//! This crate is the lowest layer of the store. Backends keep **opaque byte
//! objects** addressed by [`ObjectKey`]; they know nothing about versions,
//! records or transactions.
//!
//! ## Design Principles
//!
//! - Writes are staged with [`PersistentStore::write_object`] and become
//!   visible only through an atomic [`PersistentStore::commit_manifest`]
//! - Point reads and ordered cursors see only committed objects
//! - Must be `Send + Sync`: the write-back pipeline stages objects from
//!   several worker threads at once
//!
//! ## Available Backends
//!
//! - [`InMemoryStore`] - For testing and ephemeral stores
//! - [`FileStore`] - One file per object, crash-safe manifest commits
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use objstore_storage::{InMemoryStore, ObjectKey, PersistentStore, TxManifest};
//!
//! let store = InMemoryStore::new();
//! let key = ObjectKey::new("inode/1");
//! store.write_object(&key, Bytes::from_static(b"hello")).unwrap();
//! assert!(store.read_object(&key).unwrap().is_none());
//!
//! store.commit_manifest(&TxManifest::new(vec![key.clone()], vec![])).unwrap();
//! assert_eq!(store.read_object(&key).unwrap().unwrap(), &b"hello"[..]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod key;
mod memory;

pub use backend::{PersistentStore, TxManifest};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use key::ObjectKey;
pub use memory::InMemoryStore;
