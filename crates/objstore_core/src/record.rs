//! Records and versioned records.
//!
//! A [`Record`] is an immutable, polymorphic payload identified by exactly
//! one [`ObjectKey`]. The core never looks inside a record beyond its key,
//! its size estimate and its concrete type.
//!
//! A [`VersionedRecord`] pairs a record with the id of the transaction that
//! wrote it. Records read back from the persistent store are decoded lazily:
//! the version is known immediately, the payload is deserialized on first
//! access and cached.

use crate::codec::ObjectSerializer;
use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use bytes::Bytes;
use objstore_cursor::Kinded;
use objstore_storage::ObjectKey;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Size assumed for records that do not provide their own estimate.
pub const DEFAULT_SIZE_ESTIMATE: usize = 128;

/// Type-erasure helpers implemented for every sized record type.
///
/// This is a supertrait of [`Record`] so that `dyn Record` can be
/// downcast back to its concrete type.
pub trait AsAny: Any + Send + Sync {
    /// Returns `self` as [`Any`].
    fn as_any(&self) -> &dyn Any;

    /// Converts a shared record into a shared [`Any`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Returns the name of the concrete type.
    fn type_name(&self) -> &'static str;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A record stored in the object store.
pub trait Record: AsAny + fmt::Debug {
    /// The key this record is stored under.
    fn key(&self) -> ObjectKey;

    /// Approximate in-memory size in bytes, used for write-back and cache accounting.
    fn size_estimate(&self) -> usize {
        DEFAULT_SIZE_ESTIMATE
    }
}

impl dyn Record {
    /// Returns true if the record is a `T`.
    #[must_use]
    pub fn is<T: Record>(&self) -> bool {
        self.as_any().is::<T>()
    }

    /// Returns the record as a `T`, if it is one.
    #[must_use]
    pub fn downcast_ref<T: Record>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Downcasts a shared record to its concrete type.
///
/// # Errors
///
/// Returns [`CoreError::TypeMismatch`] if the record is not a `T`.
pub fn downcast_record<T: Record>(record: Arc<dyn Record>) -> CoreResult<Arc<T>> {
    let found = (*record).type_name();
    let key = record.key();
    record
        .into_any()
        .downcast::<T>()
        .map_err(|_| CoreError::TypeMismatch {
            key,
            expected: std::any::type_name::<T>(),
            found,
        })
}

/// Kind reported for lazily read records whose payload is not decoded yet.
#[derive(Debug)]
pub struct Undecoded;

enum Payload {
    Eager(Arc<dyn Record>),
    Lazy {
        bytes: Bytes,
        serializer: Arc<dyn ObjectSerializer>,
        decoded: OnceLock<Arc<dyn Record>>,
    },
}

/// A record together with its version.
///
/// Cloning is cheap: clones share the payload, including a lazily decoded one.
#[derive(Clone)]
pub struct VersionedRecord {
    version: TransactionId,
    payload: Arc<Payload>,
}

impl VersionedRecord {
    /// Wraps an in-memory record written by transaction `version`.
    pub fn new(version: TransactionId, record: Arc<dyn Record>) -> Self {
        Self {
            version,
            payload: Arc::new(Payload::Eager(record)),
        }
    }

    /// Wraps serialized payload bytes that are decoded on first access.
    pub(crate) fn lazy(version: TransactionId, bytes: Bytes, serializer: Arc<dyn ObjectSerializer>) -> Self {
        Self {
            version,
            payload: Arc::new(Payload::Lazy {
                bytes,
                serializer,
                decoded: OnceLock::new(),
            }),
        }
    }

    /// The id of the transaction that wrote this record.
    #[must_use]
    pub const fn version(&self) -> TransactionId {
        self.version
    }

    /// Returns the record, decoding the payload if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a lazy payload fails to deserialize. The failure
    /// is not cached; a later call decodes again.
    pub fn record(&self) -> CoreResult<Arc<dyn Record>> {
        match &*self.payload {
            Payload::Eager(record) => Ok(Arc::clone(record)),
            Payload::Lazy {
                bytes,
                serializer,
                decoded,
            } => {
                if let Some(record) = decoded.get() {
                    return Ok(Arc::clone(record));
                }
                let record = serializer.deserialize(bytes)?;
                Ok(Arc::clone(decoded.get_or_init(|| record)))
            }
        }
    }

    /// Returns the record if it is available without decoding.
    #[must_use]
    pub fn decoded(&self) -> Option<&Arc<dyn Record>> {
        match &*self.payload {
            Payload::Eager(record) => Some(record),
            Payload::Lazy { decoded, .. } => decoded.get(),
        }
    }

    /// Returns the record as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TypeMismatch`] if the stored record is of
    /// another kind, or a decoding error.
    pub fn downcast<T: Record>(&self) -> CoreResult<Arc<T>> {
        downcast_record(self.record()?)
    }

    /// Approximate size in bytes, known without decoding.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        match &*self.payload {
            Payload::Eager(record) => record.size_estimate(),
            Payload::Lazy { bytes, .. } => bytes.len(),
        }
    }

    /// Returns true if both handles refer to the same stored value.
    #[must_use]
    pub fn same_value(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl Kinded for VersionedRecord {
    fn kind(&self) -> TypeId {
        self.decoded()
            .map_or(TypeId::of::<Undecoded>(), |record| Any::type_id((**record).as_any()))
    }
}

impl fmt::Debug for VersionedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("VersionedRecord");
        out.field("version", &self.version);
        match &*self.payload {
            Payload::Eager(record) => out.field("record", record),
            Payload::Lazy { bytes, decoded, .. } => match decoded.get() {
                Some(record) => out.field("record", record),
                None => out.field("undecoded_len", &bytes.len()),
            },
        };
        out.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Note {
        key: ObjectKey,
        text: String,
    }

    impl Record for Note {
        fn key(&self) -> ObjectKey {
            self.key.clone()
        }

        fn size_estimate(&self) -> usize {
            self.text.len()
        }
    }

    #[derive(Debug)]
    struct Counter {
        key: ObjectKey,
    }

    impl Record for Counter {
        fn key(&self) -> ObjectKey {
            self.key.clone()
        }
    }

    fn note(text: &str) -> Arc<dyn Record> {
        Arc::new(Note {
            key: ObjectKey::new("note"),
            text: text.to_string(),
        })
    }

    #[test]
    fn downcast_to_concrete_type() {
        let record = note("hello");
        assert!(record.is::<Note>());
        assert_eq!(record.downcast_ref::<Note>().unwrap().text, "hello");

        let typed = downcast_record::<Note>(record).unwrap();
        assert_eq!(typed.text, "hello");
    }

    #[test]
    fn downcast_reports_mismatch() {
        let err = downcast_record::<Counter>(note("x")).unwrap_err();
        match err {
            CoreError::TypeMismatch { key, expected, found } => {
                assert_eq!(key.as_str(), "note");
                assert!(expected.ends_with("Counter"));
                assert!(found.ends_with("Note"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn eager_record_reports_kind() {
        let versioned = VersionedRecord::new(TransactionId::new(3), note("abc"));
        assert_eq!(versioned.version(), TransactionId::new(3));
        assert_eq!(versioned.kind(), TypeId::of::<Note>());
        assert_eq!(versioned.size_estimate(), 3);
    }

    #[test]
    fn default_size_estimate() {
        let counter: Arc<dyn Record> = Arc::new(Counter {
            key: ObjectKey::new("c"),
        });
        let versioned = VersionedRecord::new(TransactionId::new(1), counter);
        assert_eq!(versioned.size_estimate(), DEFAULT_SIZE_ESTIMATE);
    }

    #[test]
    fn clones_share_value() {
        let a = VersionedRecord::new(TransactionId::new(9), note("v"));
        let b = a.clone();
        assert!(a.same_value(&b));
        let c = VersionedRecord::new(TransactionId::new(10), note("v"));
        assert!(!a.same_value(&c));
    }
}
