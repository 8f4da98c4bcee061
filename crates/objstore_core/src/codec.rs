//! Record serialization.
//!
//! The store persists records through a pluggable [`ObjectSerializer`].
//! [`TaggedSerializer`] is the stock implementation: each record type is
//! registered under a string tag and encoded as a tagged CBOR envelope.

use crate::error::{CoreError, CoreResult};
use crate::record::Record;
use objstore_codec::{decode_tagged, encode_tagged, TaggedValue};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Converts records to and from payload bytes.
///
/// The version prefix of a stored object is handled by the store; a
/// serializer only sees the payload.
pub trait ObjectSerializer: Send + Sync {
    /// Encodes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record kind is unknown to the serializer.
    fn serialize(&self, record: &dyn Record) -> CoreResult<Vec<u8>>;

    /// Decodes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is malformed or of an unknown kind.
    fn deserialize(&self, payload: &[u8]) -> CoreResult<Arc<dyn Record>>;
}

type EncodeFn = fn(&'static str, &dyn Record) -> CoreResult<Vec<u8>>;
type DecodeFn = fn(TaggedValue) -> CoreResult<Arc<dyn Record>>;

fn encode<T: Record + Serialize>(tag: &'static str, record: &dyn Record) -> CoreResult<Vec<u8>> {
    let typed = record
        .downcast_ref::<T>()
        .ok_or_else(|| CoreError::unknown_kind(record.type_name()))?;
    Ok(encode_tagged(tag, typed)?)
}

fn decode<T: Record + DeserializeOwned>(value: TaggedValue) -> CoreResult<Arc<dyn Record>> {
    let record: T = value.into_body()?;
    Ok(Arc::new(record))
}

/// Serializer dispatching on registered record types.
///
/// ```
/// use objstore_core::{ObjectSerializer, Record, TaggedSerializer};
/// use objstore_storage::ObjectKey;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Counter { name: String, value: u64 }
///
/// impl Record for Counter {
///     fn key(&self) -> ObjectKey { ObjectKey::new(format!("counter/{}", self.name)) }
/// }
///
/// let serializer = TaggedSerializer::new().register::<Counter>("counter");
/// let bytes = serializer.serialize(&Counter { name: "a".into(), value: 3 }).unwrap();
/// let record = serializer.deserialize(&bytes).unwrap();
/// assert_eq!(record.downcast_ref::<Counter>().unwrap().value, 3);
/// ```
#[derive(Default)]
pub struct TaggedSerializer {
    encoders: HashMap<TypeId, (&'static str, EncodeFn)>,
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TaggedSerializer {
    /// Creates a serializer with no registered types.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `tag`. Registering a tag again replaces it.
    #[must_use]
    pub fn register<T: Record + Serialize + DeserializeOwned>(mut self, tag: &'static str) -> Self {
        self.encoders.insert(TypeId::of::<T>(), (tag, encode::<T>));
        self.decoders.insert(tag, decode::<T>);
        self
    }

    /// Returns the tag `T` is registered under.
    #[must_use]
    pub fn tag_of<T: Record>(&self) -> Option<&'static str> {
        self.encoders.get(&TypeId::of::<T>()).map(|(tag, _)| *tag)
    }
}

impl ObjectSerializer for TaggedSerializer {
    fn serialize(&self, record: &dyn Record) -> CoreResult<Vec<u8>> {
        let (tag, encode) = self
            .encoders
            .get(&Any::type_id(record.as_any()))
            .ok_or_else(|| CoreError::unknown_kind(record.type_name()))?;
        encode(tag, record)
    }

    fn deserialize(&self, payload: &[u8]) -> CoreResult<Arc<dyn Record>> {
        let value = decode_tagged(payload)?;
        let decode = self
            .decoders
            .get(value.tag())
            .ok_or_else(|| CoreError::unknown_kind(value.tag()))?;
        decode(value)
    }
}

impl fmt::Debug for TaggedSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.decoders.keys().copied().collect();
        tags.sort_unstable();
        f.debug_struct("TaggedSerializer").field("tags", &tags).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objstore_storage::ObjectKey;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Dir {
        path: String,
        entries: Vec<String>,
    }

    impl Record for Dir {
        fn key(&self) -> ObjectKey {
            ObjectKey::new(format!("dir:{}", self.path))
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Unregistered {
        id: u32,
    }

    impl Record for Unregistered {
        fn key(&self) -> ObjectKey {
            ObjectKey::new(format!("u:{}", self.id))
        }
    }

    fn serializer() -> TaggedSerializer {
        TaggedSerializer::new().register::<Dir>("dir")
    }

    #[test]
    fn registered_type_roundtrips() {
        let dir = Dir {
            path: "/a".into(),
            entries: vec!["b".into(), "c".into()],
        };
        let s = serializer();
        let bytes = s.serialize(&dir).unwrap();
        let back = s.deserialize(&bytes).unwrap();
        assert_eq!(back.downcast_ref::<Dir>(), Some(&dir));
        assert_eq!(s.tag_of::<Dir>(), Some("dir"));
    }

    #[test]
    fn unregistered_type_is_rejected() {
        let err = serializer().serialize(&Unregistered { id: 1 }).unwrap_err();
        assert!(matches!(err, CoreError::UnknownKind { .. }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let bytes = encode_tagged("file", &1u8).unwrap();
        let err = serializer().deserialize(&bytes).unwrap_err();
        match err {
            CoreError::UnknownKind { kind } => assert_eq!(kind, "file"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        let err = serializer().deserialize(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::Codec(_)));
    }
}
