//! CBOR payload helpers.

use crate::error::{CodecError, CodecResult};
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Encodes a serde value as CBOR.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> CodecResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| CodecError::encoding_failed(e.to_string()))?;
    Ok(out)
}

/// Decodes a serde value from CBOR.
///
/// # Errors
///
/// Returns an error if the bytes are not valid CBOR for `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    ciborium::from_reader(bytes).map_err(|e| CodecError::decoding_failed(e.to_string()))
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: ?Sized> {
    tag: &'a str,
    body: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    tag: String,
    body: Value,
}

/// Encodes `body` in an envelope carrying `tag`.
///
/// # Errors
///
/// Returns an error if the body cannot be serialized.
pub fn encode_tagged<T: Serialize + ?Sized>(tag: &str, body: &T) -> CodecResult<Vec<u8>> {
    to_cbor(&EnvelopeRef { tag, body })
}

/// Decodes an envelope written by [`encode_tagged`], leaving the body undecoded.
///
/// # Errors
///
/// Returns an error if the bytes are not a tagged envelope.
pub fn decode_tagged(bytes: &[u8]) -> CodecResult<TaggedValue> {
    let envelope: Envelope = from_cbor(bytes)?;
    Ok(TaggedValue {
        tag: envelope.tag,
        body: envelope.body,
    })
}

/// A decoded envelope whose body is still generic CBOR.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedValue {
    tag: String,
    body: Value,
}

impl TaggedValue {
    /// Returns the type tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Decodes the body as `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match `T`.
    pub fn into_body<T: DeserializeOwned>(self) -> CodecResult<T> {
        self.body
            .deserialized()
            .map_err(|e| CodecError::decoding_failed(format!("body of {:?}: {e}", self.tag)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Inode {
        name: String,
        size: u64,
        children: Vec<String>,
    }

    #[test]
    fn tagged_struct_roundtrip() {
        let inode = Inode {
            name: "root".into(),
            size: 4096,
            children: vec!["a".into(), "b".into()],
        };
        let bytes = encode_tagged("inode", &inode).unwrap();
        let tagged = decode_tagged(&bytes).unwrap();
        assert_eq!(tagged.tag(), "inode");
        assert_eq!(tagged.into_body::<Inode>().unwrap(), inode);
    }

    #[test]
    fn tagged_body_type_mismatch_fails() {
        let bytes = encode_tagged("number", &7u32).unwrap();
        let err = decode_tagged(&bytes).unwrap().into_body::<Inode>().unwrap_err();
        assert!(matches!(err, CodecError::DecodingFailed { .. }));
    }

    #[test]
    fn untagged_bytes_are_rejected() {
        let bytes = to_cbor(&"just a string").unwrap();
        assert!(decode_tagged(&bytes).is_err());
        assert!(from_cbor::<u8>(&[0xff, 0x00]).is_err());
    }

    proptest! {
        #[test]
        fn tagged_strings_survive(tag in "[a-z]{1,12}", body in ".*") {
            let bytes = encode_tagged(&tag, &body).unwrap();
            let tagged = decode_tagged(&bytes).unwrap();
            prop_assert_eq!(tagged.tag(), tag.as_str());
            prop_assert_eq!(tagged.into_body::<String>().unwrap(), body);
        }
    }
}
