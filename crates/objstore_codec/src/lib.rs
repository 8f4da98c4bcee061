//! # objstore Codec
//!
//! Byte layouts for stored objects.
//!
//! ## Versioned frame
//!
//! Every persisted object is an 8-byte big-endian version (the id of the
//! transaction that wrote it) followed by serializer-specific payload bytes.
//! The version can be read without touching the payload, which lets upper
//! layers decode records lazily.
//!
//! ## Tagged CBOR payloads
//!
//! [`encode_tagged`] and [`decode_tagged`] wrap a serde value in a small
//! envelope carrying a type tag, so a reader can pick the concrete record
//! type before decoding the body.
//!
//! ## Usage
//!
//! ```
//! use objstore_codec::{decode_frame, decode_tagged, encode_frame, encode_tagged};
//!
//! let payload = encode_tagged("counter", &42u64).unwrap();
//! let frame = encode_frame(7, &payload);
//!
//! let (version, payload) = decode_frame(&frame).unwrap();
//! assert_eq!(version, 7);
//!
//! let tagged = decode_tagged(&payload).unwrap();
//! assert_eq!(tagged.tag(), "counter");
//! assert_eq!(tagged.into_body::<u64>().unwrap(), 42);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cbor;
mod error;
mod frame;

pub use cbor::{decode_tagged, encode_tagged, from_cbor, to_cbor, TaggedValue};
pub use error::{CodecError, CodecResult};
pub use frame::{decode_frame, encode_frame, peek_version, VERSION_PREFIX_LEN};
