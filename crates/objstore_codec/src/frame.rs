//! Version-prefixed object frames.

use crate::error::{CodecError, CodecResult};
use bytes::{BufMut, Bytes, BytesMut};

/// Length of the big-endian version prefix.
pub const VERSION_PREFIX_LEN: usize = 8;

/// Prepends `version` to `payload`.
#[must_use]
pub fn encode_frame(version: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(VERSION_PREFIX_LEN + payload.len());
    buf.put_u64(version);
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads the version prefix without looking at the payload.
///
/// # Errors
///
/// Returns [`CodecError::TruncatedFrame`] if `frame` is shorter than the prefix.
pub fn peek_version(frame: &[u8]) -> CodecResult<u64> {
    let prefix: [u8; VERSION_PREFIX_LEN] = frame
        .get(..VERSION_PREFIX_LEN)
        .and_then(|p| p.try_into().ok())
        .ok_or(CodecError::TruncatedFrame { len: frame.len() })?;
    Ok(u64::from_be_bytes(prefix))
}

/// Splits a frame into its version and payload.
///
/// The payload shares the frame's buffer.
///
/// # Errors
///
/// Returns [`CodecError::TruncatedFrame`] if `frame` is shorter than the prefix.
pub fn decode_frame(frame: &Bytes) -> CodecResult<(u64, Bytes)> {
    let version = peek_version(frame)?;
    Ok((version, frame.slice(VERSION_PREFIX_LEN..)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_prefix_is_big_endian() {
        let frame = encode_frame(0x0102_0304_0506_0708, b"xy");
        assert_eq!(&frame[..], &[1, 2, 3, 4, 5, 6, 7, 8, b'x', b'y']);
    }

    #[test]
    fn frame_decode_splits_payload() {
        let frame = encode_frame(42, b"payload");
        let (version, payload) = decode_frame(&frame).unwrap();
        assert_eq!(version, 42);
        assert_eq!(&payload[..], b"payload");
    }

    #[test]
    fn frame_with_empty_payload() {
        let frame = encode_frame(u64::MAX, b"");
        assert_eq!(frame.len(), VERSION_PREFIX_LEN);
        let (version, payload) = decode_frame(&frame).unwrap();
        assert_eq!(version, u64::MAX);
        assert!(payload.is_empty());
    }

    #[test]
    fn frame_too_short_fails() {
        assert_eq!(peek_version(&[0u8; 7]), Err(CodecError::TruncatedFrame { len: 7 }));
        assert!(decode_frame(&Bytes::new()).is_err());
    }
}
