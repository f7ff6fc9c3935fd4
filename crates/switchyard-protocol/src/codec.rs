//! Codec for encoding and decoding link envelopes.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum envelope size (16 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// Not enough data to decode.
    #[error("Incomplete data: need {0} more bytes")]
    Incomplete(usize),

    /// Route key does not fit its length prefix.
    #[error("Route key of {0} bytes is too long")]
    RouteKeyTooLong(usize),

    /// Route key is not valid UTF-8.
    #[error("Route key is not valid UTF-8")]
    InvalidRouteKey,

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Invalid data.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode an envelope to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded envelope
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode an envelope into an existing buffer.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode_into(envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(envelope)?;

    if body.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(body.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.extend_from_slice(&body);

    Ok(())
}

/// Decode an envelope from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let envelope = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(envelope)
}

/// Try to decode an envelope from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(envelope))` if a complete envelope was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the envelope is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(length);
    let envelope = rmp_serde::from_slice(&body)?;

    Ok(Some(envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use crate::headers::{keys, Headers, InstanceType};
    use crate::route::RouteMetadata;

    #[test]
    fn test_encode_decode_roundtrip() {
        let routed = frame::encode(&RouteMetadata::room("r1"), b"payload").unwrap();
        let envelopes = vec![
            Envelope::setup("connect", "L:logic-1", "token123"),
            Envelope::accepted("sess-1", 30_000),
            Envelope::rejected(4001, "Invalid token"),
            Envelope::open("channel"),
            Envelope::message(
                Headers::new()
                    .with(keys::USER_ID, "u1")
                    .with(keys::INSTANCE_TYPE, InstanceType::Access.code()),
                routed,
            ),
            Envelope::ping(1234),
            Envelope::pong(None),
        ];

        for envelope in envelopes {
            let encoded = encode(&envelope).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let encoded = encode(&Envelope::open("channel")).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_envelope_too_large() {
        let large = Envelope::message(Headers::new(), vec![0u8; MAX_ENVELOPE_SIZE + 1]);

        match encode(&large) {
            Err(ProtocolError::EnvelopeTooLarge(_)) => {}
            other => panic!("Expected EnvelopeTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_ENVELOPE_SIZE + 1) as u32);
        assert!(matches!(
            decode_from(&mut buf),
            Err(ProtocolError::EnvelopeTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let first = Envelope::open("channel");
        let second = Envelope::ping(7);

        let mut buf = BytesMut::new();
        encode_into(&first, &mut buf).unwrap();
        encode_into(&second, &mut buf).unwrap();

        // A split read must not yield anything until the bytes are complete.
        let mut partial = buf.split_to(3);
        assert!(decode_from(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        let mut buf = partial;

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}
