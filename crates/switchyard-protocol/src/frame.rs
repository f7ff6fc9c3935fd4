//! Routed frame codec.
//!
//! A frame pairs route metadata with an opaque payload:
//!
//! ```text
//! [metadataLength: u16][metadata: metadataLength bytes][payload: remaining bytes]
//! ```
//!
//! The payload is never interpreted. Decoding hands back a slice of the
//! input buffer, so forwarding a decoded payload does not copy it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::ProtocolError;
use crate::route::{decode_metadata, encode_metadata, RouteMetadata, METADATA_HEADER_SIZE};

/// Size of the metadata length prefix.
pub const METADATA_LENGTH_SIZE: usize = 2;

/// Longest route key that still fits the frame's `u16` metadata length.
pub const MAX_FRAME_ROUTE_KEY_LEN: usize = u16::MAX as usize - METADATA_HEADER_SIZE;

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedFrame {
    /// Routing information.
    pub metadata: RouteMetadata,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl RoutedFrame {
    /// Create a frame.
    #[must_use]
    pub fn new(metadata: RouteMetadata, payload: impl Into<Bytes>) -> Self {
        Self {
            metadata,
            payload: payload.into(),
        }
    }

    /// Encode this frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the route key is too long for a frame.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode(&self.metadata, &self.payload)
    }
}

/// Encode route metadata and payload into one frame.
///
/// # Errors
///
/// Returns [`ProtocolError::RouteKeyTooLong`] if the route key exceeds
/// [`MAX_FRAME_ROUTE_KEY_LEN`].
pub fn encode(metadata: &RouteMetadata, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(metadata, payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns [`ProtocolError::RouteKeyTooLong`] if the route key exceeds
/// [`MAX_FRAME_ROUTE_KEY_LEN`].
pub fn encode_into(
    metadata: &RouteMetadata,
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if metadata.route_key.len() > MAX_FRAME_ROUTE_KEY_LEN {
        return Err(ProtocolError::RouteKeyTooLong(metadata.route_key.len()));
    }

    let metadata_len = metadata.encoded_len();
    buf.reserve(METADATA_LENGTH_SIZE + metadata_len + payload.len());
    buf.put_u16(metadata_len as u16);
    encode_metadata(metadata, buf)?;
    buf.extend_from_slice(payload);
    Ok(())
}

/// Decode a frame. The returned payload shares the input's allocation.
///
/// # Errors
///
/// Returns an error if the frame is truncated, the metadata length is
/// inconsistent, or the route key is not UTF-8.
pub fn decode(mut frame: Bytes) -> Result<RoutedFrame, ProtocolError> {
    if frame.remaining() < METADATA_LENGTH_SIZE {
        return Err(ProtocolError::Incomplete(
            METADATA_LENGTH_SIZE - frame.remaining(),
        ));
    }

    let metadata_len = frame.get_u16() as usize;
    if frame.remaining() < metadata_len {
        return Err(ProtocolError::Incomplete(metadata_len - frame.remaining()));
    }

    let mut metadata_buf = frame.split_to(metadata_len);
    let metadata = decode_metadata(&mut metadata_buf)?;
    if metadata_buf.has_remaining() {
        return Err(ProtocolError::Invalid(format!(
            "metadata length {} does not match route key length {}",
            metadata_len,
            metadata.route_key.len()
        )));
    }

    Ok(RoutedFrame {
        metadata,
        payload: frame,
    })
}

/// Decode a frame, mapping any failure to `None`.
#[must_use]
pub fn decode_or_none(frame: Bytes) -> Option<RoutedFrame> {
    decode(frame).ok()
}
