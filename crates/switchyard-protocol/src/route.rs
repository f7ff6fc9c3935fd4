//! Route metadata and its binary codec.
//!
//! Binary layout (big-endian):
//!
//! ```text
//! [type: u8][routeKeyLength: u16][routeKey: routeKeyLength bytes of UTF-8]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::ProtocolError;

/// Size of the fixed metadata header (type + key length).
pub const METADATA_HEADER_SIZE: usize = 3;

/// Longest route key the metadata codec accepts.
pub const MAX_ROUTE_KEY_LEN: usize = u16::MAX as usize;

/// How a message is placed on the worker tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", from = "u8")]
#[repr(u8)]
pub enum RouteType {
    /// Unrecognised or absent routing information. Never routed.
    Unknown = 0,
    /// Keyed by room id, consistent-hashed.
    Room = 1,
    /// Keyed by user id, consistent-hashed.
    User = 2,
    /// Fan-out to every eligible worker.
    Broadcast = 3,
    /// Explicit worker instance id, no hashing.
    Logic = 4,
}

impl RouteType {
    /// Wire code for this route type.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Map a wire code to a route type. Unknown codes become [`RouteType::Unknown`].
    #[must_use]
    pub const fn from_code(code: u8) -> Self {
        match code {
            1 => RouteType::Room,
            2 => RouteType::User,
            3 => RouteType::Broadcast,
            4 => RouteType::Logic,
            _ => RouteType::Unknown,
        }
    }

    /// Whether this route type is placed on the hash ring.
    #[must_use]
    pub const fn is_hashed(self) -> bool {
        matches!(self, RouteType::Room | RouteType::User)
    }
}

impl From<RouteType> for u8 {
    fn from(rt: RouteType) -> u8 {
        rt.code()
    }
}

impl From<u8> for RouteType {
    fn from(code: u8) -> Self {
        RouteType::from_code(code)
    }
}

impl fmt::Display for RouteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteType::Unknown => "UNKNOWN",
            RouteType::Room => "ROOM",
            RouteType::User => "USER",
            RouteType::Broadcast => "BROADCAST",
            RouteType::Logic => "LOGIC",
        };
        f.write_str(name)
    }
}

/// Routing information attached to every tier-to-tier frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteMetadata {
    /// Route type.
    pub route_type: RouteType,
    /// User id, room id or instance id depending on `route_type`.
    pub route_key: String,
}

impl RouteMetadata {
    /// Create route metadata.
    #[must_use]
    pub fn new(route_type: RouteType, route_key: impl Into<String>) -> Self {
        Self {
            route_type,
            route_key: route_key.into(),
        }
    }

    /// Route by room id.
    #[must_use]
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::new(RouteType::Room, room_id)
    }

    /// Route by user id.
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self::new(RouteType::User, user_id)
    }

    /// Route to an explicit worker instance.
    #[must_use]
    pub fn logic(instance_id: impl Into<String>) -> Self {
        Self::new(RouteType::Logic, instance_id)
    }

    /// Fan out to all workers.
    #[must_use]
    pub fn broadcast() -> Self {
        Self::new(RouteType::Broadcast, String::new())
    }

    /// Metadata with no usable routing information.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(RouteType::Unknown, String::new())
    }

    /// Number of bytes this metadata occupies on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        METADATA_HEADER_SIZE + self.route_key.len()
    }
}

impl fmt::Display for RouteMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route_type, self.route_key)
    }
}

/// Encode route metadata into `buf`.
///
/// # Errors
///
/// Returns [`ProtocolError::RouteKeyTooLong`] if the key does not fit a `u16` length.
pub fn encode_metadata(metadata: &RouteMetadata, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let key = metadata.route_key.as_bytes();
    if key.len() > MAX_ROUTE_KEY_LEN {
        return Err(ProtocolError::RouteKeyTooLong(key.len()));
    }

    buf.reserve(METADATA_HEADER_SIZE + key.len());
    buf.put_u8(metadata.route_type.code());
    buf.put_u16(key.len() as u16);
    buf.extend_from_slice(key);
    Ok(())
}

/// Decode route metadata from the front of `buf`, advancing it.
///
/// # Errors
///
/// Returns an error if the buffer is truncated or the key is not UTF-8.
pub fn decode_metadata(buf: &mut Bytes) -> Result<RouteMetadata, ProtocolError> {
    if buf.remaining() < METADATA_HEADER_SIZE {
        return Err(ProtocolError::Incomplete(
            METADATA_HEADER_SIZE - buf.remaining(),
        ));
    }

    let route_type = RouteType::from_code(buf.get_u8());
    let key_len = buf.get_u16() as usize;
    if buf.remaining() < key_len {
        return Err(ProtocolError::Incomplete(key_len - buf.remaining()));
    }

    let key = buf.split_to(key_len);
    let route_key = std::str::from_utf8(&key)
        .map_err(|_| ProtocolError::InvalidRouteKey)?
        .to_owned();

    Ok(RouteMetadata {
        route_type,
        route_key,
    })
}
