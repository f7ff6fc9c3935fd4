//! Compact message headers.
//!
//! Headers travel next to the frame in every link envelope. Keys are short
//! numeric strings and enumerated values are single letters, so a typical
//! header map costs a few dozen bytes on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::route::RouteMetadata;

/// Header keys.
pub mod keys {
    /// Edge session id.
    pub const SESSION_ID: &str = "0";
    /// User id.
    pub const USER_ID: &str = "1";
    /// Room id. Presence switches routing from user to room.
    pub const ROOM_ID: &str = "2";
    /// Type of the instance that produced the message.
    pub const INSTANCE_TYPE: &str = "3";
    /// Instance the message originated from.
    pub const FROM_INSTANCE_ID: &str = "4";
    /// Instance the message is addressed to.
    pub const TO_INSTANCE_ID: &str = "5";
    /// Client or server message.
    pub const MESSAGE_TYPE: &str = "6";
}

/// Kind of service instance on a tier link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceType {
    /// Edge instance holding user connections.
    Access,
    /// Stateless business-logic worker.
    Logic,
    /// The broker itself.
    Broker,
}

impl InstanceType {
    /// Compact header value.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            InstanceType::Access => "A",
            InstanceType::Logic => "L",
            InstanceType::Broker => "B",
        }
    }

    /// Long name, as used in logs and setup metadata.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            InstanceType::Access => "ACCESS",
            InstanceType::Logic => "LOGIC",
            InstanceType::Broker => "BROKER",
        }
    }
}

impl FromStr for InstanceType {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "A" | "ACCESS" => Ok(InstanceType::Access),
            "L" | "LOGIC" => Ok(InstanceType::Logic),
            "B" | "BROKER" => Ok(InstanceType::Broker),
            _ => Err("Invalid instance type"),
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of a message relative to the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// Sent by an edge client.
    Client,
    /// Produced by a worker.
    Server,
}

impl MessageKind {
    /// Compact header value.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            MessageKind::Client => "C",
            MessageKind::Server => "S",
        }
    }
}

impl FromStr for MessageKind {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "C" => Ok(MessageKind::Client),
            "S" => Ok(MessageKind::Server),
            _ => Err("Invalid message type"),
        }
    }
}

/// Parse `"<instanceType>:<instanceId>"` setup metadata.
///
/// # Errors
///
/// Returns a description of the problem if the string is malformed.
pub fn parse_setup_metadata(metadata: &str) -> Result<(InstanceType, String), &'static str> {
    let (kind, id) = metadata
        .split_once(':')
        .ok_or("Setup metadata must be <instanceType>:<instanceId>")?;
    if id.is_empty() {
        return Err("Setup metadata has an empty instance id");
    }
    Ok((kind.parse()?, id.to_string()))
}

/// Format setup metadata for an instance.
#[must_use]
pub fn setup_metadata(instance_type: InstanceType, instance_id: &str) -> String {
    format!("{}:{}", instance_type.code(), instance_id)
}

/// Message headers keyed by the compact keys in [`keys`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Create empty headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a raw header value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Set a raw header value.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Remove a header.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Number of headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Edge session id.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.get(keys::SESSION_ID)
    }

    /// User id.
    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        self.get(keys::USER_ID)
    }

    /// Room id.
    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.get(keys::ROOM_ID)
    }

    /// Producing instance type. `None` if absent or unparseable.
    #[must_use]
    pub fn instance_type(&self) -> Option<InstanceType> {
        self.get(keys::INSTANCE_TYPE)?.parse().ok()
    }

    /// Originating instance id.
    #[must_use]
    pub fn from_instance_id(&self) -> Option<&str> {
        self.get(keys::FROM_INSTANCE_ID)
    }

    /// Destination instance id.
    #[must_use]
    pub fn to_instance_id(&self) -> Option<&str> {
        self.get(keys::TO_INSTANCE_ID)
    }

    /// Message kind.
    #[must_use]
    pub fn message_kind(&self) -> Option<MessageKind> {
        self.get(keys::MESSAGE_TYPE)?.parse().ok()
    }

    /// Whether the message is room-routed.
    #[must_use]
    pub fn is_room_route(&self) -> bool {
        self.room_id().is_some()
    }

    /// Derive route metadata: a room id wins, otherwise the user id.
    #[must_use]
    pub fn route_metadata(&self) -> Option<RouteMetadata> {
        if let Some(room_id) = self.room_id() {
            return Some(RouteMetadata::room(room_id));
        }
        self.user_id().map(RouteMetadata::user)
    }

    /// Iterate over all headers.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::RouteType;

    #[test]
    fn test_route_derivation() {
        let user = Headers::new().with(keys::USER_ID, "u1");
        assert_eq!(user.route_metadata(), Some(RouteMetadata::user("u1")));
        assert!(!user.is_room_route());

        let room = user.with(keys::ROOM_ID, "r9");
        let metadata = room.route_metadata().unwrap();
        assert_eq!(metadata.route_type, RouteType::Room);
        assert_eq!(metadata.route_key, "r9");

        assert_eq!(Headers::new().route_metadata(), None);
    }

    #[test]
    fn test_typed_accessors() {
        let headers = Headers::new()
            .with(keys::SESSION_ID, "s1")
            .with(keys::INSTANCE_TYPE, InstanceType::Logic.code())
            .with(keys::FROM_INSTANCE_ID, "logic-1")
            .with(keys::TO_INSTANCE_ID, "access-1")
            .with(keys::MESSAGE_TYPE, MessageKind::Server.code());

        assert_eq!(headers.session_id(), Some("s1"));
        assert_eq!(headers.instance_type(), Some(InstanceType::Logic));
        assert_eq!(headers.from_instance_id(), Some("logic-1"));
        assert_eq!(headers.to_instance_id(), Some("access-1"));
        assert_eq!(headers.message_kind(), Some(MessageKind::Server));
    }

    #[test]
    fn test_invalid_instance_type() {
        let headers = Headers::new().with(keys::INSTANCE_TYPE, "X");
        assert_eq!(headers.instance_type(), None);
    }

    #[test]
    fn test_setup_metadata() {
        assert_eq!(
            parse_setup_metadata("L:logic-1"),
            Ok((InstanceType::Logic, "logic-1".to_string()))
        );
        assert_eq!(
            parse_setup_metadata("ACCESS:a-1"),
            Ok((InstanceType::Access, "a-1".to_string()))
        );
        assert!(parse_setup_metadata("logic-1").is_err());
        assert!(parse_setup_metadata("L:").is_err());
        assert!(parse_setup_metadata("Q:x").is_err());
        assert_eq!(setup_metadata(InstanceType::Access, "a-1"), "A:a-1");
    }
}
