//! Link envelopes.
//!
//! Envelopes are the unit exchanged on every link, edge-to-access as well as
//! tier-to-broker. Each envelope is serialized using MessagePack.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::headers::Headers;

/// Link protocol version carried in `Setup`.
pub const LINK_VERSION: u8 = 1;

/// Rejection codes sent in [`Envelope::Rejected`].
pub mod reject {
    /// Token missing, invalid or expired.
    pub const INVALID_TOKEN: u16 = 4001;
    /// Setup metadata malformed or inconsistent with the token.
    pub const INVALID_METADATA: u16 = 4002;
    /// Setup or open route not served here.
    pub const UNKNOWN_ROUTE: u16 = 4003;
    /// Unexpected envelope for the link state.
    pub const PROTOCOL_VIOLATION: u16 = 4004;
}

/// Envelope type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    Setup,
    Accepted,
    Rejected,
    Open,
    Message,
    Ping,
    Pong,
}

/// A link envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// Connect-time handshake.
    #[serde(rename = "setup")]
    Setup {
        /// Setup route (`connect`).
        route: String,
        /// `"<instanceType>:<instanceId>"` for tier links, empty for edge clients.
        #[serde(default)]
        metadata: String,
        /// Opaque authentication token.
        token: String,
        /// Link protocol version.
        version: u8,
    },

    /// Handshake accepted.
    #[serde(rename = "accepted")]
    Accepted {
        /// Session id assigned by the accepting side.
        session_id: String,
        /// Keep-alive interval the peer should use, in milliseconds.
        keep_alive_ms: u32,
    },

    /// Handshake declined.
    #[serde(rename = "rejected")]
    Rejected {
        /// Rejection code, see [`reject`].
        code: u16,
        /// Human-readable reason.
        reason: String,
    },

    /// Open the bidirectional message stream.
    #[serde(rename = "open")]
    Open {
        /// Stream route (`channel` between tiers, `im` for edge clients).
        route: String,
    },

    /// A routed message.
    #[serde(rename = "message")]
    Message {
        /// Compact headers.
        #[serde(default)]
        headers: Headers,
        /// A routed frame between tiers, the raw payload on edge links.
        data: Bytes,
    },

    /// Keep-alive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keep-alive pong.
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Envelope {
    /// Get the envelope type.
    #[must_use]
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            Envelope::Setup { .. } => EnvelopeType::Setup,
            Envelope::Accepted { .. } => EnvelopeType::Accepted,
            Envelope::Rejected { .. } => EnvelopeType::Rejected,
            Envelope::Open { .. } => EnvelopeType::Open,
            Envelope::Message { .. } => EnvelopeType::Message,
            Envelope::Ping { .. } => EnvelopeType::Ping,
            Envelope::Pong { .. } => EnvelopeType::Pong,
        }
    }

    /// Create a Setup envelope.
    #[must_use]
    pub fn setup(
        route: impl Into<String>,
        metadata: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Envelope::Setup {
            route: route.into(),
            metadata: metadata.into(),
            token: token.into(),
            version: LINK_VERSION,
        }
    }

    /// Create an Accepted envelope.
    #[must_use]
    pub fn accepted(session_id: impl Into<String>, keep_alive_ms: u32) -> Self {
        Envelope::Accepted {
            session_id: session_id.into(),
            keep_alive_ms,
        }
    }

    /// Create a Rejected envelope.
    #[must_use]
    pub fn rejected(code: u16, reason: impl Into<String>) -> Self {
        Envelope::Rejected {
            code,
            reason: reason.into(),
        }
    }

    /// Create an Open envelope.
    #[must_use]
    pub fn open(route: impl Into<String>) -> Self {
        Envelope::Open {
            route: route.into(),
        }
    }

    /// Create a Message envelope.
    #[must_use]
    pub fn message(headers: Headers, data: impl Into<Bytes>) -> Self {
        Envelope::Message {
            headers,
            data: data.into(),
        }
    }

    /// Create a Ping envelope stamped with `timestamp`.
    #[must_use]
    pub fn ping(timestamp: u64) -> Self {
        Envelope::Ping {
            timestamp: Some(timestamp),
        }
    }

    /// Create a Pong envelope.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Envelope::Pong { timestamp }
    }
}
