//! # switchyard-protocol
//!
//! Wire formats for the Switchyard message broker.
//!
//! This crate defines everything that crosses a link, and nothing that
//! needs a runtime:
//!
//! - **Route metadata** - `[type][keyLength][key]`, how a message is placed
//! - **Frames** - `[metadataLength][metadata][payload]`, the tier-to-tier unit
//! - **Headers** - compact numeric-keyed headers carried beside each frame
//! - **Envelopes** - the handshake, stream and keep-alive messages of a link,
//!   MessagePack-encoded behind a 4-byte length prefix
//!
//! ## Example
//!
//! ```rust
//! use switchyard_protocol::{frame, RouteMetadata};
//!
//! let encoded = frame::encode(&RouteMetadata::room("room-1"), b"opaque").unwrap();
//! let decoded = frame::decode(encoded).unwrap();
//! assert_eq!(decoded.metadata, RouteMetadata::room("room-1"));
//! assert_eq!(&decoded.payload[..], b"opaque");
//! ```

pub mod codec;
pub mod envelope;
pub mod frame;
pub mod headers;
pub mod route;

pub use codec::ProtocolError;
pub use envelope::{Envelope, EnvelopeType, LINK_VERSION};
pub use frame::RoutedFrame;
pub use headers::{keys, Headers, InstanceType, MessageKind};
pub use route::{RouteMetadata, RouteType};
