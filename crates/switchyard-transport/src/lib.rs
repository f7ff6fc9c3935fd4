//! # switchyard-transport
//!
//! Links between Switchyard tiers and from edge clients.
//!
//! - **WebSocket** - binary WebSocket links, server and client side
//! - **Memory** - in-process links for tests and single-process setups
//! - **Upstream client** - the reconnecting tier-to-broker link
//! - **Stream** - the reader and bounded writes shared by every open stream
//!
//! ## Transport Abstraction
//!
//! Transports accept [`Connection`]s; connectors dial them. A connection
//! splits into an [`EnvelopeSink`] and an [`EnvelopeSource`] so reading and
//! writing can happen on different tasks.
//!
//! ```rust,ignore
//! use switchyard_transport::{Transport, Connection};
//!
//! async fn serve(transport: impl Transport) {
//!     while let Ok(conn) = transport.accept().await {
//!         let (id, sink, source) = conn.split();
//!         // Spawn reader and writer tasks
//!     }
//! }
//! ```

pub mod client;
pub mod link;
pub mod memory;
pub mod stream;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use client::{Backoff, LinkState, UpstreamClient, UpstreamConfig, UpstreamError, UpstreamStats};
pub use stream::{InboundHandler, Liveness, DEFAULT_WRITE_TIMEOUT};
pub use traits::{Connection, Connector, EnvelopeSink, EnvelopeSource, Transport, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
