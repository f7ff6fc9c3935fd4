//! Transport abstraction traits for Switchyard.
//!
//! A link carries [`Envelope`]s in both directions. Once the handshake is
//! done a connection is split so that one task reads while another writes.

use async_trait::async_trait;
use switchyard_core::ConnectionId;
use switchyard_protocol::{Envelope, ProtocolError};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer did not take or deliver data in time.
    #[error("Connection timed out")]
    Timeout,

    /// Connection refused or could not be established.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether the error concerns a single envelope and leaves the link usable.
    #[must_use]
    pub fn is_envelope_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

/// Writing half of a link.
#[async_trait]
pub trait EnvelopeSink: Send {
    /// Send one envelope.
    ///
    /// A [`TransportError::Protocol`] error means the envelope was refused
    /// before anything was written.
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError>;

    /// Close the link gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Reading half of a link.
#[async_trait]
pub trait EnvelopeSource: Send {
    /// Receive the next envelope.
    ///
    /// Returns `None` if the link is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError>;
}

/// An established link.
pub struct Connection {
    /// Unique identifier of this link.
    pub id: ConnectionId,
    /// Remote address, if the transport has one.
    pub remote_addr: Option<String>,
    /// Writing half.
    pub sink: Box<dyn EnvelopeSink>,
    /// Reading half.
    pub source: Box<dyn EnvelopeSource>,
}

impl Connection {
    /// Create a connection from its halves.
    #[must_use]
    pub fn new(sink: Box<dyn EnvelopeSink>, source: Box<dyn EnvelopeSource>) -> Self {
        Self {
            id: ConnectionId::generate(),
            remote_addr: None,
            sink,
            source,
        }
    }

    /// Set the remote address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Send an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is broken.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.sink.send(envelope).await
    }

    /// Receive an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is broken or the peer sent garbage.
    pub async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        self.source.recv().await
    }

    /// Split into id, sink and source.
    #[must_use]
    pub fn split(self) -> (ConnectionId, Box<dyn EnvelopeSink>, Box<dyn EnvelopeSource>) {
        (self.id, self.sink, self.source)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method blocks until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Connection, TransportError>;

    /// Get the transport name (e.g., "websocket", "memory").
    fn name(&self) -> &'static str;
}

/// Dials a fixed upstream endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to the endpoint.
    async fn connect(&self) -> Result<Connection, TransportError>;

    /// Endpoint description for logs.
    fn endpoint(&self) -> String;
}
