//! WebSocket transport implementation.
//!
//! Each envelope travels as one or more binary WebSocket messages carrying
//! the length-prefixed envelope encoding, so envelopes may be split or
//! coalesced by the peer without breaking decoding.
//!
//! Both halves enforce the same size limit. The sink refuses an oversized
//! envelope without writing it; the source reports one it receives and
//! keeps reading.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use switchyard_protocol::{codec, Envelope, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, info};

use crate::traits::{Connection, Connector, EnvelopeSink, EnvelopeSource, Transport, TransportError};

/// Default maximum WebSocket message size (1 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7000)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// WebSocket transport.
pub struct WebSocketTransport {
    listener: TcpListener,
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("WebSocket transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        debug!("Accepted TCP connection from {}", addr);

        let ws_stream = accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed: {}", e);
            TransportError::Other(format!("WebSocket handshake failed: {}", e))
        })?;

        debug!("WebSocket handshake completed with {}", addr);

        Ok(split(ws_stream, self.config.max_message_size).with_remote_addr(addr.to_string()))
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Dials a `ws://` URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    max_message_size: usize,
}

impl WebSocketConnector {
    /// Create a connector for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Override the message size limit.
    #[must_use]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (ws_stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        debug!(url = %self.url, "WebSocket connected");
        Ok(split(ws_stream, self.max_message_size).with_remote_addr(self.url.clone()))
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

fn split<S>(stream: WebSocketStream<S>, max_message_size: usize) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    Connection::new(
        Box::new(WebSocketSink {
            inner: sink,
            max_message_size,
        }),
        Box::new(WebSocketSource {
            inner: source,
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }),
    )
}

struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
    max_message_size: usize,
}

#[async_trait]
impl<S> EnvelopeSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        let data = codec::encode(&envelope)?;
        if data.len() > self.max_message_size {
            return Err(ProtocolError::EnvelopeTooLarge(data.len()).into());
        }
        self.inner
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    TransportError::ConnectionClosed
                }
                e => TransportError::SendFailed(e.to_string()),
            })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }
}

struct WebSocketSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl<S> WebSocketSource<S> {
    /// Decode the next buffered envelope. Undecodable input is discarded so
    /// the following message starts from a clean buffer.
    fn take_buffered(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        codec::decode_from(&mut self.read_buffer).map_err(|e| {
            self.read_buffer.clear();
            e
        })
    }
}

#[async_trait]
impl<S> EnvelopeSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        // First, try to decode from the existing buffer
        if let Some(envelope) = self.take_buffered()? {
            return Ok(Some(envelope));
        }

        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > self.max_message_size {
                        debug!(
                            "Message too large: {} bytes (max: {})",
                            data.len(),
                            self.max_message_size
                        );
                        return Err(TransportError::Protocol(ProtocolError::EnvelopeTooLarge(
                            data.len(),
                        )));
                    }

                    self.read_buffer.extend_from_slice(&data);

                    if let Some(envelope) = self.take_buffered()? {
                        return Ok(Some(envelope));
                    }
                    // Need more data, continue reading
                }
                Some(Ok(Message::Text(_))) => {
                    return Err(TransportError::Protocol(ProtocolError::Invalid(
                        "text messages are not supported".to_string(),
                    )));
                }
                // Pongs are queued by tungstenite itself.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}
