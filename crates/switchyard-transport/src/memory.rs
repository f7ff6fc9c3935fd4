//! In-process transport.
//!
//! Links are pairs of unbounded channels. Envelopes still pass through the
//! codec so size limits and encoding failures behave as on a real wire.
//! The connector can refuse new links and sever live ones, which makes it
//! useful for exercising reconnect paths.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use switchyard_protocol::{codec, Envelope};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::traits::{Connection, Connector, EnvelopeSink, EnvelopeSource, Transport, TransportError};

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<bytes::Bytes>>,
    severed: CancellationToken,
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        if self.severed.is_cancelled() {
            return Err(TransportError::ConnectionClosed);
        }
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        let data = codec::encode(&envelope)?;
        tx.send(data).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<bytes::Bytes>,
    severed: CancellationToken,
}

#[async_trait]
impl EnvelopeSource for MemorySource {
    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        let data = tokio::select! {
            biased;
            () = self.severed.cancelled() => {
                return Err(TransportError::ReceiveFailed("link severed".to_string()));
            }
            data = self.rx.recv() => data,
        };
        match data {
            Some(data) => Ok(Some(codec::decode(&data)?)),
            None => Ok(None),
        }
    }
}

/// Create two connected ends of a link plus the token that severs both.
#[must_use]
pub fn pair() -> (Connection, Connection, CancellationToken) {
    let severed = CancellationToken::new();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let a = Connection::new(
        Box::new(MemorySink {
            tx: Some(a_tx),
            severed: severed.clone(),
        }),
        Box::new(MemorySource {
            rx: b_rx,
            severed: severed.clone(),
        }),
    )
    .with_remote_addr("memory");
    let b = Connection::new(
        Box::new(MemorySink {
            tx: Some(b_tx),
            severed: severed.clone(),
        }),
        Box::new(MemorySource {
            rx: a_rx,
            severed: severed.clone(),
        }),
    )
    .with_remote_addr("memory");
    (a, b, severed)
}

/// Accepting side of an in-process endpoint.
pub struct MemoryTransport {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Result<Connection, TransportError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Dialing side of an in-process endpoint.
#[derive(Clone)]
pub struct MemoryConnector {
    name: String,
    incoming: mpsc::UnboundedSender<Connection>,
    refusing: Arc<AtomicBool>,
    live: Arc<Mutex<Vec<CancellationToken>>>,
}

impl MemoryConnector {
    /// Refuse (or accept again) new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Sever every link opened through this connector so far.
    pub fn sever_all(&self) {
        let live = std::mem::take(
            &mut *self
                .live
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        debug!(endpoint = %self.name, links = live.len(), "Severing memory links");
        for token in live {
            token.cancel();
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(format!(
                "{} refused the connection",
                self.name
            )));
        }
        let (client, server, severed) = pair();
        self.incoming
            .send(server)
            .map_err(|_| TransportError::ConnectFailed(format!("{} is gone", self.name)))?;
        let mut live = self
            .live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        live.retain(|token| !token.is_cancelled());
        live.push(severed);
        Ok(client)
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.name)
    }
}

/// Create an in-process endpoint.
#[must_use]
pub fn endpoint(name: impl Into<String>) -> (MemoryTransport, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            incoming: tokio::sync::Mutex::new(rx),
        },
        MemoryConnector {
            name: name.into(),
            incoming: tx,
            refusing: Arc::new(AtomicBool::new(false)),
            live: Arc::new(Mutex::new(Vec::new())),
        },
    )
}
