//! Moves envelopes between an accepted link and its session.
//!
//! A reader task feeds inbound envelopes to a [`LinkHandler`] and answers
//! pings. The calling task drains the session outbox into the link, each
//! write bounded by the write limit. The link ends when the peer leaves, the
//! session is closed, a write stalls, or the peer stays silent longer than
//! the idle limit. A message the link refuses as oversized is dropped on its
//! own.

use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{ConnectionId, Message, OutboxStream};
use switchyard_protocol::{Envelope, ProtocolError};
use switchyard_transport::stream::{self, InboundHandler, Liveness};
use switchyard_transport::{EnvelopeSink, EnvelopeSource, TransportError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics;

/// Link-specific behaviour.
pub trait LinkHandler: InboundHandler {
    /// Wire form of an outbox message.
    fn encode(&self, message: &Message) -> Result<Envelope, ProtocolError>;
}

/// Time limits of an accepted link.
#[derive(Debug, Clone, Copy)]
pub struct LinkLimits {
    /// Silence tolerated from the peer.
    pub idle: Duration,
    /// Limit for writing one envelope.
    pub write: Duration,
}

/// How a link ended.
#[derive(Debug)]
pub enum LinkEnd {
    /// The peer closed the link.
    PeerClosed,
    /// The session was closed locally (evicted or shut down).
    SessionClosed,
    /// Nothing received for longer than the idle limit.
    Expired,
    Failed(TransportError),
}

/// Run the link until it ends. The sink is closed on return.
pub async fn pump<H: LinkHandler>(
    id: &ConnectionId,
    mut sink: Box<dyn EnvelopeSink>,
    source: Box<dyn EnvelopeSource>,
    mut outbox: OutboxStream,
    handler: Arc<H>,
    limits: LinkLimits,
) -> LinkEnd {
    let liveness = Arc::new(Liveness::new());
    let cancel = CancellationToken::new();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel();
    let mut reader = tokio::spawn(stream::read_loop(
        source,
        Arc::clone(&handler),
        control_tx,
        Arc::clone(&liveness),
        cancel.clone(),
    ));

    let check_every = (limits.idle / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + check_every, check_every);

    let end = loop {
        tokio::select! {
            biased;
            result = &mut reader => {
                break match result {
                    Ok(Ok(())) => LinkEnd::PeerClosed,
                    Ok(Err(e)) => LinkEnd::Failed(e),
                    Err(e) => LinkEnd::Failed(TransportError::Other(e.to_string())),
                };
            }
            Some(envelope) = control_rx.recv() => {
                if let Err(e) = stream::send_within(sink.as_mut(), envelope, limits.write).await {
                    break LinkEnd::Failed(e);
                }
            }
            _ = ticker.tick() => {
                if liveness.idle() > limits.idle {
                    break LinkEnd::Expired;
                }
            }
            message = outbox.recv() => {
                let Some(message) = message else { break LinkEnd::SessionClosed };
                let sent = match handler.encode(&message) {
                    Ok(envelope) => {
                        stream::send_within(sink.as_mut(), envelope, limits.write).await
                    }
                    Err(e) => Err(e.into()),
                };
                match sent {
                    Ok(()) => trace!(connection = %id, message = message.id, "Delivered"),
                    Err(e) if e.is_envelope_error() => {
                        warn!(connection = %id, error = %e, "Dropping unsendable message");
                        metrics::record_drop("unsendable");
                        message.release("unsendable");
                    }
                    Err(e) => {
                        metrics::record_drop("link_lost");
                        message.release("link lost");
                        break LinkEnd::Failed(e);
                    }
                }
            }
        }
    };

    cancel.cancel();
    reader.abort();
    let _ = tokio::time::timeout(limits.write, sink.close()).await;
    debug!(connection = %id, end = ?end, "Link finished");
    end
}
