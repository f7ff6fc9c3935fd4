//! Pieces shared by every open message stream.
//!
//! Tier links and edge links run the same reader: it hands `message`
//! envelopes to an [`InboundHandler`], answers pings through a control
//! channel and records when the peer was last heard from. An envelope that
//! cannot be decoded is skipped, the link stays up. Writes go through
//! [`send_within`] so a peer that stops reading cannot stall the writer.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_protocol::{Envelope, Headers, ProtocolError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::traits::{EnvelopeSink, EnvelopeSource, TransportError};

/// Default limit for writing one envelope.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives what the reader takes off a stream.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// A `message` envelope arrived.
    async fn on_message(&self, headers: Headers, data: Bytes);

    /// Any envelope arrived.
    fn on_traffic(&self) {}

    /// An inbound envelope was skipped.
    fn on_skipped(&self, _error: &ProtocolError) {}
}

/// When the peer was last heard from.
#[derive(Debug)]
pub struct Liveness {
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    /// Record traffic now.
    pub fn touch(&self) {
        self.last_seen_ms.store(self.elapsed_ms(), Ordering::Relaxed);
    }

    /// Time since the last traffic, or since creation if there was none.
    #[must_use]
    pub fn idle(&self) -> Duration {
        let seen = self.last_seen_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.elapsed_ms().saturating_sub(seen))
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Send one envelope, giving up after `limit`.
///
/// # Errors
///
/// Returns [`TransportError::Timeout`] if the peer does not take the
/// envelope in time, otherwise whatever the sink reports.
pub async fn send_within(
    sink: &mut dyn EnvelopeSink,
    envelope: Envelope,
    limit: Duration,
) -> Result<(), TransportError> {
    tokio::time::timeout(limit, sink.send(envelope))
        .await
        .map_err(|_| TransportError::Timeout)?
}

/// Read `source` until it closes, fails or `cancel` fires.
///
/// Pings are answered by queueing a pong on `control`; the writer owns the
/// sink.
///
/// # Errors
///
/// Returns the transport error that broke the link.
pub async fn read_loop<H: InboundHandler>(
    mut source: Box<dyn EnvelopeSource>,
    handler: Arc<H>,
    control: mpsc::UnboundedSender<Envelope>,
    liveness: Arc<Liveness>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    loop {
        let received = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            received = source.recv() => received,
        };
        let envelope = match received {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(()),
            Err(TransportError::Protocol(e)) => {
                liveness.touch();
                warn!(error = %e, "Skipping undecodable envelope");
                handler.on_skipped(&e);
                continue;
            }
            Err(e) => return Err(e),
        };
        liveness.touch();
        handler.on_traffic();

        match envelope {
            Envelope::Message { headers, data } => handler.on_message(headers, data).await,
            Envelope::Ping { timestamp } => {
                let _ = control.send(Envelope::pong(timestamp));
            }
            Envelope::Pong { .. } => {}
            other => {
                warn!(envelope = ?other.envelope_type(), "Unexpected envelope on stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed script of receive results, then reports a clean close.
    struct Scripted(VecDeque<Result<Option<Envelope>, TransportError>>);

    #[async_trait]
    impl EnvelopeSource for Scripted {
        async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }
    }

    struct Stalled;

    #[async_trait]
    impl EnvelopeSink for Stalled {
        async fn send(&mut self, _envelope: Envelope) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<Bytes>>,
        skipped: AtomicU64,
    }

    #[async_trait]
    impl InboundHandler for Collect {
        async fn on_message(&self, _headers: Headers, data: Bytes) {
            self.messages.lock().unwrap().push(data);
        }

        fn on_skipped(&self, _error: &ProtocolError) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[tokio::test]
    async fn test_reader_skips_oversized_envelope_and_keeps_going() {
        let source = Scripted(VecDeque::from(vec![
            Err(ProtocolError::EnvelopeTooLarge(1_100_037).into()),
            Ok(Some(Envelope::message(Headers::new(), b"after".to_vec()))),
            Ok(Some(Envelope::ping(7))),
        ]));
        let handler = Arc::new(Collect::default());
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();

        let result = read_loop(
            Box::new(source),
            Arc::clone(&handler),
            control_tx,
            Arc::new(Liveness::new()),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(handler.skipped.load(Ordering::Relaxed), 1);
        assert_eq!(
            handler.messages.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"after")]
        );
        assert_eq!(control_rx.recv().await, Some(Envelope::pong(Some(7))));
    }

    #[tokio::test]
    async fn test_reader_stops_on_link_failure() {
        let source = Scripted(VecDeque::from(vec![
            Err(TransportError::ReceiveFailed("reset".to_string())),
            Ok(Some(Envelope::message(Headers::new(), b"never".to_vec()))),
        ]));
        let handler = Arc::new(Collect::default());
        let (control_tx, _control_rx) = mpsc::unbounded_channel();

        let result = read_loop(
            Box::new(source),
            Arc::clone(&handler),
            control_tx,
            Arc::new(Liveness::new()),
            CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(TransportError::ReceiveFailed(_))));
        assert!(handler.messages.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_within_times_out_on_stalled_peer() {
        let started = Instant::now();
        let result = send_within(&mut Stalled, Envelope::ping(1), Duration::from_secs(2)).await;
        assert!(matches!(result, Err(TransportError::Timeout)));
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_tracks_idle_time() {
        let liveness = Liveness::new();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(liveness.idle() >= Duration::from_secs(5));

        liveness.touch();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let idle = liveness.idle();
        assert!(idle >= Duration::from_secs(1) && idle < Duration::from_secs(2));
    }
}
