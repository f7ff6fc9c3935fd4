//! Reconnecting upstream link.
//!
//! [`UpstreamClient`] keeps one streaming link to the broker alive. It
//! performs the `connect` handshake, opens the `channel` stream, then pumps
//! the outbound holder into the link and the link into the inbound holder.
//! When the link ends for any reason it reconnects with exponential
//! backoff. The outbound stream is held across reconnects, so messages
//! queued during an outage are sent once the link is back.
//!
//! Every write is bounded by `write_timeout`; a broker that stops reading
//! fails the link instead of stalling keep-alive and shutdown. A message
//! the link refuses as oversized is dropped and the link stays up.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::message::now_millis;
use switchyard_core::{HolderStream, InboundHolder, OutboundHolder};
use switchyard_protocol::headers::setup_metadata;
use switchyard_protocol::{Envelope, Headers, InstanceType, ProtocolError};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::link;
use crate::stream::{self, InboundHandler, Liveness};
use crate::traits::{Connection, Connector, TransportError};

/// Upstream link configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// WebSocket path on the broker.
    pub path: String,
    /// Limit for dialing and for the handshake reply.
    pub connect_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_interval: Duration,
    /// Upper bound for reconnect delays.
    pub max_reconnect_interval: Duration,
    /// Growth factor between reconnect delays.
    pub backoff_factor: f64,
    /// Reconnect attempts before giving up, `-1` for unlimited.
    pub max_reconnect_attempts: i64,
    /// Ping interval.
    pub keep_alive_interval: Duration,
    /// Link is considered dead after this long without inbound traffic.
    pub keep_alive_max_lifetime: Duration,
    /// Limit for writing one envelope to the broker.
    pub write_timeout: Duration,
    /// Route of the handshake.
    pub setup_route: String,
    /// Route of the message stream.
    pub channel_route: String,
    /// Type of this instance.
    pub instance_type: InstanceType,
    /// Id of this instance.
    pub instance_id: String,
    /// Authentication token presented in the handshake.
    pub token: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 7000,
            path: "/".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_interval: Duration::from_secs(30),
            backoff_factor: 2.0,
            max_reconnect_attempts: -1,
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_max_lifetime: Duration::from_secs(90),
            write_timeout: stream::DEFAULT_WRITE_TIMEOUT,
            setup_route: "connect".to_string(),
            channel_route: "channel".to_string(),
            instance_type: InstanceType::Access,
            instance_id: "switchyard".to_string(),
            token: String::new(),
        }
    }
}

impl UpstreamConfig {
    /// WebSocket URL of the broker.
    #[must_use]
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

/// Exponential backoff: `base * factor^n`, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: f64,
    max_attempts: i64,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff. `max_attempts < 0` means unlimited.
    #[must_use]
    pub fn new(base: Duration, max: Duration, factor: f64, max_attempts: i64) -> Self {
        Self {
            base,
            max: max.max(base),
            factor: factor.max(1.0),
            max_attempts,
            attempts: 0,
        }
    }

    /// Backoff settings of an upstream configuration.
    #[must_use]
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self::new(
            config.reconnect_interval,
            config.max_reconnect_interval,
            config.backoff_factor,
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.max_attempts >= 0 && i64::from(self.attempts) >= self.max_attempts {
            return None;
        }
        let scale = self.factor.powi(self.attempts.min(64) as i32);
        let delay = self.base.mul_f64(scale.min(u32::MAX as f64)).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        Some(delay)
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Upstream link state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    /// Handshake accepted.
    Connected,
    /// Message stream open.
    Streaming,
    /// The client has stopped for good.
    Stopped,
}

/// Upstream client errors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The broker declined the handshake.
    #[error("Rejected by upstream ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    /// Unexpected handshake reply.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Dial or handshake timed out.
    #[error("Upstream timed out")]
    Timeout,

    /// Reconnect attempts exhausted.
    #[error("Gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),

    /// `run` was called twice.
    #[error("Upstream client is already running")]
    AlreadyRunning,
}

/// Upstream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpstreamStats {
    /// Successful handshakes.
    pub connects: u64,
    /// Reconnect attempts scheduled.
    pub reconnects: u64,
    /// Outbound messages lost to a failed or timed-out send, or refused
    /// by the link.
    pub discarded: u64,
    /// Inbound envelopes skipped as undecodable.
    pub skipped: u64,
}

enum StreamEnd {
    Cancelled,
    Closed,
    Expired,
    Failed(TransportError),
}

/// Keeps the streaming link to the broker alive.
pub struct UpstreamClient {
    config: UpstreamConfig,
    connector: Arc<dyn Connector>,
    inbound: Arc<UpstreamInbound>,
    outbound: Arc<OutboundHolder>,
    state: watch::Sender<LinkState>,
    cancel: CancellationToken,
    connects: AtomicU64,
    reconnects: AtomicU64,
    discarded: AtomicU64,
}

impl UpstreamClient {
    /// Create a client. Nothing happens until [`UpstreamClient::run`].
    #[must_use]
    pub fn new(
        config: UpstreamConfig,
        connector: Arc<dyn Connector>,
        inbound: Arc<InboundHolder>,
        outbound: Arc<OutboundHolder>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            config,
            connector,
            inbound: Arc::new(UpstreamInbound {
                holder: inbound,
                skipped: AtomicU64::new(0),
            }),
            outbound,
            state,
            cancel: CancellationToken::new(),
            connects: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Current link state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Watch link state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Stop the client. `run` returns after tearing the link down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Get counters.
    #[must_use]
    pub fn stats(&self) -> UpstreamStats {
        UpstreamStats {
            connects: self.connects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            skipped: self.inbound.skipped.load(Ordering::Relaxed),
        }
    }

    /// Connect and keep reconnecting until shut down or out of attempts.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::RetriesExhausted`] when the reconnect budget
    /// is spent, or [`UpstreamError::AlreadyRunning`] on a second call.
    pub async fn run(&self) -> Result<(), UpstreamError> {
        let mut outbound = self
            .outbound
            .subscribe()
            .ok_or(UpstreamError::AlreadyRunning)?;
        let mut backoff = Backoff::from_config(&self.config);
        info!(
            endpoint = %self.connector.endpoint(),
            instance = %self.config.instance_id,
            "Upstream client started"
        );

        loop {
            self.set_state(LinkState::Connecting);
            let established = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.establish() => result,
            };

            match established {
                Ok(conn) => {
                    backoff.reset();
                    match self.stream(conn, &mut outbound).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Closed => info!("Upstream closed the link"),
                        StreamEnd::Expired => warn!(
                            lifetime_ms = self.config.keep_alive_max_lifetime.as_millis() as u64,
                            "Upstream link silent for too long"
                        ),
                        StreamEnd::Failed(e) => warn!(error = %e, "Upstream link failed"),
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt = backoff.attempts(), "Upstream connect failed");
                }
            }

            self.set_state(LinkState::Disconnected);
            let Some(delay) = backoff.next_delay() else {
                self.set_state(LinkState::Stopped);
                return Err(UpstreamError::RetriesExhausted(backoff.attempts()));
            };
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(LinkState::Stopped);
        info!("Upstream client stopped");
        Ok(())
    }

    async fn establish(&self) -> Result<Connection, UpstreamError> {
        let timeout = self.config.connect_timeout;
        let mut conn = tokio::time::timeout(timeout, self.connector.connect())
            .await
            .map_err(|_| UpstreamError::Timeout)??;

        conn.send(Envelope::setup(
            self.config.setup_route.as_str(),
            setup_metadata(self.config.instance_type, &self.config.instance_id),
            self.config.token.as_str(),
        ))
        .await?;

        let reply = tokio::time::timeout(timeout, conn.recv())
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        match reply {
            Some(Envelope::Accepted { session_id, .. }) => {
                self.connects.fetch_add(1, Ordering::Relaxed);
                info!(session = %session_id, connection = %conn.id, "Upstream accepted");
            }
            Some(Envelope::Rejected { code, reason }) => {
                return Err(UpstreamError::Rejected { code, reason });
            }
            Some(other) => {
                return Err(UpstreamError::Handshake(format!(
                    "unexpected {:?} during handshake",
                    other.envelope_type()
                )));
            }
            None => return Err(TransportError::ConnectionClosed.into()),
        }
        self.set_state(LinkState::Connected);

        conn.send(Envelope::open(self.config.channel_route.as_str()))
            .await?;
        self.set_state(LinkState::Streaming);
        Ok(conn)
    }

    async fn stream(&self, conn: Connection, outbound: &mut HolderStream) -> StreamEnd {
        let (id, mut sink, source) = conn.split();
        let link_cancel = self.cancel.child_token();
        let liveness = Arc::new(Liveness::new());
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let mut reader = tokio::spawn(stream::read_loop(
            source,
            Arc::clone(&self.inbound),
            control_tx,
            Arc::clone(&liveness),
            link_cancel.clone(),
        ));

        let keep_alive = self.config.keep_alive_interval;
        let max_lifetime = self.config.keep_alive_max_lifetime;
        let write_timeout = self.config.write_timeout;
        let mut ticker = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);

        let end = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break StreamEnd::Cancelled,
                result = &mut reader => {
                    break match result {
                        Ok(Ok(())) => StreamEnd::Closed,
                        Ok(Err(e)) => StreamEnd::Failed(e),
                        Err(e) => StreamEnd::Failed(TransportError::Other(e.to_string())),
                    };
                }
                Some(envelope) = control_rx.recv() => {
                    let sent = stream::send_within(sink.as_mut(), envelope, write_timeout).await;
                    if let Err(e) = sent {
                        break StreamEnd::Failed(e);
                    }
                }
                _ = ticker.tick() => {
                    if liveness.idle() > max_lifetime {
                        break StreamEnd::Expired;
                    }
                    let ping = Envelope::ping(now_millis());
                    if let Err(e) = stream::send_within(sink.as_mut(), ping, write_timeout).await {
                        break StreamEnd::Failed(e);
                    }
                }
                message = outbound.recv() => {
                    let Some(message) = message else { break StreamEnd::Cancelled };
                    let sent = match link::to_envelope(&message) {
                        Ok(envelope) => {
                            stream::send_within(sink.as_mut(), envelope, write_timeout).await
                        }
                        Err(e) => Err(e.into()),
                    };
                    match sent {
                        Ok(()) => trace!(message = message.id, "Sent upstream"),
                        Err(e) if e.is_envelope_error() => {
                            warn!(message = message.id, error = %e, "Dropping unsendable message");
                            self.discarded.fetch_add(1, Ordering::Relaxed);
                            message.release("unsendable");
                        }
                        Err(e) => {
                            self.discarded.fetch_add(1, Ordering::Relaxed);
                            message.release("link lost");
                            break StreamEnd::Failed(e);
                        }
                    }
                }
            }
        };

        link_cancel.cancel();
        reader.abort();
        let _ = tokio::time::timeout(write_timeout, sink.close()).await;
        debug!(connection = %id, "Upstream link torn down");
        end
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Link state changed");
        }
    }
}

/// Feeds the inbound holder from the link.
struct UpstreamInbound {
    holder: Arc<InboundHolder>,
    skipped: AtomicU64,
}

#[async_trait]
impl InboundHandler for UpstreamInbound {
    async fn on_message(&self, headers: Headers, data: Bytes) {
        match link::from_envelope(headers, data) {
            Ok(message) => {
                self.holder.publish(message);
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn on_skipped(&self, _error: &ProtocolError) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{self, MemoryTransport};
    use crate::traits::{EnvelopeSink, Transport};
    use std::sync::atomic::AtomicBool;
    use switchyard_core::{LeaseTracker, Message, Payload};
    use switchyard_protocol::{codec, envelope::reject, keys, RouteMetadata};

    fn config() -> UpstreamConfig {
        UpstreamConfig {
            reconnect_interval: Duration::from_millis(20),
            max_reconnect_interval: Duration::from_millis(100),
            instance_type: InstanceType::Access,
            instance_id: "access-1".to_string(),
            token: "secret".to_string(),
            ..UpstreamConfig::default()
        }
    }

    async fn accept_link(transport: &MemoryTransport) -> Connection {
        let mut conn = transport.accept().await.unwrap();
        match conn.recv().await.unwrap() {
            Some(Envelope::Setup {
                route,
                metadata,
                token,
                ..
            }) => {
                assert_eq!(route, "connect");
                assert_eq!(metadata, "A:access-1");
                assert_eq!(token, "secret");
            }
            other => panic!("Expected Setup, got {:?}", other),
        }
        conn.send(Envelope::accepted("sess-1", 30_000)).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), Some(Envelope::open("channel")));
        conn
    }

    fn client(
        config: UpstreamConfig,
        connector: memory::MemoryConnector,
    ) -> (Arc<UpstreamClient>, Arc<InboundHolder>, Arc<OutboundHolder>) {
        client_over(config, Arc::new(connector))
    }

    fn client_over(
        config: UpstreamConfig,
        connector: Arc<dyn Connector>,
    ) -> (Arc<UpstreamClient>, Arc<InboundHolder>, Arc<OutboundHolder>) {
        let inbound = InboundHolder::with_capacity(64);
        let outbound = OutboundHolder::with_capacity(64);
        let client = Arc::new(UpstreamClient::new(
            config,
            connector,
            Arc::clone(&inbound),
            Arc::clone(&outbound),
        ));
        (client, inbound, outbound)
    }

    /// Passes `remaining` envelopes through, then never completes a send.
    struct StallAfter {
        inner: Box<dyn EnvelopeSink>,
        remaining: usize,
    }

    #[async_trait]
    impl EnvelopeSink for StallAfter {
        async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
            if self.remaining == 0 {
                return std::future::pending().await;
            }
            self.remaining -= 1;
            self.inner.send(envelope).await
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.inner.close().await
        }
    }

    /// The first link it opens stops reading right after the handshake.
    struct StallingConnector {
        inner: memory::MemoryConnector,
        stalled: AtomicBool,
    }

    #[async_trait]
    impl Connector for StallingConnector {
        async fn connect(&self) -> Result<Connection, TransportError> {
            let mut conn = self.inner.connect().await?;
            if !self.stalled.swap(true, Ordering::SeqCst) {
                let (_, sink, source) = conn.split();
                // setup and open go through
                let sink = Box::new(StallAfter {
                    inner: sink,
                    remaining: 2,
                });
                conn = Connection::new(sink, source);
            }
            Ok(conn)
        }

        fn endpoint(&self) -> String {
            self.inner.endpoint()
        }
    }

    fn stalling(connector: memory::MemoryConnector) -> Arc<dyn Connector> {
        Arc::new(StallingConnector {
            inner: connector,
            stalled: AtomicBool::new(false),
        })
    }

    async fn wait_for(client: &UpstreamClient, state: LinkState) {
        let mut rx = client.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let mut backoff = Backoff::new(
            Duration::from_secs(3),
            Duration::from_secs(30),
            2.0,
            -1,
        );
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![3, 6, 12, 24, 30, 30]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_backoff_bounded_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0, 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 2);

        let mut none = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 2.0, 0);
        assert_eq!(none.next_delay(), None);
    }

    #[test]
    fn test_config_url() {
        let config = UpstreamConfig {
            host: "broker".to_string(),
            port: 7001,
            path: "link".to_string(),
            ..UpstreamConfig::default()
        };
        assert_eq!(config.url(), "ws://broker:7001/link");
        assert_eq!(UpstreamConfig::default().url(), "ws://localhost:7000/");
    }

    #[tokio::test]
    async fn test_handshake_and_bidirectional_stream() {
        let (transport, connector) = memory::endpoint("broker");
        let (client, inbound, outbound) = client(config(), connector);
        let mut inbound_stream = inbound.subscribe().unwrap();

        let runner = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });
        let mut broker = accept_link(&transport).await;
        wait_for(&client, LinkState::Streaming).await;

        let headers = Headers::new().with(keys::USER_ID, "u1");
        assert!(outbound.publish(Message::new(headers.clone(), b"up".to_vec())));
        match broker.recv().await.unwrap() {
            Some(Envelope::Message { headers: h, data }) => {
                let message = link::from_envelope(h, data).unwrap();
                assert_eq!(message.headers, headers);
                assert_eq!(message.route, RouteMetadata::user("u1"));
                assert_eq!(&message.payload()[..], b"up");
            }
            other => panic!("Expected Message, got {:?}", other),
        }

        let down = Message::new(Headers::new(), b"down".to_vec())
            .with_route(RouteMetadata::logic("l"));
        broker.send(link::to_envelope(&down).unwrap()).await.unwrap();
        let received = inbound_stream.recv().await.unwrap();
        assert_eq!(&received.payload()[..], b"down");

        broker.send(Envelope::ping(5)).await.unwrap();
        assert_eq!(broker.recv().await.unwrap(), Some(Envelope::pong(Some(5))));

        client.shutdown();
        assert!(runner.await.unwrap().is_ok());
        assert_eq!(client.state(), LinkState::Stopped);
        assert_eq!(client.stats().connects, 1);
    }

    #[tokio::test]
    async fn test_rejection_exhausts_attempts() {
        let (transport, connector) = memory::endpoint("broker");
        let config = UpstreamConfig {
            max_reconnect_attempts: 2,
            ..config()
        };
        let (client, _inbound, _outbound) = client(config, connector);

        let broker = tokio::spawn(async move {
            for _ in 0..3 {
                let mut conn = transport.accept().await.unwrap();
                let _ = conn.recv().await.unwrap();
                conn.send(Envelope::rejected(reject::INVALID_TOKEN, "Invalid token"))
                    .await
                    .unwrap();
            }
        });

        let result = client.run().await;
        assert!(matches!(result, Err(UpstreamError::RetriesExhausted(2))));
        assert_eq!(client.state(), LinkState::Stopped);
        assert_eq!(client.stats().connects, 0);
        assert_eq!(client.stats().reconnects, 2);
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_resumes_queued_messages() {
        let (transport, connector) = memory::endpoint("broker");
        let (client, _inbound, outbound) = client(config(), connector.clone());

        let runner = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });
        let _first = accept_link(&transport).await;
        wait_for(&client, LinkState::Streaming).await;

        connector.set_refusing(true);
        connector.sever_all();
        wait_for(&client, LinkState::Disconnected).await;

        for i in 0..3u8 {
            assert!(outbound.publish(Message::new(
                Headers::new().with(keys::USER_ID, "u1"),
                vec![i],
            )));
        }

        connector.set_refusing(false);
        let mut second = accept_link(&transport).await;
        for i in 0..3u8 {
            match second.recv().await.unwrap() {
                Some(Envelope::Message { headers, data }) => {
                    let message = link::from_envelope(headers, data).unwrap();
                    assert_eq!(&message.payload()[..], &[i]);
                }
                other => panic!("Expected Message, got {:?}", other),
            }
        }
        assert_eq!(client.stats().connects, 2);

        client.shutdown();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_link_expires() {
        let (transport, connector) = memory::endpoint("broker");
        let config = UpstreamConfig {
            keep_alive_interval: Duration::from_secs(1),
            keep_alive_max_lifetime: Duration::from_secs(3),
            ..config()
        };
        let (client, _inbound, _outbound) = client(config, connector);

        let runner = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });

        // The first broker link swallows pings and never answers.
        let mut silent = accept_link(&transport).await;
        let drain = tokio::spawn(async move { while let Ok(Some(_)) = silent.recv().await {} });

        let _second = accept_link(&transport).await;
        assert_eq!(client.stats().connects, 2);

        client.shutdown();
        assert!(runner.await.unwrap().is_ok());
        drain.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_ping_fails_link_before_lifetime_is_lost() {
        let (transport, connector) = memory::endpoint("broker");
        let config = UpstreamConfig {
            keep_alive_interval: Duration::from_secs(1),
            keep_alive_max_lifetime: Duration::from_secs(3),
            write_timeout: Duration::from_secs(2),
            ..config()
        };
        let (client, _inbound, _outbound) = client_over(config, stalling(connector));

        let runner = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });
        let _stalled = accept_link(&transport).await;
        wait_for(&client, LinkState::Streaming).await;
        let streaming_since = Instant::now();

        // The first ping hangs at 1s and gives up at 3s.
        let _second = accept_link(&transport).await;
        let waited = streaming_since.elapsed();
        assert!(waited >= Duration::from_secs(3), "reconnected after {waited:?}");
        assert!(waited < Duration::from_secs(4), "reconnected after {waited:?}");
        assert_eq!(client.stats().connects, 2);

        client.shutdown();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_message_send_is_discarded() {
        let (transport, connector) = memory::endpoint("broker");
        let config = UpstreamConfig {
            write_timeout: Duration::from_secs(2),
            ..config()
        };
        let (client, _inbound, outbound) = client_over(config, stalling(connector));

        let runner = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });
        let _stalled = accept_link(&transport).await;
        wait_for(&client, LinkState::Streaming).await;

        let tracker = LeaseTracker::new();
        let stuck = Message::new(
            Headers::new().with(keys::USER_ID, "u1"),
            Payload::tracked(b"stuck".to_vec(), &tracker),
        );
        assert!(outbound.publish(stuck));

        let mut second = accept_link(&transport).await;
        assert_eq!(client.stats().discarded, 1);
        assert_eq!(tracker.outstanding(), 0);

        assert!(outbound.publish(Message::new(
            Headers::new().with(keys::USER_ID, "u1"),
            b"next".to_vec(),
        )));
        match second.recv().await.unwrap() {
            Some(Envelope::Message { headers, data }) => {
                let message = link::from_envelope(headers, data).unwrap();
                assert_eq!(&message.payload()[..], b"next");
            }
            other => panic!("Expected Message, got {:?}", other),
        }

        client.shutdown();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_message_is_dropped_and_link_kept() {
        let (transport, connector) = memory::endpoint("broker");
        let (client, _inbound, outbound) = client(config(), connector);

        let runner = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.run().await }
        });
        let mut broker = accept_link(&transport).await;
        wait_for(&client, LinkState::Streaming).await;

        let headers = Headers::new().with(keys::USER_ID, "u1");
        let huge = Message::new(headers.clone(), vec![0u8; codec::MAX_ENVELOPE_SIZE + 1]);
        assert!(outbound.publish(huge));
        assert!(outbound.publish(Message::new(headers, b"small".to_vec())));

        match broker.recv().await.unwrap() {
            Some(Envelope::Message { headers, data }) => {
                let message = link::from_envelope(headers, data).unwrap();
                assert_eq!(&message.payload()[..], b"small");
            }
            other => panic!("Expected Message, got {:?}", other),
        }
        assert_eq!(client.stats().discarded, 1);
        assert_eq!(client.stats().connects, 1);
        assert_eq!(client.state(), LinkState::Streaming);

        client.shutdown();
        assert!(runner.await.unwrap().is_ok());
    }
}
