//! Access tier.
//!
//! Edge clients log in with `connect` and open the `im` stream. Each client
//! message becomes a tier message addressed by the client's room or user,
//! queued on the outbound holder and carried to the broker by the upstream
//! client. Messages coming back from the broker name the user session in
//! header `0` and are delivered to it.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    DispatchConfig, Dispatcher, DropReason, InboundHolder, Message, MessageHandler,
    OutboundHolder, Session, SessionRegistry, UserSession,
};
use switchyard_protocol::envelope::reject;
use switchyard_protocol::{keys, Envelope, Headers, InstanceType, MessageKind, ProtocolError};
use switchyard_transport::{
    Connection, Connector, InboundHandler, Transport, TransportError, UpstreamClient,
    UpstreamConfig,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::StatsSource;
use crate::auth::TokenVerifier;
use crate::handshake::{self, HandshakeError};
use crate::metrics::{self, Metered, SessionMetricsGuard};
use crate::pump::{self, LinkHandler, LinkLimits};

/// Access tier settings.
#[derive(Debug, Clone)]
pub struct AccessSettings {
    /// Edge login route.
    pub login_route: String,
    /// Edge stream route.
    pub stream_route: String,
    pub handshake_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub keep_alive_max_lifetime: Duration,
    /// Limit for writing one envelope to an edge client.
    pub write_timeout: Duration,
    /// How long a client message may wait for outbound space.
    pub send_timeout: Duration,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub dispatch: DispatchConfig,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            login_route: "connect".to_string(),
            stream_route: "im".to_string(),
            handshake_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_max_lifetime: Duration::from_secs(90),
            write_timeout: switchyard_transport::DEFAULT_WRITE_TIMEOUT,
            send_timeout: switchyard_core::holder::DEFAULT_SEND_TIMEOUT,
            inbound_capacity: switchyard_core::holder::DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: switchyard_core::holder::DEFAULT_OUTBOUND_CAPACITY,
            dispatch: DispatchConfig::default(),
        }
    }
}

/// An access instance.
pub struct AccessTier {
    instance_id: String,
    settings: AccessSettings,
    registry: Arc<SessionRegistry<UserSession>>,
    verifier: Arc<dyn TokenVerifier>,
    inbound: Arc<InboundHolder>,
    outbound: Arc<OutboundHolder>,
    client: UpstreamClient,
    dispatcher: Arc<dyn Dispatcher>,
    cancel: CancellationToken,
}

impl AccessTier {
    #[must_use]
    pub fn new(
        settings: AccessSettings,
        upstream: UpstreamConfig,
        connector: Arc<dyn Connector>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Arc<Self> {
        let inbound = InboundHolder::with_capacity(settings.inbound_capacity);
        let outbound = OutboundHolder::with_capacity(settings.outbound_capacity);
        Arc::new(Self {
            instance_id: upstream.instance_id.clone(),
            dispatcher: switchyard_core::dispatch::build(&settings.dispatch),
            client: UpstreamClient::new(
                upstream,
                connector,
                Arc::clone(&inbound),
                Arc::clone(&outbound),
            ),
            settings,
            registry: Arc::new(SessionRegistry::new("access")),
            verifier,
            inbound,
            outbound,
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Logged-in users.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry<UserSession>> {
        &self.registry
    }

    /// The link to the broker.
    #[must_use]
    pub fn upstream(&self) -> &UpstreamClient {
        &self.client
    }

    /// Accept edge clients from `transport` until shutdown.
    pub fn listen(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let tier = Arc::clone(self);
        tokio::spawn(async move {
            info!(
                transport = transport.name(),
                instance = %tier.instance_id,
                "Accepting edge clients"
            );
            loop {
                let accepted = tokio::select! {
                    () = tier.cancel.cancelled() => break,
                    accepted = transport.accept() => accepted,
                };
                match accepted {
                    Ok(conn) => {
                        tokio::spawn(Arc::clone(&tier).handle_client(conn));
                    }
                    Err(TransportError::ConnectionClosed) => break,
                    Err(e) => warn!(error = %e, "Failed to accept edge client"),
                }
            }
        })
    }

    /// Run the upstream link and inbound delivery until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream client gives up or was already
    /// started.
    pub async fn run(&self) -> Result<()> {
        let stream = self
            .inbound
            .subscribe()
            .ok_or_else(|| anyhow::anyhow!("Access tier is already running"))?;
        let handler = Arc::new(Metered::new(
            DeliverHandler {
                registry: Arc::clone(&self.registry),
            },
            "delivered",
        ));
        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatch = tokio::spawn(async move { dispatcher.run(stream, handler).await });
        let watcher = tokio::spawn(metrics::watch_upstream(self.client.watch_state()));

        let upstream = self.client.run().await;
        self.shutdown();
        let _ = dispatch.await;
        watcher.abort();
        upstream?;
        Ok(())
    }

    /// Log everyone out and stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.client.shutdown();
        self.registry.clear();
        self.inbound.close();
        self.outbound.close();
        self.dispatcher.shutdown();
    }

    async fn handle_client(self: Arc<Self>, mut conn: Connection) {
        let session = match self.login(&mut conn).await {
            Ok(session) => session,
            Err(e) => {
                debug!(connection = %conn.id, error = %e, "Edge login failed");
                return;
            }
        };
        let Some(outbox) = session.outbox().take_stream() else {
            self.registry.remove_session(&session);
            return;
        };
        let _guard = SessionMetricsGuard::new("access");
        info!(user = %session.user_id(), session = %session.session_id(), "User logged in");

        let (id, sink, source) = conn.split();
        let handler = Arc::new(EdgeLink {
            session: Arc::clone(&session),
            outbound: Arc::clone(&self.outbound),
            instance_id: self.instance_id.clone(),
            send_timeout: self.settings.send_timeout,
        });
        let limits = LinkLimits {
            idle: self.settings.keep_alive_max_lifetime,
            write: self.settings.write_timeout,
        };
        let end = pump::pump(&id, sink, source, outbox, handler, limits).await;

        self.registry.remove_session(&session);
        info!(user = %session.user_id(), end = ?end, "User left");
    }

    async fn login(&self, conn: &mut Connection) -> Result<Arc<UserSession>, HandshakeError> {
        let timeout = self.settings.handshake_timeout;
        let setup = handshake::accept_setup(
            conn,
            self.verifier.as_ref(),
            &self.settings.login_route,
            timeout,
        )
        .await?;
        if setup.claims.is_instance() {
            return Err(handshake::decline(
                conn,
                reject::INVALID_TOKEN,
                "instance tokens cannot log in as users",
            )
            .await);
        }

        let claims = setup.claims;
        let session = UserSession::new(
            claims.subject,
            claims.device_id,
            claims.platform,
            conn.id.clone(),
        );
        handshake::confirm_and_open(
            conn,
            session.session_id(),
            self.settings.keep_alive_interval,
            &self.settings.stream_route,
            timeout,
        )
        .await?;
        Ok(self.registry.create(session))
    }
}

impl StatsSource for AccessTier {
    fn stats(&self) -> Value {
        let upstream = self.client.stats();
        let inbound = self.inbound.stats();
        let outbound = self.outbound.stats();
        let dispatch = self.dispatcher.stats();
        json!({
            "users": self.registry.count(),
            "upstream": {
                "state": format!("{:?}", self.client.state()),
                "connects": upstream.connects,
                "reconnects": upstream.reconnects,
                "discarded": upstream.discarded,
                "skipped": upstream.skipped,
            },
            "inbound": { "published": inbound.published, "dropped": inbound.dropped },
            "outbound": { "published": outbound.published, "dropped": outbound.dropped },
            "dispatch": {
                "dispatched": dispatch.dispatched,
                "dropped": dispatch.dropped,
                "panicked": dispatch.panicked,
            },
        })
    }
}

/// One edge client's link.
struct EdgeLink {
    session: Arc<UserSession>,
    outbound: Arc<OutboundHolder>,
    instance_id: String,
    send_timeout: Duration,
}

impl EdgeLink {
    fn tier_headers(&self, client: &Headers) -> Headers {
        let mut headers = Headers::new()
            .with(keys::SESSION_ID, self.session.session_id())
            .with(keys::USER_ID, self.session.user_id())
            .with(keys::INSTANCE_TYPE, InstanceType::Access.code())
            .with(keys::FROM_INSTANCE_ID, self.instance_id.as_str())
            .with(keys::MESSAGE_TYPE, MessageKind::Client.code());
        if let Some(room) = client.room_id() {
            headers.insert(keys::ROOM_ID, room);
        }
        headers
    }
}

#[async_trait]
impl InboundHandler for EdgeLink {
    async fn on_message(&self, headers: Headers, data: Bytes) {
        let message = Message::new(self.tier_headers(&headers), data);
        let size = message.payload_size();
        if self.outbound.send_timeout(message, self.send_timeout).await {
            metrics::record_message(size, "upstream");
        } else {
            metrics::record_drop("outbound_full");
        }
    }

    fn on_traffic(&self) {
        self.session.touch();
    }

    fn on_skipped(&self, _error: &ProtocolError) {
        metrics::record_drop("undecodable");
    }
}

impl LinkHandler for EdgeLink {
    fn encode(&self, message: &Message) -> Result<Envelope, ProtocolError> {
        let mut headers = Headers::new();
        for key in [keys::USER_ID, keys::ROOM_ID] {
            if let Some(value) = message.headers.get(key) {
                headers.insert(key, value);
            }
        }
        Ok(Envelope::message(headers, message.payload().clone()))
    }
}

/// Delivers broker messages to user sessions.
struct DeliverHandler {
    registry: Arc<SessionRegistry<UserSession>>,
}

#[async_trait]
impl MessageHandler for DeliverHandler {
    async fn handle(&self, message: Message) -> Result<(), DropReason> {
        let Some(session_id) = message.headers.session_id().map(str::to_string) else {
            message.release("missing session id");
            return Err(DropReason::MissingHeader(keys::SESSION_ID));
        };
        let Some(session) = self.registry.get_by_session_id(&session_id) else {
            message.release("user session gone");
            return Err(DropReason::SessionNotFound(session_id));
        };
        if session.send(message) {
            Ok(())
        } else {
            Err(DropReason::SessionClosed(session_id))
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Log in over `connector` and open the `im` stream.
    pub(crate) async fn login(connector: &dyn Connector, token: &str) -> (Connection, String) {
        let mut conn = connector.connect().await.unwrap();
        conn.send(Envelope::setup("connect", "", token))
            .await
            .unwrap();
        let session_id = match conn.recv().await.unwrap() {
            Some(Envelope::Accepted { session_id, .. }) => session_id,
            other => panic!("Expected Accepted, got {:?}", other),
        };
        conn.send(Envelope::open("im")).await.unwrap();
        (conn, session_id)
    }
}
