//! Broker tier.
//!
//! Access and logic instances dial the broker and hold one streaming link
//! each. Frames arriving on any link go into the inbound holder; the
//! dispatcher routes them:
//!
//! - from access (`3=A`): consistent-hash router over ONLINE logic
//!   sessions, keyed by the room or user in the headers, or by the frame's
//!   own route metadata when the headers carry none
//! - from logic (`3=L`): straight to the access session named by `5`

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    ConsistentHashRouter, DispatchConfig, Dispatcher, DropReason, InboundHolder, Message,
    MessageHandler, RegistryObserver, ServiceSession, ServiceStatus, Session, SessionRegistry,
};
use switchyard_protocol::envelope::reject;
use switchyard_protocol::headers::parse_setup_metadata;
use switchyard_protocol::{keys, Envelope, Headers, InstanceType, ProtocolError};
use switchyard_transport::{link, Connection, InboundHandler, Transport, TransportError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admin::StatsSource;
use crate::auth::TokenVerifier;
use crate::handshake::{self, HandshakeError};
use crate::metrics::{self, Metered, SessionMetricsGuard};
use crate::pump::{self, LinkHandler, LinkLimits};

/// Broker settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub setup_route: String,
    pub channel_route: String,
    pub handshake_timeout: Duration,
    /// Announced to instances in `accepted`.
    pub keep_alive_interval: Duration,
    /// Links silent for longer are dropped.
    pub keep_alive_max_lifetime: Duration,
    /// Limit for writing one envelope to an instance.
    pub write_timeout: Duration,
    pub inbound_capacity: usize,
    pub dispatch: DispatchConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            setup_route: "connect".to_string(),
            channel_route: "channel".to_string(),
            handshake_timeout: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(30),
            keep_alive_max_lifetime: Duration::from_secs(90),
            write_timeout: switchyard_transport::DEFAULT_WRITE_TIMEOUT,
            inbound_capacity: switchyard_core::holder::DEFAULT_INBOUND_CAPACITY,
            dispatch: DispatchConfig::default(),
        }
    }
}

/// The broker.
pub struct Broker {
    settings: BrokerSettings,
    registry: Arc<SessionRegistry<ServiceSession>>,
    router: Arc<ConsistentHashRouter>,
    verifier: Arc<dyn TokenVerifier>,
    inbound: Arc<InboundHolder>,
    dispatcher: Arc<dyn Dispatcher>,
    cancel: CancellationToken,
}

impl Broker {
    #[must_use]
    pub fn new(settings: BrokerSettings, verifier: Arc<dyn TokenVerifier>) -> Arc<Self> {
        let router = Arc::new(ConsistentHashRouter::new());
        let observer: Arc<dyn RegistryObserver<ServiceSession>> = router.clone();
        let registry = Arc::new(SessionRegistry::new("broker").with_observer(observer));
        Arc::new(Self {
            inbound: InboundHolder::with_capacity(settings.inbound_capacity),
            dispatcher: switchyard_core::dispatch::build(&settings.dispatch),
            settings,
            registry,
            router,
            verifier,
            cancel: CancellationToken::new(),
        })
    }

    /// Registered instances.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry<ServiceSession>> {
        &self.registry
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ConsistentHashRouter> {
        &self.router
    }

    /// Accept tier links from `transport` until shutdown.
    pub fn listen(self: &Arc<Self>, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            info!(transport = transport.name(), "Broker accepting links");
            loop {
                let accepted = tokio::select! {
                    () = broker.cancel.cancelled() => break,
                    accepted = transport.accept() => accepted,
                };
                match accepted {
                    Ok(conn) => {
                        tokio::spawn(Arc::clone(&broker).handle_link(conn));
                    }
                    Err(TransportError::ConnectionClosed) => break,
                    Err(e) => warn!(error = %e, "Failed to accept link"),
                }
            }
            debug!(transport = transport.name(), "Broker listener stopped");
        })
    }

    /// Route inbound frames until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if called twice.
    pub async fn run(&self) -> Result<()> {
        let stream = self
            .inbound
            .subscribe()
            .ok_or_else(|| anyhow!("Broker is already running"))?;
        let handler = Arc::new(Metered::new(
            BrokerHandler {
                registry: Arc::clone(&self.registry),
                router: Arc::clone(&self.router),
            },
            "routed",
        ));
        self.dispatcher.run(stream, handler).await;
        info!(stats = ?self.dispatcher.stats(), "Broker dispatch stopped");
        Ok(())
    }

    /// Close every link and stop routing.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.registry.clear();
        self.inbound.close();
        self.dispatcher.shutdown();
    }

    async fn handle_link(self: Arc<Self>, mut conn: Connection) {
        let session = match self.handshake(&mut conn).await {
            Ok(session) => session,
            Err(e) => {
                debug!(connection = %conn.id, error = %e, "Link handshake failed");
                return;
            }
        };
        let Some(outbox) = session.outbox().take_stream() else {
            self.registry.remove_session(&session);
            return;
        };
        let _guard = SessionMetricsGuard::new("broker");
        info!(
            instance = %session.instance_id(),
            instance_type = %session.instance_type(),
            session = %session.session_id(),
            "Instance registered"
        );

        let (id, sink, source) = conn.split();
        let handler = Arc::new(InstanceLink {
            session: Arc::clone(&session),
            inbound: Arc::clone(&self.inbound),
        });
        let limits = LinkLimits {
            idle: self.settings.keep_alive_max_lifetime,
            write: self.settings.write_timeout,
        };
        let end = pump::pump(&id, sink, source, outbox, handler, limits).await;

        session.set_status(ServiceStatus::Offline);
        self.registry.remove_session(&session);
        info!(instance = %session.instance_id(), end = ?end, "Instance left");
    }

    async fn handshake(
        &self,
        conn: &mut Connection,
    ) -> Result<Arc<ServiceSession>, HandshakeError> {
        let timeout = self.settings.handshake_timeout;
        let setup = handshake::accept_setup(
            conn,
            self.verifier.as_ref(),
            &self.settings.setup_route,
            timeout,
        )
        .await?;

        let (instance_type, instance_id) = match parse_setup_metadata(&setup.metadata) {
            Ok((InstanceType::Broker, _)) => {
                return Err(handshake::decline(
                    conn,
                    reject::INVALID_METADATA,
                    "brokers do not dial brokers",
                )
                .await);
            }
            Ok(parsed) => parsed,
            Err(e) => {
                return Err(handshake::decline(conn, reject::INVALID_METADATA, e).await);
            }
        };
        if let Err(e) = setup.claims.ensure_instance(instance_type, &instance_id) {
            return Err(handshake::decline(conn, reject::INVALID_TOKEN, e.to_string()).await);
        }

        let session = ServiceSession::new(instance_type, instance_id, conn.id.clone());
        handshake::confirm_and_open(
            conn,
            session.session_id(),
            self.settings.keep_alive_interval,
            &self.settings.channel_route,
            timeout,
        )
        .await?;
        Ok(self.registry.create(session))
    }
}

impl StatsSource for Broker {
    fn stats(&self) -> Value {
        let router = self.router.stats();
        let inbound = self.inbound.stats();
        let dispatch = self.dispatcher.stats();
        json!({
            "sessions": {
                "access": self.registry.count_where(|s| s.instance_type() == InstanceType::Access),
                "logic": self.registry.count_where(|s| s.instance_type() == InstanceType::Logic),
                "instances": self.registry.keys(),
            },
            "router": { "cached_rings": router.cached_rings, "generation": router.generation },
            "inbound": { "published": inbound.published, "dropped": inbound.dropped },
            "dispatch": {
                "dispatched": dispatch.dispatched,
                "dropped": dispatch.dropped,
                "panicked": dispatch.panicked,
            },
        })
    }
}

/// One instance's link.
struct InstanceLink {
    session: Arc<ServiceSession>,
    inbound: Arc<InboundHolder>,
}

#[async_trait]
impl InboundHandler for InstanceLink {
    async fn on_message(&self, headers: Headers, data: Bytes) {
        match link::from_envelope(headers, data) {
            Ok(message) => {
                if !self.inbound.publish(message) {
                    metrics::record_drop("inbound_full");
                }
            }
            Err(e) => {
                warn!(
                    instance = %self.session.instance_id(),
                    error = %e,
                    "Dropping malformed frame"
                );
                metrics::record_drop("malformed_frame");
            }
        }
    }

    fn on_traffic(&self) {
        self.session.touch();
    }

    fn on_skipped(&self, _error: &ProtocolError) {
        metrics::record_drop("undecodable");
    }
}

impl LinkHandler for InstanceLink {
    fn encode(&self, message: &Message) -> Result<Envelope, ProtocolError> {
        link::to_envelope(message)
    }
}

/// Routes one inbound frame.
pub(crate) struct BrokerHandler {
    registry: Arc<SessionRegistry<ServiceSession>>,
    router: Arc<ConsistentHashRouter>,
}

impl BrokerHandler {
    fn to_logic(&self, message: Message) -> Result<(), DropReason> {
        let route = message
            .headers
            .route_metadata()
            .unwrap_or_else(|| message.route.clone());
        let eligible = self
            .registry
            .sessions_where(|s| s.instance_type() == InstanceType::Logic);
        let mut targets = self.router.route(&route, &eligible);

        match targets.len() {
            0 => {
                message.release("no route");
                Err(DropReason::NoRoute {
                    route_type: route.route_type,
                    route_key: route.route_key,
                })
            }
            1 => {
                let target = targets.remove(0);
                if target.send(message) {
                    Ok(())
                } else {
                    Err(DropReason::SessionClosed(target.instance_id().to_string()))
                }
            }
            _ => {
                // Broadcast: every target gets its own handle on the same bytes.
                let mut accepted = 0;
                for target in &targets {
                    let copy = Message::new(message.headers.clone(), message.payload().clone())
                        .with_route(message.route.clone());
                    if target.send(copy) {
                        accepted += 1;
                    } else {
                        debug!(instance = %target.instance_id(), "Broadcast copy dropped");
                        metrics::record_drop("broadcast_copy");
                    }
                }
                message.release("fanned out");
                if accepted == 0 {
                    return Err(DropReason::NoRoute {
                        route_type: route.route_type,
                        route_key: route.route_key,
                    });
                }
                Ok(())
            }
        }
    }

    fn to_access(&self, message: Message) -> Result<(), DropReason> {
        let Some(to) = message.headers.to_instance_id().map(str::to_string) else {
            message.release("missing target instance");
            return Err(DropReason::MissingHeader(keys::TO_INSTANCE_ID));
        };
        let target = self
            .registry
            .get(&to)
            .filter(|s| s.instance_type() == InstanceType::Access);
        let Some(target) = target else {
            message.release("unknown access instance");
            return Err(DropReason::SessionNotFound(to));
        };
        if !target.is_routable() {
            message.release("access instance offline");
            return Err(DropReason::NotAccepting(to));
        }
        if target.send(message) {
            Ok(())
        } else {
            Err(DropReason::SessionClosed(to))
        }
    }
}

#[async_trait]
impl MessageHandler for BrokerHandler {
    async fn handle(&self, message: Message) -> Result<(), DropReason> {
        let Some(raw) = message.headers.get(keys::INSTANCE_TYPE).map(str::to_string) else {
            message.release("missing instance type");
            return Err(DropReason::MissingHeader(keys::INSTANCE_TYPE));
        };
        match message.headers.instance_type() {
            Some(InstanceType::Access) => self.to_logic(message),
            Some(InstanceType::Logic) => self.to_access(message),
            _ => {
                message.release("unroutable instance type");
                Err(DropReason::UnknownInstanceType(raw))
            }
        }
    }
}
