//! Logic tier.
//!
//! Receives client messages the broker routed here and hands them to a
//! [`LogicHandler`]. Whatever the handler answers is addressed back through
//! the broker to an access instance and a user session on it. Payloads stay
//! opaque bytes on this side of the boundary.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{
    DispatchConfig, Dispatcher, DropReason, InboundHolder, Message, MessageHandler,
    OutboundHolder,
};
use switchyard_protocol::{keys, Headers, InstanceType, MessageKind, RouteMetadata};
use switchyard_transport::{Connector, UpstreamClient, UpstreamConfig};
use tracing::{debug, info};

use crate::admin::StatsSource;
use crate::metrics::{self, Metered};

/// A message handed to business logic.
#[derive(Debug, Clone)]
pub struct LogicRequest {
    pub headers: Headers,
    pub route: RouteMetadata,
    pub payload: Bytes,
}

/// A message business logic wants delivered to a user session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicReply {
    pub session_id: String,
    pub access_instance_id: String,
    pub user_id: Option<String>,
    pub payload: Bytes,
}

impl LogicReply {
    /// A reply to whoever sent `request`, if the request says who that is.
    #[must_use]
    pub fn to_sender(request: &LogicRequest, payload: impl Into<Bytes>) -> Option<Self> {
        Some(Self {
            session_id: request.headers.session_id()?.to_string(),
            access_instance_id: request.headers.from_instance_id()?.to_string(),
            user_id: request.headers.user_id().map(str::to_string),
            payload: payload.into(),
        })
    }
}

/// Business logic boundary.
#[async_trait]
pub trait LogicHandler: Send + Sync + 'static {
    async fn handle(&self, request: LogicRequest) -> Vec<LogicReply>;
}

/// Sends every payload back to its sender.
#[derive(Debug, Default)]
pub struct EchoHandler;

#[async_trait]
impl LogicHandler for EchoHandler {
    async fn handle(&self, request: LogicRequest) -> Vec<LogicReply> {
        let payload = request.payload.clone();
        LogicReply::to_sender(&request, payload).into_iter().collect()
    }
}

/// Logic tier settings.
#[derive(Debug, Clone)]
pub struct LogicSettings {
    pub send_timeout: Duration,
    pub inbound_capacity: usize,
    pub outbound_capacity: usize,
    pub dispatch: DispatchConfig,
}

impl Default for LogicSettings {
    fn default() -> Self {
        Self {
            send_timeout: switchyard_core::holder::DEFAULT_SEND_TIMEOUT,
            inbound_capacity: switchyard_core::holder::DEFAULT_INBOUND_CAPACITY,
            outbound_capacity: switchyard_core::holder::DEFAULT_OUTBOUND_CAPACITY,
            dispatch: DispatchConfig::default(),
        }
    }
}

/// A logic instance.
pub struct LogicTier {
    instance_id: String,
    settings: LogicSettings,
    inbound: Arc<InboundHolder>,
    outbound: Arc<OutboundHolder>,
    client: UpstreamClient,
    dispatcher: Arc<dyn Dispatcher>,
    handler: Arc<dyn LogicHandler>,
}

impl LogicTier {
    #[must_use]
    pub fn new(
        settings: LogicSettings,
        upstream: UpstreamConfig,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn LogicHandler>,
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
            inbound,
            outbound,
            handler,
        })
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The link to the broker.
    #[must_use]
    pub fn upstream(&self) -> &UpstreamClient {
        &self.client
    }

    /// Run the upstream link and the logic pipeline until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream client gives up or was already
    /// started.
    pub async fn run(&self) -> Result<()> {
        let stream = self
            .inbound
            .subscribe()
            .ok_or_else(|| anyhow::anyhow!("Logic tier is already running"))?;
        let handler = Arc::new(Metered::new(
            LogicDispatch {
                instance_id: self.instance_id.clone(),
                outbound: Arc::clone(&self.outbound),
                handler: Arc::clone(&self.handler),
                send_timeout: self.settings.send_timeout,
            },
            "handled",
        ));
        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatch = tokio::spawn(async move { dispatcher.run(stream, handler).await });
        let watcher = tokio::spawn(metrics::watch_upstream(self.client.watch_state()));
        info!(instance = %self.instance_id, "Logic tier running");

        let upstream = self.client.run().await;
        self.shutdown();
        let _ = dispatch.await;
        watcher.abort();
        upstream?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.client.shutdown();
        self.inbound.close();
        self.outbound.close();
        self.dispatcher.shutdown();
    }
}

impl StatsSource for LogicTier {
    fn stats(&self) -> Value {
        let upstream = self.client.stats();
        let dispatch = self.dispatcher.stats();
        json!({
            "upstream": {
                "state": format!("{:?}", self.client.state()),
                "connects": upstream.connects,
                "reconnects": upstream.reconnects,
                "discarded": upstream.discarded,
                "skipped": upstream.skipped,
            },
            "inbound": self.inbound.stats().published,
            "outbound": self.outbound.stats().published,
            "dispatch": {
                "dispatched": dispatch.dispatched,
                "dropped": dispatch.dropped,
                "panicked": dispatch.panicked,
            },
        })
    }
}

struct LogicDispatch {
    instance_id: String,
    outbound: Arc<OutboundHolder>,
    handler: Arc<dyn LogicHandler>,
    send_timeout: Duration,
}

impl LogicDispatch {
    fn reply_message(&self, reply: LogicReply) -> Message {
        let mut headers = Headers::new()
            .with(keys::SESSION_ID, reply.session_id)
            .with(keys::INSTANCE_TYPE, InstanceType::Logic.code())
            .with(keys::FROM_INSTANCE_ID, self.instance_id.as_str())
            .with(keys::TO_INSTANCE_ID, reply.access_instance_id)
            .with(keys::MESSAGE_TYPE, MessageKind::Server.code());
        if let Some(user_id) = reply.user_id {
            headers.insert(keys::USER_ID, user_id);
        }
        Message::new(headers, reply.payload)
    }
}

#[async_trait]
impl MessageHandler for LogicDispatch {
    async fn handle(&self, message: Message) -> Result<(), DropReason> {
        let request = LogicRequest {
            headers: message.headers.clone(),
            route: message.route.clone(),
            payload: message.payload().clone(),
        };
        message.release("handed to logic");

        for reply in self.handler.handle(request).await {
            let reply = self.reply_message(reply);
            let id = reply.id;
            if !self.outbound.send_timeout(reply, self.send_timeout).await {
                debug!(message = id, "Reply dropped");
                metrics::record_drop("outbound_full");
            }
        }
        Ok(())
    }
}
