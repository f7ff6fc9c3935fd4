//! # Switchyard
//!
//! Routes opaque messages between edge clients and business-logic workers
//! through a broker. One binary runs any of the three tiers.
//!
//! ## Usage
//!
//! ```bash
//! # Run the broker with default settings
//! switchyard
//!
//! # Run with a custom config
//! SWITCHYARD_CONFIG=/path/to/switchyard.toml switchyard
//!
//! # Run an access instance from environment variables
//! SWITCHYARD_ROLE=access SWITCHYARD_PORT=7100 switchyard
//! ```

mod access;
mod admin;
mod auth;
mod broker;
mod config;
mod handshake;
mod logic;
mod metrics;
mod pump;

#[cfg(test)]
mod e2e;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use switchyard_transport::{WebSocketConnector, WebSocketTransport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::access::{AccessSettings, AccessTier};
use crate::admin::{AdminState, StatsSource};
use crate::auth::{StaticTokenVerifier, TokenVerifier};
use crate::broker::{Broker, BrokerSettings};
use crate::config::{Config, Role};
use crate::logic::{EchoHandler, LogicSettings, LogicTier};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchyard=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    info!(
        role = %config.role,
        instance = %config.instance_id,
        "Starting Switchyard on {}:{}",
        config.host,
        config.port
    );

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(StaticTokenVerifier::from_config(&config.auth)?);
    let admin = CancellationToken::new();

    let result = match config.role {
        Role::Broker => run_broker(&config, verifier, &admin).await,
        Role::Access => run_access(&config, verifier, &admin).await,
        Role::Logic => run_logic(&config, &admin).await,
    };

    admin.cancel();
    info!("Switchyard stopped");
    result
}

async fn run_broker(
    config: &Config,
    verifier: Arc<dyn TokenVerifier>,
    admin: &CancellationToken,
) -> Result<()> {
    let (keep_alive_interval, keep_alive_max_lifetime) = config.keep_alive();
    let settings = BrokerSettings {
        setup_route: config.upstream.setup_route.clone(),
        channel_route: config.upstream.channel_route.clone(),
        handshake_timeout: config.handshake_timeout(),
        keep_alive_interval,
        keep_alive_max_lifetime,
        write_timeout: config.write_timeout(),
        inbound_capacity: config.holders.inbound_capacity,
        dispatch: config.dispatch_config()?,
    };
    let broker = Broker::new(settings, verifier);

    let transport = WebSocketTransport::bind(config.bind_addr()?).await?;
    broker.listen(Arc::new(transport));
    spawn_admin(config, broker.clone(), admin);
    on_ctrl_c({
        let broker = Arc::clone(&broker);
        move || broker.shutdown()
    });

    broker.run().await
}

async fn run_access(
    config: &Config,
    verifier: Arc<dyn TokenVerifier>,
    admin: &CancellationToken,
) -> Result<()> {
    let (keep_alive_interval, keep_alive_max_lifetime) = config.keep_alive();
    let settings = AccessSettings {
        handshake_timeout: config.handshake_timeout(),
        keep_alive_interval,
        keep_alive_max_lifetime,
        write_timeout: config.write_timeout(),
        send_timeout: config.holders.send_timeout(),
        inbound_capacity: config.holders.inbound_capacity,
        outbound_capacity: config.holders.outbound_capacity,
        dispatch: config.dispatch_config()?,
        ..AccessSettings::default()
    };
    let upstream = config.upstream_config()?;
    let connector = Arc::new(WebSocketConnector::new(upstream.url()));
    let tier = AccessTier::new(settings, upstream, connector, verifier);

    let transport = WebSocketTransport::bind(config.bind_addr()?).await?;
    tier.listen(Arc::new(transport));
    spawn_admin(config, tier.clone(), admin);
    on_ctrl_c({
        let tier = Arc::clone(&tier);
        move || tier.shutdown()
    });

    tier.run().await
}

async fn run_logic(config: &Config, admin: &CancellationToken) -> Result<()> {
    let settings = LogicSettings {
        send_timeout: config.holders.send_timeout(),
        inbound_capacity: config.holders.inbound_capacity,
        outbound_capacity: config.holders.outbound_capacity,
        dispatch: config.dispatch_config()?,
    };
    let upstream = config.upstream_config()?;
    let connector = Arc::new(WebSocketConnector::new(upstream.url()));
    let tier = LogicTier::new(settings, upstream, connector, Arc::new(EchoHandler));

    spawn_admin(config, tier.clone(), admin);
    on_ctrl_c({
        let tier = Arc::clone(&tier);
        move || tier.shutdown()
    });

    tier.run().await
}

fn spawn_admin(config: &Config, source: Arc<dyn StatsSource>, cancel: &CancellationToken) {
    if !config.admin.enabled {
        return;
    }
    let addr = SocketAddr::from(([0, 0, 0, 0], config.admin.port));
    let state = AdminState {
        role: config.role,
        instance_id: config.instance_id.clone(),
        source,
    };
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = admin::serve(addr, state, cancel).await {
            error!("Admin endpoint failed: {}", e);
        }
    });
}

fn on_ctrl_c(shutdown: impl FnOnce() + Send + 'static) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown();
        }
    });
}
