//! Admin HTTP endpoint: `/health` and `/stats`.

use anyhow::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Role;

/// A tier that can report its counters.
pub trait StatsSource: Send + Sync {
    fn stats(&self) -> Value;
}

/// Shared admin state.
#[derive(Clone)]
pub struct AdminState {
    pub role: Role,
    pub instance_id: String,
    pub source: Arc<dyn StatsSource>,
}

/// Build the admin router.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Serve the admin endpoint until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn serve(addr: SocketAddr, state: AdminState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Admin endpoint listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "role": state.role.as_str(),
        "instance": state.instance_id,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(state): State<AdminState>) -> Json<Value> {
    Json(json!({
        "role": state.role.as_str(),
        "instance": state.instance_id,
        "stats": state.source.stats(),
    }))
}
