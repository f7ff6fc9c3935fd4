//! Accepting side of the link handshake.
//!
//! ```text
//! peer                         tier
//!  | -- setup {route, meta, token} -> |  verify token
//!  | <- accepted {session_id} ------- |  or rejected {code} and close
//!  | -- open {route} ---------------> |  session registered, stream starts
//! ```

use std::time::Duration;
use switchyard_protocol::envelope::reject;
use switchyard_protocol::Envelope;
use switchyard_transport::stream::send_within;
use switchyard_transport::{Connection, TransportError};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::{Claims, TokenVerifier};
use crate::metrics;

/// Why a handshake did not complete.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Handshake timed out")]
    Timeout,

    #[error("Peer left during handshake")]
    Closed,

    /// The peer was sent a `rejected` envelope.
    #[error("Rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },
}

/// A verified setup request.
#[derive(Debug)]
pub struct Setup {
    pub claims: Claims,
    /// Raw setup metadata, `"<type>:<id>"` on tier links.
    pub metadata: String,
}

/// Limit for writing a rejection to a peer that is about to be dropped.
const DECLINE_TIMEOUT: Duration = Duration::from_secs(1);

/// Receive the next envelope within `timeout`.
async fn next(conn: &mut Connection, timeout: Duration) -> Result<Envelope, HandshakeError> {
    tokio::time::timeout(timeout, conn.recv())
        .await
        .map_err(|_| HandshakeError::Timeout)??
        .ok_or(HandshakeError::Closed)
}

/// Decline the handshake and close the link.
pub async fn decline(
    conn: &mut Connection,
    code: u16,
    reason: impl Into<String>,
) -> HandshakeError {
    let reason = reason.into();
    warn!(connection = %conn.id, code, reason = %reason, "Declining connection");
    metrics::record_rejection(code);
    let rejected = Envelope::rejected(code, reason.clone());
    let _ = send_within(conn.sink.as_mut(), rejected, DECLINE_TIMEOUT).await;
    let _ = tokio::time::timeout(DECLINE_TIMEOUT, conn.sink.close()).await;
    HandshakeError::Rejected { code, reason }
}

/// Wait for `setup` on `route` and verify its token.
///
/// # Errors
///
/// Fails on timeout or transport errors, or after rejecting the peer.
pub async fn accept_setup(
    conn: &mut Connection,
    verifier: &dyn TokenVerifier,
    route: &str,
    timeout: Duration,
) -> Result<Setup, HandshakeError> {
    match next(conn, timeout).await? {
        Envelope::Setup {
            route: requested,
            metadata,
            token,
            version,
        } => {
            if requested != route {
                return Err(decline(
                    conn,
                    reject::UNKNOWN_ROUTE,
                    format!("unknown setup route '{requested}'"),
                )
                .await);
            }
            let claims = match verifier.verify(&token).await {
                Ok(claims) => claims,
                Err(e) => return Err(decline(conn, reject::INVALID_TOKEN, e.to_string()).await),
            };
            debug!(connection = %conn.id, subject = %claims.subject, version, "Setup verified");
            Ok(Setup { claims, metadata })
        }
        other => Err(decline(
            conn,
            reject::PROTOCOL_VIOLATION,
            format!("expected setup, got {:?}", other.envelope_type()),
        )
        .await),
    }
}

/// Confirm the session and wait for `open` on `route`.
///
/// # Errors
///
/// Fails on timeout or transport errors, or after rejecting the peer.
pub async fn confirm_and_open(
    conn: &mut Connection,
    session_id: &str,
    keep_alive: Duration,
    route: &str,
    timeout: Duration,
) -> Result<(), HandshakeError> {
    let keep_alive_ms = u32::try_from(keep_alive.as_millis()).unwrap_or(u32::MAX);
    let accepted = Envelope::accepted(session_id, keep_alive_ms);
    send_within(conn.sink.as_mut(), accepted, timeout).await?;

    loop {
        match next(conn, timeout).await? {
            Envelope::Open { route: requested } if requested == route => return Ok(()),
            Envelope::Open { route: requested } => {
                return Err(decline(
                    conn,
                    reject::UNKNOWN_ROUTE,
                    format!("unknown stream route '{requested}'"),
                )
                .await);
            }
            Envelope::Ping { timestamp } => {
                send_within(conn.sink.as_mut(), Envelope::pong(timestamp), timeout).await?;
            }
            other => {
                return Err(decline(
                    conn,
                    reject::PROTOCOL_VIOLATION,
                    format!("expected open, got {:?}", other.envelope_type()),
                )
                .await);
            }
        }
    }
}
