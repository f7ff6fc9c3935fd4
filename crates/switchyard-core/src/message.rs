//! Messages moved through the broker tiers.
//!
//! A [`Message`] owns its payload. Payloads are not `Clone`: every message
//! has exactly one terminal point where the payload is dropped, whether it
//! was delivered, rejected by backpressure, or discarded by routing.
//! [`LeaseTracker`] makes that observable so tests can prove nothing leaks.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use switchyard_protocol::{Headers, RouteMetadata};
use tracing::trace;

/// A unique message identifier.
pub type MessageId = u64;

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    timestamp.wrapping_add(counter)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Counts payload leases issued and released.
#[derive(Debug, Default)]
pub struct LeaseTracker {
    issued: AtomicUsize,
    released: AtomicUsize,
}

impl LeaseTracker {
    /// Create a tracker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Leases handed out so far.
    #[must_use]
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    /// Leases released so far.
    #[must_use]
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Leases not yet released.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.issued().saturating_sub(self.released())
    }
}

/// A lease on a tracked payload. Released on drop.
struct Lease(Arc<LeaseTracker>);

impl Lease {
    fn acquire(tracker: &Arc<LeaseTracker>) -> Self {
        tracker.issued.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(tracker))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.0.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Opaque payload bytes with single-owner release semantics.
pub struct Payload {
    bytes: Bytes,
    lease: Option<Lease>,
}

impl Payload {
    /// Wrap bytes without tracking.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            lease: None,
        }
    }

    /// Wrap bytes and register a lease with `tracker`.
    #[must_use]
    pub fn tracked(bytes: impl Into<Bytes>, tracker: &Arc<LeaseTracker>) -> Self {
        Self {
            bytes: bytes.into(),
            lease: Some(Lease::acquire(tracker)),
        }
    }

    /// Borrow the bytes.
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Payload length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether this payload carries a lease.
    #[must_use]
    pub fn is_tracked(&self) -> bool {
        self.lease.is_some()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.bytes.len())
            .field("tracked", &self.lease.is_some())
            .finish()
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::new(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::new(bytes)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::new(Bytes::from_static(bytes))
    }
}

/// A routed message.
#[derive(Debug)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Compact routing headers.
    pub headers: Headers,
    /// Frame route metadata.
    pub route: RouteMetadata,
    /// Opaque payload.
    pub payload: Payload,
}

impl Message {
    /// Create a message. The route defaults to whatever the headers imply.
    #[must_use]
    pub fn new(headers: Headers, payload: impl Into<Payload>) -> Self {
        let route = headers
            .route_metadata()
            .unwrap_or_else(RouteMetadata::unknown);
        Self {
            id: generate_message_id(),
            headers,
            route,
            payload: payload.into(),
        }
    }

    /// Override the frame route metadata.
    #[must_use]
    pub fn with_route(mut self, route: RouteMetadata) -> Self {
        self.route = route;
        self
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        self.payload.bytes()
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Terminal consumption of an undeliverable message.
    pub fn release(self, reason: &str) {
        trace!(message = self.id, reason, "Releasing message");
    }
}
