//! Inbound and outbound holders.
//!
//! A holder decouples the side that produces messages from the one task
//! that consumes them. Publishing never blocks: when the bounded buffer is
//! full the newest message is released and the caller gets `false` back.
//! The outbound holder also offers [`OutboundHolder::send_timeout`] for
//! producers that can afford to wait a little.

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::message::Message;

/// Default inbound buffer capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 4096;

/// Default outbound buffer capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Default wait for [`OutboundHolder::send_timeout`].
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Holder counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HolderStats {
    /// Messages accepted into the buffer.
    pub published: u64,
    /// Messages released because the buffer was full or closed.
    pub dropped: u64,
}

/// A bounded, single-consumer message buffer with drop-newest overflow.
pub struct Holder {
    name: &'static str,
    tx: mpsc::Sender<Message>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: CancellationToken,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Holder {
    fn new(name: &'static str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Holder name used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Publish without waiting.
    ///
    /// Returns `false` if the message was dropped. A dropped message has
    /// already been released when this returns.
    pub fn publish(&self, message: Message) -> bool {
        if self.closed.is_cancelled() {
            self.drop_message(message, "holder closed");
            return false;
        }

        match self.tx.try_send(message) {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(message)) => {
                self.drop_message(message, "buffer full");
                false
            }
            Err(TrySendError::Closed(message)) => {
                self.drop_message(message, "holder closed");
                false
            }
        }
    }

    /// Take the single consumer stream.
    ///
    /// Returns `None` if the stream was already taken.
    pub fn subscribe(&self) -> Option<HolderStream> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        Some(HolderStream {
            rx,
            closed: self.closed.clone(),
        })
    }

    /// Close the holder. Further publishes fail and the consumer stream ends.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(holder = self.name, "Closing holder");
            self.closed.cancel();
        }
    }

    /// Whether the holder has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Messages currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get counters.
    #[must_use]
    pub fn stats(&self) -> HolderStats {
        HolderStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn drop_message(&self, message: Message, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        trace!(holder = self.name, reason, "Dropping message");
        message.release(reason);
    }
}

/// The consumer side of a holder.
pub struct HolderStream {
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl HolderStream {
    /// Receive the next message. Returns `None` once the holder is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

/// Messages arriving from the transport, consumed by dispatch.
pub struct InboundHolder(Holder);

impl InboundHolder {
    /// Create an inbound holder with the default capacity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_INBOUND_CAPACITY)
    }

    /// Create an inbound holder with a custom capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self(Holder::new("inbound", capacity)))
    }
}

impl Deref for InboundHolder {
    type Target = Holder;

    fn deref(&self) -> &Holder {
        &self.0
    }
}

/// Messages produced locally, consumed by the upstream link.
pub struct OutboundHolder(Holder);

impl OutboundHolder {
    /// Create an outbound holder with the default capacity.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Create an outbound holder with a custom capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self(Holder::new("outbound", capacity)))
    }

    /// Publish, waiting up to `timeout` for buffer space.
    ///
    /// A timeout or a close while waiting drops and releases the message
    /// exactly like a failed [`Holder::publish`].
    pub async fn send_timeout(&self, message: Message, timeout: Duration) -> bool {
        let holder = &self.0;
        if holder.closed.is_cancelled() {
            holder.drop_message(message, "holder closed");
            return false;
        }

        let reserved = tokio::select! {
            biased;
            () = holder.closed.cancelled() => None,
            permit = tokio::time::timeout(timeout, holder.tx.reserve()) => Some(permit),
        };

        match reserved {
            Some(Ok(Ok(permit))) => {
                permit.send(message);
                holder.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(Err(_elapsed)) => {
                holder.drop_message(message, "send timeout");
                false
            }
            Some(Ok(Err(_))) | None => {
                holder.drop_message(message, "holder closed");
                false
            }
        }
    }
}

impl Deref for OutboundHolder {
    type Target = Holder;

    fn deref(&self) -> &Holder {
        &self.0
    }
}
