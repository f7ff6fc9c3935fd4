//! Live sessions.
//!
//! A session binds a transport connection to a logical identity. Sessions
//! never do I/O themselves: [`Session::send`] queues onto a private outbox
//! and the connection's writer task drains it.

mod service;
mod user;

pub use service::{ServiceSession, ServiceStatus};
pub use user::UserSession;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectionId;
use crate::message::{now_millis, Message};

/// Common behaviour of registered sessions.
pub trait Session: Send + Sync + 'static {
    /// Logical key the registry indexes this session by.
    fn key(&self) -> &str;

    /// Unique id of this session.
    fn session_id(&self) -> &str;

    /// Connection this session is bound to.
    fn connection_id(&self) -> &ConnectionId;

    /// The session's outbox.
    fn outbox(&self) -> &Outbox;

    /// Queue a message for the connection. Returns `false` and releases the
    /// message if the session is closed.
    fn send(&self, message: Message) -> bool {
        self.outbox().send(message)
    }

    /// Close the session. Its outbox stream ends.
    fn close(&self) {
        self.outbox().close();
    }

    /// Whether the session has been closed.
    fn is_closed(&self) -> bool {
        self.outbox().is_closed()
    }
}

/// Atomic counter for session ids.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique session id.
#[must_use]
pub fn generate_session_id() -> String {
    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess_{:x}_{:x}", now_millis(), counter)
}

/// Heartbeat bookkeeping shared by session types.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    connected_at: u64,
    last: AtomicU64,
}

impl Heartbeat {
    pub(crate) fn new() -> Self {
        let now = now_millis();
        Self {
            connected_at: now,
            last: AtomicU64::new(now),
        }
    }

    pub(crate) fn connected_at(&self) -> u64 {
        self.connected_at
    }

    pub(crate) fn last(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last.store(now_millis(), Ordering::Relaxed);
    }
}

/// Unbounded per-session message queue.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Message>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    closed: CancellationToken,
}

impl Outbox {
    /// Create an outbox.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a message.
    pub fn send(&self, message: Message) -> bool {
        if self.closed.is_cancelled() {
            message.release("session closed");
            return false;
        }
        match self.tx.send(message) {
            Ok(()) => true,
            Err(mpsc::error::SendError(message)) => {
                message.release("session closed");
                false
            }
        }
    }

    /// Take the reader side. Only the first call gets it.
    pub fn take_stream(&self) -> Option<OutboxStream> {
        let rx = self
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        Some(OutboxStream {
            rx,
            closed: self.closed.clone(),
        })
    }

    /// Close the outbox.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the outbox is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// A token cancelled when the outbox closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader side of an [`Outbox`].
pub struct OutboxStream {
    rx: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
}

impl OutboxStream {
    /// Next queued message, or `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => None,
            message = self.rx.recv() => message,
        }
    }
}
