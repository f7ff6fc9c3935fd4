//! Message dispatch pipelines.
//!
//! A dispatcher drains one holder stream and runs a [`MessageHandler`] per
//! message under bounded concurrency. Two strategies are provided:
//!
//! - [`SemaphoreDispatcher`] spawns a task per message, gated by a semaphore.
//!   Bounds in-flight messages.
//! - [`WorkerPoolDispatcher`] feeds an internal queue drained by a fixed
//!   set of workers. Bounds worker count.
//!
//! Handler failures and panics are isolated to the message that caused
//! them. Neither strategy preserves order across messages.

mod semaphore;
mod worker_pool;

pub use semaphore::SemaphoreDispatcher;
pub use worker_pool::WorkerPoolDispatcher;

use async_trait::async_trait;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchyard_protocol::RouteType;
use thiserror::Error;
use tracing::{debug, error};

use crate::holder::HolderStream;
use crate::message::Message;

/// Why a message was not delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DropReason {
    /// A required header is absent.
    #[error("Missing header {0}")]
    MissingHeader(&'static str),

    /// The frame could not be decoded.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The instance type header is absent or not routable.
    #[error("Unknown instance type: {0}")]
    UnknownInstanceType(String),

    /// No eligible destination for the route.
    #[error("No route for {route_type} '{route_key}'")]
    NoRoute {
        route_type: RouteType,
        route_key: String,
    },

    /// The addressed session is not registered.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The addressed session is registered but not accepting work.
    #[error("Session not accepting: {0}")]
    NotAccepting(String),

    /// The addressed session closed before the message was queued.
    #[error("Session closed: {0}")]
    SessionClosed(String),
}

impl DropReason {
    /// Short label for metrics.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            DropReason::MissingHeader(_) => "missing_header",
            DropReason::MalformedFrame(_) => "malformed_frame",
            DropReason::UnknownInstanceType(_) => "unknown_instance_type",
            DropReason::NoRoute { .. } => "no_route",
            DropReason::SessionNotFound(_) => "session_not_found",
            DropReason::NotAccepting(_) => "not_accepting",
            DropReason::SessionClosed(_) => "session_closed",
        }
    }

    /// Whether this is a protocol error rather than a routing failure.
    #[must_use]
    pub const fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DropReason::MissingHeader(_)
                | DropReason::MalformedFrame(_)
                | DropReason::UnknownInstanceType(_)
        )
    }
}

/// Per-message processing.
///
/// The handler owns the message: whatever it does not forward is released
/// when it returns.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Deliver one message.
    async fn handle(&self, message: Message) -> Result<(), DropReason>;
}

/// Drains a holder stream into a handler.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run until the stream ends and in-flight messages are done.
    async fn run(&self, stream: HolderStream, handler: Arc<dyn MessageHandler>);

    /// Get counters.
    fn stats(&self) -> DispatchStats;

    /// Stop taking messages. `run` returns once in-flight messages finish;
    /// queued ones are released.
    fn shutdown(&self);
}

/// Which dispatcher to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    #[default]
    Semaphore,
    WorkerPool,
}

impl FromStr for DispatchStrategy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semaphore" => Ok(DispatchStrategy::Semaphore),
            "worker_pool" | "worker-pool" => Ok(DispatchStrategy::WorkerPool),
            _ => Err("Invalid dispatch strategy"),
        }
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Strategy.
    pub strategy: DispatchStrategy,
    /// Permits or workers.
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::default(),
            concurrency: default_concurrency(),
        }
    }
}

/// Twice the available parallelism.
#[must_use]
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        * 2
}

/// Build the dispatcher `config` asks for.
#[must_use]
pub fn build(config: &DispatchConfig) -> Arc<dyn Dispatcher> {
    match config.strategy {
        DispatchStrategy::Semaphore => Arc::new(SemaphoreDispatcher::new(config.concurrency)),
        DispatchStrategy::WorkerPool => Arc::new(WorkerPoolDispatcher::new(config.concurrency)),
    }
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Messages the handler delivered.
    pub dispatched: u64,
    /// Messages the handler dropped.
    pub dropped: u64,
    /// Messages whose handler panicked.
    pub panicked: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    dispatched: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }
}

/// Run the handler for one message, containing failures and panics.
pub(crate) async fn process(handler: &dyn MessageHandler, message: Message, counters: &Counters) {
    let id = message.id;
    match AssertUnwindSafe(handler.handle(message)).catch_unwind().await {
        Ok(Ok(())) => {
            counters.dispatched.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(reason)) => {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(message = id, reason = %reason, "Message dropped");
        }
        Err(_) => {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            error!(message = id, "Handler panicked");
        }
    }
}
