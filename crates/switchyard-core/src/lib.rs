//! # switchyard-core
//!
//! Sessions, routing and dispatch for the Switchyard broker tiers.
//!
//! - **Message** - routed messages whose payload has one terminal release
//! - **Holders** - bounded inbound/outbound buffers with drop-newest overflow
//! - **Sessions** - user sessions on access, service sessions on the broker
//! - **Registry** - concurrent session indices with evict-on-replace
//! - **Router** - consistent-hash placement over logic sessions
//! - **Dispatch** - semaphore and worker-pool pipelines
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌────────────┐     ┌──────────┐     ┌─────────────┐
//! │ Transport │────▶│  Inbound   │────▶│ Dispatch │────▶│   Session   │
//! └───────────┘     │   Holder   │     └──────────┘     │   outbox    │
//!                   └────────────┘          │           └─────────────┘
//!                                           ▼
//!                                    ┌────────────┐
//!                                    │   Router   │
//!                                    └────────────┘
//! ```

pub mod connection;
pub mod dispatch;
pub mod holder;
pub mod message;
pub mod registry;
pub mod ring;
pub mod router;
pub mod session;

pub use connection::ConnectionId;
pub use dispatch::{
    DispatchConfig, DispatchStats, DispatchStrategy, Dispatcher, DropReason, MessageHandler,
    SemaphoreDispatcher, WorkerPoolDispatcher,
};
pub use holder::{HolderStats, HolderStream, InboundHolder, OutboundHolder};
pub use message::{LeaseTracker, Message, MessageId, Payload};
pub use registry::{RegistryObserver, SessionRegistry};
pub use ring::{HashRing, RingMember};
pub use router::{ConsistentHashRouter, RouterConfig, RouterStats};
pub use session::{OutboxStream, ServiceSession, ServiceStatus, Session, UserSession};
