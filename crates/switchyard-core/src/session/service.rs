//! Tier instance sessions held by the broker.

use std::sync::atomic::{AtomicU8, Ordering};
use switchyard_protocol::InstanceType;

use crate::connection::ConnectionId;
use crate::ring::RingMember;
use crate::session::{generate_session_id, Heartbeat, Outbox, Session};

/// Whether a service session accepts routed work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Online,
    Offline,
}

impl ServiceStatus {
    const fn to_u8(self) -> u8 {
        match self {
            ServiceStatus::Online => 0,
            ServiceStatus::Offline => 1,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceStatus::Online,
            _ => ServiceStatus::Offline,
        }
    }
}

/// A connected access or logic instance.
pub struct ServiceSession {
    session_id: String,
    instance_type: InstanceType,
    instance_id: String,
    connection_id: ConnectionId,
    status: AtomicU8,
    heartbeat: Heartbeat,
    outbox: Outbox,
}

impl ServiceSession {
    /// Create an online session for an instance.
    #[must_use]
    pub fn new(
        instance_type: InstanceType,
        instance_id: impl Into<String>,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            session_id: generate_session_id(),
            instance_type,
            instance_id: instance_id.into(),
            connection_id,
            status: AtomicU8::new(ServiceStatus::Online.to_u8()),
            heartbeat: Heartbeat::new(),
            outbox: Outbox::new(),
        }
    }

    pub fn instance_type(&self) -> InstanceType {
        self.instance_type
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: ServiceStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    /// Only online sessions take routed work.
    pub fn is_routable(&self) -> bool {
        self.status() == ServiceStatus::Online && !self.is_closed()
    }

    pub fn connected_at(&self) -> u64 {
        self.heartbeat.connected_at()
    }

    pub fn last_heartbeat(&self) -> u64 {
        self.heartbeat.last()
    }

    pub fn touch(&self) {
        self.heartbeat.touch();
    }
}

impl Session for ServiceSession {
    fn key(&self) -> &str {
        &self.instance_id
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}

impl RingMember for ServiceSession {
    fn ring_id(&self) -> &str {
        &self.instance_id
    }

    fn is_routable(&self) -> bool {
        ServiceSession::is_routable(self)
    }
}

impl std::fmt::Debug for ServiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSession")
            .field("session_id", &self.session_id)
            .field("instance_type", &self.instance_type)
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_controls_routability() {
        let session = ServiceSession::new(InstanceType::Logic, "logic-1", ConnectionId::generate());
        assert_eq!(session.key(), "logic-1");
        assert!(session.is_routable());

        session.set_status(ServiceStatus::Offline);
        assert!(!session.is_routable());

        session.set_status(ServiceStatus::Online);
        session.close();
        assert!(!session.is_routable());
    }
}
