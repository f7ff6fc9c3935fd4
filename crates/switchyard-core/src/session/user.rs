use crate::connection::ConnectionId;
use crate::session::{generate_session_id, Heartbeat, Outbox, Session};

/// An edge client's session on an access instance.
pub struct UserSession {
    session_id: String,
    user_id: String,
    device_id: String,
    platform: String,
    connection_id: ConnectionId,
    heartbeat: Heartbeat,
    outbox: Outbox,
}

impl UserSession {
    /// Create a session for `user_id` on `connection_id`.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        platform: impl Into<String>,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            session_id: generate_session_id(),
            user_id: user_id.into(),
            device_id: device_id.into(),
            platform: platform.into(),
            connection_id,
            heartbeat: Heartbeat::new(),
            outbox: Outbox::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    /// Connect time, milliseconds since the epoch.
    pub fn connected_at(&self) -> u64 {
        self.heartbeat.connected_at()
    }

    /// Last inbound activity, milliseconds since the epoch.
    pub fn last_heartbeat(&self) -> u64 {
        self.heartbeat.last()
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.heartbeat.touch();
    }
}

impl Session for UserSession {
    fn key(&self) -> &str {
        &self.user_id
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

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}
