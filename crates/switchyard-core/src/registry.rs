//! Concurrent session registry.
//!
//! One registry type serves both tiers: the access tier indexes user
//! sessions by user id, the broker indexes service sessions by instance id.
//! Every session is reachable by connection, by logical key and by session
//! id. Mutation goes through per-entry atomic map operations only.
//!
//! Observers see `on_join` once for every session that was published and
//! `on_leave` once when it goes away. A session that loses a concurrent
//! create for its key is closed without either event.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::connection::ConnectionId;
use crate::session::Session;

/// Notified when sessions join or leave a registry.
pub trait RegistryObserver<S>: Send + Sync {
    /// A session was registered.
    fn on_join(&self, session: &Arc<S>);

    /// A session was removed or evicted.
    fn on_leave(&self, session: &Arc<S>);
}

/// Registry of live sessions.
pub struct SessionRegistry<S: Session> {
    name: &'static str,
    by_connection: DashMap<ConnectionId, Arc<S>>,
    by_key: DashMap<String, Arc<S>>,
    by_session_id: DashMap<String, Arc<S>>,
    observers: Vec<Arc<dyn RegistryObserver<S>>>,
    /// Session ids whose `on_join` has fired and whose `on_leave` has not.
    joined: Mutex<HashSet<String>>,
}

impl<S: Session> SessionRegistry<S> {
    /// Create an empty registry. `name` only shows up in logs.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            by_connection: DashMap::new(),
            by_key: DashMap::new(),
            by_session_id: DashMap::new(),
            observers: Vec::new(),
            joined: Mutex::new(HashSet::new()),
        }
    }

    /// Add an observer.
    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RegistryObserver<S>>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Register a session.
    ///
    /// Any session already holding the same key, or bound to the same
    /// connection, is evicted and closed first.
    pub fn create(&self, session: S) -> Arc<S> {
        let session = Arc::new(session);

        if let Some(previous) = self
            .by_key
            .insert(session.key().to_string(), Arc::clone(&session))
        {
            if !Arc::ptr_eq(&previous, &session) {
                info!(
                    registry = self.name,
                    key = %previous.key(),
                    session = %previous.session_id(),
                    "Evicting replaced session"
                );
                self.by_connection
                    .remove_if(previous.connection_id(), |_, s| Arc::ptr_eq(s, &previous));
                self.by_session_id
                    .remove_if(previous.session_id(), |_, s| Arc::ptr_eq(s, &previous));
                self.retire(&previous);
            }
        }

        if let Some(previous) = self
            .by_connection
            .insert(session.connection_id().clone(), Arc::clone(&session))
        {
            if !Arc::ptr_eq(&previous, &session) {
                self.by_key
                    .remove_if(previous.key(), |_, s| Arc::ptr_eq(s, &previous));
                self.by_session_id
                    .remove_if(previous.session_id(), |_, s| Arc::ptr_eq(s, &previous));
                self.retire(&previous);
            }
        }

        self.by_session_id
            .insert(session.session_id().to_string(), Arc::clone(&session));

        // A concurrent create for the same key may have evicted us before
        // our secondary entries landed.
        if !self.announce_join(&session) {
            self.by_connection
                .remove_if(session.connection_id(), |_, s| Arc::ptr_eq(s, &session));
            self.by_session_id
                .remove_if(session.session_id(), |_, s| Arc::ptr_eq(s, &session));
            session.close();
            return session;
        }

        debug!(
            registry = self.name,
            key = %session.key(),
            session = %session.session_id(),
            connection = %session.connection_id(),
            "Session registered"
        );
        session
    }

    /// Fire `on_join` if `session` still owns its key.
    fn announce_join(&self, session: &Arc<S>) -> bool {
        let mut joined = self.joined.lock().unwrap_or_else(|p| p.into_inner());
        let current = self
            .by_key
            .get(session.key())
            .is_some_and(|s| Arc::ptr_eq(s.value(), session));
        if !current || session.is_closed() {
            return false;
        }
        joined.insert(session.session_id().to_string());
        for observer in &self.observers {
            observer.on_join(session);
        }
        true
    }

    /// Look up by logical key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<S>> {
        self.by_key.get(key).map(|s| Arc::clone(s.value()))
    }

    /// Look up by connection.
    #[must_use]
    pub fn get_by_connection(&self, connection_id: &ConnectionId) -> Option<Arc<S>> {
        self.by_connection
            .get(connection_id)
            .map(|s| Arc::clone(s.value()))
    }

    /// Look up by session id.
    #[must_use]
    pub fn get_by_session_id(&self, session_id: &str) -> Option<Arc<S>> {
        self.by_session_id
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
    }

    /// Remove the session registered under `key`.
    pub fn remove(&self, key: &str) -> Option<Arc<S>> {
        let (_, session) = self.by_key.remove(key)?;
        self.unlink(&session);
        Some(session)
    }

    /// Remove the session bound to `connection_id`.
    pub fn remove_by_connection(&self, connection_id: &ConnectionId) -> Option<Arc<S>> {
        let (_, session) = self.by_connection.remove(connection_id)?;
        self.by_key
            .remove_if(session.key(), |_, s| Arc::ptr_eq(s, &session));
        self.by_session_id
            .remove_if(session.session_id(), |_, s| Arc::ptr_eq(s, &session));
        self.retire(&session);
        Some(session)
    }

    /// Remove exactly this session, if it is still registered.
    ///
    /// A newer session for the same key is left alone.
    pub fn remove_session(&self, session: &Arc<S>) -> bool {
        let removed = self
            .by_key
            .remove_if(session.key(), |_, s| Arc::ptr_eq(s, session))
            .is_some();
        if removed {
            self.unlink(session);
        }
        removed
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.by_key.len()
    }

    /// Number of sessions matching `predicate`.
    pub fn count_where(&self, predicate: impl Fn(&S) -> bool) -> usize {
        self.by_key.iter().filter(|s| predicate(s.value())).count()
    }

    /// Registered logical keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.by_key.iter().map(|s| s.key().clone()).collect()
    }

    /// Snapshot of registered sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<S>> {
        self.by_key.iter().map(|s| Arc::clone(s.value())).collect()
    }

    /// Snapshot of sessions matching `predicate`.
    pub fn sessions_where(&self, predicate: impl Fn(&S) -> bool) -> Vec<Arc<S>> {
        self.by_key
            .iter()
            .filter(|s| predicate(s.value()))
            .map(|s| Arc::clone(s.value()))
            .collect()
    }

    /// Remove and close every session.
    pub fn clear(&self) {
        for session in self.sessions() {
            self.remove_session(&session);
        }
    }

    fn unlink(&self, session: &Arc<S>) {
        self.by_connection
            .remove_if(session.connection_id(), |_, s| Arc::ptr_eq(s, session));
        self.by_session_id
            .remove_if(session.session_id(), |_, s| Arc::ptr_eq(s, session));
        self.retire(session);
    }

    fn retire(&self, session: &Arc<S>) {
        session.close();
        let mut joined = self.joined.lock().unwrap_or_else(|p| p.into_inner());
        if !joined.remove(session.session_id()) {
            // Lost a create race and never published.
            return;
        }
        debug!(
            registry = self.name,
            key = %session.key(),
            session = %session.session_id(),
            "Session removed"
        );
        for observer in &self.observers {
            observer.on_leave(session);
        }
    }
}
