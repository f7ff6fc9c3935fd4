//! Consistent-hash router.
//!
//! The router picks worker sessions for a message. Room and user routes are
//! placed on a hash ring built over the routable sessions, so traffic for
//! one key sticks to one worker while membership is stable. Rings are
//! cached by membership signature and dropped whenever a logic instance
//! joins or leaves.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use switchyard_protocol::{InstanceType, RouteMetadata, RouteType};
use tracing::{debug, info, trace};

use crate::registry::RegistryObserver;
use crate::ring::{signature, HashRing, RingMember, DEFAULT_VIRTUAL_NODES};
use crate::session::ServiceSession;

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Virtual nodes per member.
    pub virtual_nodes: usize,
    /// Maximum number of cached rings.
    pub max_cached_rings: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            max_cached_rings: 64,
        }
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Rings currently cached.
    pub cached_rings: usize,
    /// Invalidation generation.
    pub generation: u64,
}

/// Routes messages onto worker sessions.
pub struct ConsistentHashRouter {
    config: RouterConfig,
    rings: DashMap<String, Arc<HashRing>>,
    generation: AtomicU64,
}

impl ConsistentHashRouter {
    /// Create a router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        Self {
            config,
            rings: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            cached_rings: self.rings.len(),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    /// Select destinations for `metadata` among `eligible`.
    ///
    /// Room and user routes yield at most one session, logic routes the
    /// named instance if it is routable, broadcast every routable session,
    /// unknown routes nothing.
    pub fn route<S: RingMember>(
        &self,
        metadata: &RouteMetadata,
        eligible: &[Arc<S>],
    ) -> Vec<Arc<S>> {
        match metadata.route_type {
            RouteType::Room | RouteType::User => self
                .route_hashed(&metadata.route_key, eligible)
                .into_iter()
                .collect(),
            RouteType::Logic => eligible
                .iter()
                .find(|s| s.is_routable() && s.ring_id() == metadata.route_key)
                .map(Arc::clone)
                .into_iter()
                .collect(),
            RouteType::Broadcast => eligible
                .iter()
                .filter(|s| s.is_routable())
                .map(Arc::clone)
                .collect(),
            RouteType::Unknown => Vec::new(),
        }
    }

    /// Select the single destination for a hashed route key.
    pub fn route_hashed<S: RingMember>(&self, key: &str, eligible: &[Arc<S>]) -> Option<Arc<S>> {
        let mut members: Vec<&Arc<S>> = eligible.iter().filter(|s| s.is_routable()).collect();
        if members.is_empty() {
            return None;
        }
        members.sort_by(|a, b| a.ring_id().cmp(b.ring_id()));
        members.dedup_by(|a, b| a.ring_id() == b.ring_id());

        let ids: Vec<&str> = members.iter().map(|s| s.ring_id()).collect();
        let ring = self.ring_for(&ids);
        let index = ring.locate(key)?;
        let target = members.get(index)?;
        trace!(key, target = %target.ring_id(), "Routed by hash");
        Some(Arc::clone(target))
    }

    /// Drop all cached rings.
    pub fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.rings.clear();
        debug!(generation, "Router cache invalidated");
    }

    fn ring_for(&self, sorted_ids: &[&str]) -> Arc<HashRing> {
        let signature = signature(sorted_ids);
        if let Some(ring) = self.rings.get(&signature) {
            return Arc::clone(ring.value());
        }

        let generation = self.generation.load(Ordering::Acquire);
        let ring = Arc::new(HashRing::build(sorted_ids, self.config.virtual_nodes));

        if self.rings.len() >= self.config.max_cached_rings {
            self.rings.clear();
        }
        self.rings.insert(signature.clone(), Arc::clone(&ring));

        // Built across an invalidation: withdraw it again.
        if self.generation.load(Ordering::Acquire) != generation {
            self.rings
                .remove_if(&signature, |_, cached| Arc::ptr_eq(cached, &ring));
        }
        ring
    }
}

impl Default for ConsistentHashRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryObserver<ServiceSession> for ConsistentHashRouter {
    fn on_join(&self, session: &Arc<ServiceSession>) {
        if session.instance_type() == InstanceType::Logic {
            self.invalidate();
        }
    }

    fn on_leave(&self, session: &Arc<ServiceSession>) {
        if session.instance_type() == InstanceType::Logic {
            self.invalidate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::registry::SessionRegistry;
    use crate::session::{ServiceStatus, Session};
    use std::collections::HashMap;

    fn logic(id: &str) -> Arc<ServiceSession> {
        Arc::new(ServiceSession::new(
            InstanceType::Logic,
            id,
            ConnectionId::generate(),
        ))
    }

    #[test]
    fn test_hashed_route_is_deterministic() {
        let router = ConsistentHashRouter::new();
        let sessions = vec![logic("l1"), logic("l2"), logic("l3")];

        for key in ["room-1", "room-2", "user-7"] {
            let first = router.route_hashed(key, &sessions).unwrap();
            for _ in 0..10 {
                let again = router.route_hashed(key, &sessions).unwrap();
                assert!(Arc::ptr_eq(&first, &again));
            }
        }
        assert_eq!(router.stats().cached_rings, 1);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let router = ConsistentHashRouter::new();
        let a = logic("a");
        let b = logic("b");
        let forward = vec![Arc::clone(&a), Arc::clone(&b)];
        let reverse = vec![b, a];

        for i in 0..50 {
            let key = format!("room-{i}");
            let x = router.route_hashed(&key, &forward).unwrap();
            let y = router.route_hashed(&key, &reverse).unwrap();
            assert_eq!(x.instance_id(), y.instance_id());
        }
    }

    #[test]
    fn test_removed_session_is_never_chosen() {
        let router = ConsistentHashRouter::new();
        let l1 = logic("l1");
        let l2 = logic("l2");
        let both = vec![Arc::clone(&l1), Arc::clone(&l2)];

        // Find a key owned by l1.
        let key = (0..)
            .map(|i| format!("room-{i}"))
            .find(|k| router.route_hashed(k, &both).unwrap().instance_id() == "l1")
            .unwrap();

        router.invalidate();
        let only = vec![Arc::clone(&l2)];
        let target = router.route_hashed(&key, &only).unwrap();
        assert_eq!(target.instance_id(), "l2");
    }

    #[test]
    fn test_offline_sessions_excluded() {
        let router = ConsistentHashRouter::new();
        let l1 = logic("l1");
        let l2 = logic("l2");
        l1.set_status(ServiceStatus::Offline);
        let sessions = vec![Arc::clone(&l1), Arc::clone(&l2)];

        for i in 0..100 {
            let key = format!("user-{i}");
            assert_eq!(
                router.route_hashed(&key, &sessions).unwrap().instance_id(),
                "l2"
            );
        }
        assert!(router
            .route(&RouteMetadata::logic("l1"), &sessions)
            .is_empty());
    }

    #[test]
    fn test_route_types() {
        let router = ConsistentHashRouter::new();
        let sessions = vec![logic("l1"), logic("l2")];

        assert_eq!(router.route(&RouteMetadata::room("r"), &sessions).len(), 1);
        assert_eq!(router.route(&RouteMetadata::user("u"), &sessions).len(), 1);
        assert_eq!(router.route(&RouteMetadata::broadcast(), &sessions).len(), 2);
        assert!(router.route(&RouteMetadata::unknown(), &sessions).is_empty());

        let direct = router.route(&RouteMetadata::logic("l2"), &sessions);
        assert_eq!(direct.len(), 1);
        assert_eq!(direct[0].instance_id(), "l2");
        assert!(router
            .route(&RouteMetadata::logic("missing"), &sessions)
            .is_empty());

        let empty: Vec<Arc<ServiceSession>> = Vec::new();
        assert!(router.route(&RouteMetadata::room("r"), &empty).is_empty());
    }

    #[test]
    fn test_distribution_uses_all_members() {
        let router = ConsistentHashRouter::new();
        let sessions = vec![logic("l1"), logic("l2"), logic("l3")];
        let mut counts: HashMap<String, usize> = HashMap::new();

        for i in 0..3000 {
            let target = router
                .route_hashed(&format!("room-{i}"), &sessions)
                .unwrap();
            *counts.entry(target.instance_id().to_string()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&n| n > 300));
    }

    #[test]
    fn test_invalidate_bumps_generation() {
        let router = ConsistentHashRouter::new();
        let sessions = vec![logic("l1")];
        router.route_hashed("k", &sessions);
        assert_eq!(router.stats().cached_rings, 1);

        router.invalidate();
        assert_eq!(
            router.stats(),
            RouterStats {
                cached_rings: 0,
                generation: 1
            }
        );
    }

    #[test]
    fn test_cache_is_bounded() {
        let router = ConsistentHashRouter::with_config(RouterConfig {
            virtual_nodes: 4,
            max_cached_rings: 2,
        });
        for i in 0..5 {
            let sessions = vec![logic(&format!("l{i}"))];
            router.route_hashed("k", &sessions);
            assert!(router.stats().cached_rings <= 2);
        }
    }

    #[test]
    fn test_registry_churn_invalidates() {
        let router = Arc::new(ConsistentHashRouter::new());
        let registry = SessionRegistry::new("services")
            .with_observer(Arc::clone(&router) as Arc<dyn RegistryObserver<ServiceSession>>);

        let l1 = registry.create(ServiceSession::new(
            InstanceType::Logic,
            "l1",
            ConnectionId::generate(),
        ));
        registry.create(ServiceSession::new(
            InstanceType::Access,
            "a1",
            ConnectionId::generate(),
        ));
        assert_eq!(router.stats().generation, 1);

        router.route_hashed("k", &registry.sessions());
        registry.remove(l1.key());
        assert_eq!(router.stats().generation, 2);
        assert_eq!(router.stats().cached_rings, 0);
    }
}
