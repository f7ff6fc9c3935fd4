//! Whole-cluster tests: broker, access and logic tiers wired over
//! in-memory links.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchyard_protocol::{keys, Envelope, Headers, InstanceType};
use switchyard_transport::{memory, Connection, LinkState, UpstreamConfig};

use crate::access::testing::login;
use crate::access::{AccessSettings, AccessTier};
use crate::admin::StatsSource;
use crate::auth::{Claims, StaticTokenVerifier, TokenVerifier};
use crate::broker::{Broker, BrokerSettings};
use crate::logic::{EchoHandler, LogicHandler, LogicReply, LogicRequest, LogicSettings, LogicTier};

fn verifier() -> Arc<dyn TokenVerifier> {
    Arc::new(
        StaticTokenVerifier::new()
            .with_token("t-access-1", Claims::instance(InstanceType::Access, "access-1"))
            .with_token("t-access-2", Claims::instance(InstanceType::Access, "access-2"))
            .with_token("t-logic-1", Claims::instance(InstanceType::Logic, "logic-1"))
            .with_token("alice-token", Claims::user("alice"))
            .with_token("bob-token", Claims::user("bob")),
    )
}

fn upstream(instance_type: InstanceType, instance_id: &str) -> UpstreamConfig {
    UpstreamConfig {
        reconnect_interval: Duration::from_millis(20),
        max_reconnect_interval: Duration::from_millis(100),
        instance_type,
        instance_id: instance_id.to_string(),
        token: format!("t-{instance_id}"),
        ..UpstreamConfig::default()
    }
}

fn start_broker() -> Arc<Broker> {
    let broker = Broker::new(BrokerSettings::default(), verifier());
    let runner = Arc::clone(&broker);
    tokio::spawn(async move { runner.run().await });
    broker
}

fn start_access(
    id: &str,
    broker: memory::MemoryConnector,
) -> (Arc<AccessTier>, memory::MemoryConnector) {
    start_access_with(upstream(InstanceType::Access, id), broker)
}

fn start_access_with(
    config: UpstreamConfig,
    broker: memory::MemoryConnector,
) -> (Arc<AccessTier>, memory::MemoryConnector) {
    let id = config.instance_id.clone();
    let tier = AccessTier::new(AccessSettings::default(), config, Arc::new(broker), verifier());
    let (edge, edge_connector) = memory::endpoint(format!("{id}-edge"));
    tier.listen(Arc::new(edge));
    let runner = Arc::clone(&tier);
    tokio::spawn(async move { runner.run().await });
    (tier, edge_connector)
}

fn start_logic(broker: memory::MemoryConnector, handler: Arc<dyn LogicHandler>) -> Arc<LogicTier> {
    let tier = LogicTier::new(
        LogicSettings::default(),
        upstream(InstanceType::Logic, "logic-1"),
        Arc::new(broker),
        handler,
    );
    let runner = Arc::clone(&tier);
    tokio::spawn(async move { runner.run().await });
    tier
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

async fn next_payload(conn: &mut Connection) -> Bytes {
    match tokio::time::timeout(Duration::from_secs(2), conn.recv()).await {
        Ok(Ok(Some(Envelope::Message { data, .. }))) => data,
        other => panic!("Expected a message, got {:?}", other),
    }
}

/// Relays each message to every other user it knows about.
#[derive(Default)]
struct Relay {
    users: Mutex<HashMap<String, (String, String)>>,
}

impl Relay {
    fn register(&self, user: &str, session_id: &str, access_instance: &str) {
        self.users.lock().unwrap().insert(
            user.to_string(),
            (session_id.to_string(), access_instance.to_string()),
        );
    }
}

#[async_trait]
impl LogicHandler for Relay {
    async fn handle(&self, request: LogicRequest) -> Vec<LogicReply> {
        let sender = request.headers.user_id().unwrap_or_default().to_string();
        self.users
            .lock()
            .unwrap()
            .iter()
            .filter(|(user, _)| **user != sender)
            .map(|(user, (session_id, access))| LogicReply {
                session_id: session_id.clone(),
                access_instance_id: access.clone(),
                user_id: Some(user.clone()),
                payload: request.payload.clone(),
            })
            .collect()
    }
}

#[tokio::test]
async fn test_user_message_crosses_access_instances() {
    let broker = start_broker();
    let (broker_link, broker_connector) = memory::endpoint("broker");
    broker.listen(Arc::new(broker_link));

    let relay = Arc::new(Relay::default());
    let logic = start_logic(broker_connector.clone(), relay.clone());
    let (access_1, edge_1) = start_access("access-1", broker_connector.clone());
    let (access_2, edge_2) = start_access("access-2", broker_connector);
    eventually("three instances", || broker.registry().count() == 3).await;

    let (mut alice, _) = login(&edge_1, "alice-token").await;
    let (mut bob, bob_session) = login(&edge_2, "bob-token").await;
    eventually("bob's session", || access_2.registry().get("bob").is_some()).await;
    relay.register("bob", &bob_session, "access-2");

    alice
        .send(Envelope::message(Headers::new(), b"hi bob".to_vec()))
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), bob.recv()).await {
        Ok(Ok(Some(Envelope::Message { headers, data }))) => {
            assert_eq!(&data[..], b"hi bob");
            assert_eq!(headers.get(keys::USER_ID), Some("bob"));
        }
        other => panic!("Expected bob's message, got {:?}", other),
    }
    // Exactly once, and never back to the sender
    assert!(tokio::time::timeout(Duration::from_millis(100), bob.recv())
        .await
        .is_err());
    assert!(tokio::time::timeout(Duration::from_millis(20), alice.recv())
        .await
        .is_err());

    let stats = broker.stats();
    assert_eq!(stats["sessions"]["access"], 2);
    assert_eq!(stats["sessions"]["logic"], 1);

    access_1.shutdown();
    access_2.shutdown();
    logic.shutdown();
    broker.shutdown();
}

#[tokio::test]
async fn test_queued_messages_survive_broker_outage() {
    let broker = start_broker();
    let (logic_link, logic_connector) = memory::endpoint("broker-logic");
    let (access_link, access_connector) = memory::endpoint("broker-access");
    broker.listen(Arc::new(logic_link));
    broker.listen(Arc::new(access_link));

    let logic = start_logic(logic_connector, Arc::new(EchoHandler));
    let (access, edge) = start_access("access-1", access_connector.clone());
    eventually("both instances", || broker.registry().count() == 2).await;

    let (mut alice, _) = login(&edge, "alice-token").await;
    eventually("alice's session", || access.registry().get("alice").is_some()).await;
    alice
        .send(Envelope::message(Headers::new(), b"before".to_vec()))
        .await
        .unwrap();
    assert_eq!(&next_payload(&mut alice).await[..], b"before");

    access_connector.set_refusing(true);
    access_connector.sever_all();
    let mut state = access.upstream().watch_state();
    state
        .wait_for(|s| *s != LinkState::Streaming)
        .await
        .unwrap();

    alice
        .send(Envelope::message(Headers::new(), b"during".to_vec()))
        .await
        .unwrap();
    eventually("message queued", || access.stats()["outbound"]["published"] == 2).await;

    access_connector.set_refusing(false);
    assert_eq!(&next_payload(&mut alice).await[..], b"during");
    assert!(access.upstream().stats().reconnects >= 1);
    assert_eq!(access.upstream().stats().discarded, 0);

    access.shutdown();
    logic.shutdown();
    broker.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_access_reconnects_within_backoff_bound() {
    let broker = start_broker();
    let (logic_link, logic_connector) = memory::endpoint("broker-logic");
    let (access_link, access_connector) = memory::endpoint("broker-access");
    broker.listen(Arc::new(logic_link));
    broker.listen(Arc::new(access_link));

    let config = UpstreamConfig {
        reconnect_interval: Duration::from_secs(1),
        max_reconnect_interval: Duration::from_secs(30),
        backoff_factor: 2.0,
        ..upstream(InstanceType::Access, "access-1")
    };
    let bound = config.reconnect_interval.mul_f64(config.backoff_factor);
    let logic = start_logic(logic_connector, Arc::new(EchoHandler));
    let (access, edge) = start_access_with(config, access_connector.clone());
    eventually("both instances", || broker.registry().count() == 2).await;

    let mut state = access.upstream().watch_state();
    state
        .wait_for(|s| *s == LinkState::Streaming)
        .await
        .unwrap();
    let severed_at = tokio::time::Instant::now();
    access_connector.sever_all();
    state
        .wait_for(|s| *s != LinkState::Streaming)
        .await
        .unwrap();
    state
        .wait_for(|s| *s == LinkState::Streaming)
        .await
        .unwrap();
    let outage = severed_at.elapsed();
    assert!(outage >= Duration::from_secs(1), "reconnected after {outage:?}");
    assert!(outage <= bound, "reconnected after {outage:?}, bound {bound:?}");
    assert_eq!(access.upstream().stats().connects, 2);

    // The new link carries traffic end to end.
    eventually("access back on the broker", || {
        broker.registry().get("access-1").is_some()
    })
    .await;
    let (mut alice, _) = login(&edge, "alice-token").await;
    eventually("alice's session", || access.registry().get("alice").is_some()).await;
    alice
        .send(Envelope::message(Headers::new(), b"after outage".to_vec()))
        .await
        .unwrap();
    assert_eq!(&next_payload(&mut alice).await[..], b"after outage");

    access.shutdown();
    logic.shutdown();
    broker.shutdown();
}
