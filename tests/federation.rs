//! Federation between brokers through the public API

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use meshmq::broker::Outbound;
use meshmq::federation::{EventPayload, FederationError};
use meshmq::protocol::SubscriptionOptions;
use meshmq::{
    Broker, Config, ConnectRequest, FederationEvent, Message, PeerLink, PersistenceRegistry,
    PluginRegistry, QoS,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn federated(node: &str, peers: &[&str]) -> Config {
    let mut config = Config::default();
    config.federation.enabled = true;
    config.federation.node_name = node.to_string();
    config.federation.peers = peers.iter().map(|p| p.to_string()).collect();
    config.federation.retry_interval = Duration::from_millis(10);
    config
}

async fn start(config: Config) -> Arc<Broker> {
    Broker::from_config(
        config,
        &PersistenceRegistry::with_defaults(),
        &PluginRegistry::with_defaults(),
    )
    .await
    .unwrap()
}

fn interest(id: u64, origin: &str, filter: &str) -> FederationEvent {
    FederationEvent {
        id,
        epoch: 1,
        origin: Arc::from(origin),
        payload: EventPayload::Subscribe(Arc::from(filter)),
    }
}

fn publish_event(id: u64, origin: &str, topic: &str, payload: &'static str) -> FederationEvent {
    FederationEvent {
        id,
        epoch: 1,
        origin: Arc::from(origin),
        payload: EventPayload::Publish(Arc::new(Message::new(topic, payload, QoS::AtLeastOnce))),
    }
}

/// Link that records every batch and confirms all of it
struct RecordingLink {
    peer: String,
    sent: Mutex<Vec<FederationEvent>>,
}

#[async_trait]
impl PeerLink for RecordingLink {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&self, events: &[FederationEvent]) -> Result<u64, FederationError> {
        self.sent.lock().extend_from_slice(events);
        Ok(events.last().map_or(0, |e| e.id))
    }
}

#[tokio::test]
async fn test_publish_replicates_to_interested_peer() {
    let broker = start(federated("edge", &["core", "backup"])).await;
    broker
        .accept_federated("core", interest(1, "core", "telemetry/#"))
        .await
        .unwrap();

    let report = broker
        .publish(Message::new("telemetry/pump/rpm", "1200", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(report.replicated, 1);

    let federation = broker.federation().unwrap();
    assert_eq!(federation.log("core").unwrap().len(), 1);
    assert!(federation.log("backup").unwrap().is_empty());

    let unrelated = broker
        .publish(Message::new("status/pump", "ok", QoS::AtMostOnce))
        .await
        .unwrap();
    assert_eq!(unrelated.replicated, 0);
}

#[tokio::test]
async fn test_sender_drains_log_over_link() {
    let broker = start(federated("edge", &["core"])).await;
    broker
        .accept_federated("core", interest(1, "core", "#"))
        .await
        .unwrap();
    let link = Arc::new(RecordingLink {
        peer: "core".to_string(),
        sent: Mutex::new(Vec::new()),
    });
    broker.attach_peer(link.clone()).unwrap();

    for i in 0..3 {
        broker
            .publish(Message::new("a/b", format!("{}", i), QoS::AtLeastOnce))
            .await
            .unwrap();
    }

    let log = broker.federation().unwrap().log("core").unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while log.acked() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let sent = link.sent.lock().clone();
    let ids: Vec<u64> = sent.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(sent.iter().all(|e| &*e.origin == "edge"));
    assert!(log.is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inbound_events_are_deduplicated() {
    let broker = start(federated("core", &["edge"])).await;
    let conn = broker.connect(ConnectRequest::new("ops")).await.unwrap();
    conn.subscribe("alarms/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();

    let first = broker
        .accept_federated("edge", publish_event(4, "edge", "alarms/door", "open"))
        .await
        .unwrap();
    assert_eq!(first.map(|r| r.enqueued), Some(1));
    let resent = broker
        .accept_federated("edge", publish_event(4, "edge", "alarms/door", "open"))
        .await
        .unwrap();
    assert_eq!(resent, None);

    let Some(Outbound::Publish(delivery)) = conn.try_recv().await.unwrap() else {
        panic!("expected the federated publish");
    };
    assert_eq!(delivery.payload, Bytes::from("open"));
    assert_eq!(conn.try_recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_unknown_peer_rejected() {
    let broker = start(federated("core", &["edge"])).await;
    let err = broker
        .accept_federated("stranger", interest(1, "stranger", "#"))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("stranger"));
}

#[tokio::test]
async fn test_unacked_events_refetched_after_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = federated("edge", &["core"]);
    config.persistence.backend = "fjall".to_string();
    config.persistence.path = dir.path().to_path_buf();

    let broker = start(config.clone()).await;
    broker
        .accept_federated("core", interest(1, "core", "meters/#"))
        .await
        .unwrap();
    for reading in ["10", "11"] {
        broker
            .publish(Message::new("meters/m1", reading, QoS::AtLeastOnce))
            .await
            .unwrap();
    }
    let epoch = broker.federation().unwrap().log("core").unwrap().epoch();
    broker.shutdown().await.unwrap();

    let broker = start(config).await;
    let log = broker.federation().unwrap().log("core").unwrap();
    assert_eq!(log.epoch(), epoch);
    let events = log.try_fetch_events(10).unwrap();
    assert!(events.iter().all(|e| e.epoch == epoch));
    let payloads: Vec<Bytes> = events
        .iter()
        .map(|e| match &e.payload {
            EventPayload::Publish(message) => message.payload.clone(),
            other => panic!("unexpected payload {:?}", other),
        })
        .collect();
    assert_eq!(payloads, vec![Bytes::from("10"), Bytes::from("11")]);
    assert_eq!(events[0].id, 1);
    broker.shutdown().await.unwrap();
}
