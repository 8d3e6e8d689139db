//! End-to-end delivery through the public broker API

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use meshmq::broker::{Delivery, Outbound, PublishOutcome};
use meshmq::config::ConfigError;
use meshmq::hooks::CloseReason;
use meshmq::protocol::SubscriptionOptions;
use meshmq::queue::FullPolicy;
use meshmq::{
    Broker, BrokerError, Config, ConnectRequest, Connection, Message, PersistenceRegistry,
    PluginRegistry, QoS,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn start(config: Config) -> Arc<Broker> {
    Broker::from_config(
        config,
        &PersistenceRegistry::with_defaults(),
        &PluginRegistry::with_defaults(),
    )
    .await
    .unwrap()
}

async fn connect(broker: &Arc<Broker>, client_id: &str, clean_start: bool) -> Connection {
    broker
        .connect(ConnectRequest::new(client_id).clean_start(clean_start))
        .await
        .unwrap()
}

async fn drain(conn: &Connection) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Some(outbound) = conn.try_recv().await.unwrap() {
        match outbound {
            Outbound::Publish(delivery) => out.push(delivery),
            Outbound::PubRel(id) => panic!("unexpected PUBREL {}", id),
        }
    }
    out
}

fn payloads(deliveries: &[Delivery]) -> Vec<Bytes> {
    deliveries.iter().map(|d| d.payload.clone()).collect()
}

#[tokio::test]
async fn test_wildcard_fan_out_online_and_offline() {
    let broker = start(Config::default()).await;

    let online = connect(&broker, "dashboard", true).await;
    online
        .subscribe("sensors/+/temp", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    let offline = connect(&broker, "archiver", false).await;
    offline
        .subscribe("sensors/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    offline.close(CloseReason::Graceful).await.unwrap();

    let report = broker
        .publish(Message::new("sensors/42/temp", "21.5", QoS::AtLeastOnce))
        .await
        .unwrap();
    assert_eq!(report.matched, 2);
    assert_eq!(report.enqueued, 2);

    let live = drain(&online).await;
    assert_eq!(payloads(&live), vec![Bytes::from("21.5")]);

    let archiver = connect(&broker, "archiver", false).await;
    assert!(archiver.session_present());
    let stored = drain(&archiver).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(&*stored[0].topic, "sensors/42/temp");

    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shared_subscription_spreads_messages() {
    let broker = start(Config::default()).await;
    let a = connect(&broker, "worker-a", true).await;
    let b = connect(&broker, "worker-b", true).await;
    for worker in [&a, &b] {
        worker
            .subscribe("$share/workers/jobs/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
            .await
            .unwrap();
    }

    for i in 0..4 {
        let report = broker
            .publish(Message::new("jobs/build", format!("job-{}", i), QoS::AtLeastOnce))
            .await
            .unwrap();
        assert_eq!(report.enqueued, 1);
    }

    let got_a = drain(&a).await.len();
    let got_b = drain(&b).await.len();
    assert_eq!(got_a + got_b, 4);
    assert_eq!(got_a, 2);
    assert_eq!(got_b, 2);
}

#[tokio::test]
async fn test_queue_order_survives_reconnect() {
    let broker = start(Config::default()).await;
    let conn = connect(&broker, "logger", false).await;
    conn.subscribe("logs/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    conn.close(CloseReason::Graceful).await.unwrap();

    for i in 0..5 {
        broker
            .publish(Message::new("logs/app", format!("line-{}", i), QoS::AtLeastOnce))
            .await
            .unwrap();
    }

    let conn = connect(&broker, "logger", false).await;
    let expected: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("line-{}", i))).collect();
    assert_eq!(payloads(&drain(&conn).await), expected);
}

#[tokio::test]
async fn test_double_puback_is_noop() {
    let broker = start(Config::default()).await;
    let conn = connect(&broker, "meter", true).await;
    conn.subscribe("power/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    broker
        .publish(Message::new("power/main", "3.2kW", QoS::AtLeastOnce))
        .await
        .unwrap();

    let delivery = drain(&conn).await.remove(0);
    let packet_id = delivery.packet_id.unwrap();
    assert!(conn.puback(packet_id).await.unwrap());
    assert!(!conn.puback(packet_id).await.unwrap());
    assert_eq!(conn.queued(), 0);
}

#[tokio::test]
async fn test_full_queue_drops_oldest() {
    let mut config = Config::default();
    config.queue.max_queued_messages = 3;
    config.queue.full_policy = FullPolicy::DropOldest;
    let broker = start(config).await;

    let conn = connect(&broker, "slow", false).await;
    conn.subscribe("ticks", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    conn.close(CloseReason::Graceful).await.unwrap();

    for i in 0..5 {
        broker
            .publish(Message::new("ticks", format!("{}", i), QoS::AtLeastOnce))
            .await
            .unwrap();
    }

    let conn = connect(&broker, "slow", false).await;
    assert_eq!(conn.queued(), 3);
    assert_eq!(
        payloads(&drain(&conn).await),
        vec![Bytes::from("2"), Bytes::from("3"), Bytes::from("4")]
    );
}

#[tokio::test]
async fn test_qos2_inbound_flow() {
    let broker = start(Config::default()).await;
    let sub = connect(&broker, "sub", true).await;
    sub.subscribe("orders", SubscriptionOptions::with_qos(QoS::ExactlyOnce), None)
        .await
        .unwrap();
    let publisher = connect(&broker, "pos", true).await;

    let message = Message::new("orders", "#1001", QoS::ExactlyOnce).with_packet_id(7);
    let first = publisher.publish(message.clone()).await.unwrap();
    assert!(matches!(first, PublishOutcome::Accepted(_)));
    let again = publisher.publish(message).await.unwrap();
    assert_eq!(again, PublishOutcome::Duplicate);
    assert!(publisher.pubrel(7).await.unwrap());
    assert!(!publisher.pubrel(7).await.unwrap());

    let delivered = drain(&sub).await;
    assert_eq!(delivered.len(), 1);
    let packet_id = delivered[0].packet_id.unwrap();
    assert!(sub.pubrec(packet_id).await.unwrap());
    assert!(sub.pubcomp(packet_id).await.unwrap());
    assert_eq!(sub.queued(), 0);
}

#[tokio::test]
async fn test_recv_waits_for_publish() {
    let broker = start(Config::default()).await;
    let conn = connect(&broker, "waiter", true).await;
    conn.subscribe("alerts", SubscriptionOptions::with_qos(QoS::AtMostOnce), None)
        .await
        .unwrap();

    let publisher = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher
            .publish(Message::new("alerts", "fire", QoS::AtMostOnce))
            .await
            .unwrap();
    });

    let outbound = tokio::time::timeout(Duration::from_secs(5), conn.recv())
        .await
        .unwrap()
        .unwrap();
    let Outbound::Publish(delivery) = outbound else {
        panic!("expected a publish");
    };
    assert_eq!(delivery.payload, Bytes::from("fire"));
    assert_eq!(delivery.packet_id, None);
}

#[tokio::test]
async fn test_fjall_session_survives_restart() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.persistence.backend = "fjall".to_string();
    config.persistence.path = dir.path().to_path_buf();

    let broker = start(config.clone()).await;
    let conn = connect(&broker, "gateway", false).await;
    conn.subscribe("cmd/gateway/#", SubscriptionOptions::with_qos(QoS::AtLeastOnce), None)
        .await
        .unwrap();
    conn.close(CloseReason::Graceful).await.unwrap();
    broker
        .publish(Message::new("cmd/gateway/reboot", "now", QoS::AtLeastOnce))
        .await
        .unwrap();
    broker
        .publish(Message::new("cmd/gateway/fw", "v2", QoS::AtLeastOnce).retained(true))
        .await
        .unwrap();
    broker.shutdown().await.unwrap();

    let broker = start(config).await;
    assert_eq!(broker.session_count().await.unwrap(), 1);
    assert_eq!(broker.subscription_count(), 1);
    assert_eq!(broker.retained_count(), 1);

    let conn = connect(&broker, "gateway", false).await;
    assert!(conn.session_present());
    assert_eq!(
        payloads(&drain(&conn).await),
        vec![Bytes::from("now"), Bytes::from("v2")]
    );
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_backend_fails_fast() {
    let mut config = Config::default();
    config.persistence.backend = "cassandra".to_string();
    let err = Broker::from_config(
        config,
        &PersistenceRegistry::with_defaults(),
        &PluginRegistry::with_defaults(),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(
        err,
        BrokerError::Config(ConfigError::UnknownBackend(ref name)) if name == "cassandra"
    ));
}

#[tokio::test]
async fn test_auth_plugin_from_config() {
    let config = Config::parse(
        r#"
[plugins]
order = ["auth"]

[plugins.config.auth]
allow_anonymous = false

[[plugins.config.auth.users]]
username = "device"
password = "hunter2"
"#,
    )
    .unwrap();
    let broker = start(config).await;

    let denied = broker.connect(ConnectRequest::new("anon")).await;
    assert!(matches!(denied, Err(BrokerError::Hook(_))));

    let admitted = broker
        .connect(ConnectRequest::new("dev-1").with_credentials("device", "hunter2"))
        .await;
    assert!(admitted.is_ok());
    assert!(broker.is_connected("dev-1"));
    assert!(!broker.is_connected("anon"));
}
