//! End-to-end scenarios against the in-memory broker.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use broker_client_core::{
    AckMode, BrokerConfig, Capability, CapabilitySet, ChannelProperties, ConnectError,
    ConnectionError, CorrelationKey, Destination, EndpointProperties, HandlerError,
    OutboundMessage, Retries, SessionEventKind,
};
use broker_client_flow::{
    AckStatus, CorrelatingPublisher, DeliveredMessage, EndpointProvisioner, FlowConsumer,
    FlowProperties, MessageHandler, PublishEventHandler,
};
use broker_client_session::{ConnectionManager, transport::MemoryBroker};
use tokio::sync::mpsc;

fn config() -> BrokerConfig {
    BrokerConfig::new("test:55555", "default", "app", "secret").with_channel(ChannelProperties {
        reconnect_retries: Retries::Limited(3),
        connect_retries_per_host: Retries::Limited(0),
        connect_retries: Retries::Limited(0),
        reconnect_retry_wait_ms: 5,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Confirmed {
    Ack(String),
    Nack(String),
}

#[derive(Default)]
struct Confirmations(Mutex<Vec<Confirmed>>);

impl Confirmations {
    fn snapshot(&self) -> Vec<Confirmed> {
        self.0.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<Confirmed> {
        for _ in 0..200 {
            let seen = self.snapshot();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.snapshot()
    }
}

impl PublishEventHandler for Confirmations {
    fn on_ack(&self, key: &CorrelationKey) {
        self.0.lock().unwrap().push(Confirmed::Ack(key.to_string()));
    }

    fn on_nack(&self, key: &CorrelationKey, _cause: &str, _timestamp: SystemTime) {
        self.0.lock().unwrap().push(Confirmed::Nack(key.to_string()));
    }
}

/// Forwards each delivery and acknowledges it under client mode.
struct AckingHandler(mpsc::UnboundedSender<DeliveredMessage>);

#[async_trait]
impl MessageHandler for AckingHandler {
    async fn on_message(&self, message: &DeliveredMessage) -> Result<(), HandlerError> {
        message.ack();
        self.0
            .send(message.clone())
            .map_err(|_| HandlerError::from("test receiver dropped"))
    }
}

async fn expect_message(rx: &mut mpsc::UnboundedReceiver<DeliveredMessage>) -> DeliveredMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no delivery")
        .expect("handler dropped")
}

#[tokio::test]
async fn hello_round_trip_with_client_ack() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone());
    let session = manager.connect(&config()).await.unwrap();

    let queue = EndpointProvisioner::new()
        .provision_queue(&session, "Q1", EndpointProperties::consume())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = FlowConsumer::new();
    let flow = consumer
        .bind(
            &session,
            FlowProperties::new(queue).with_ack_mode(AckMode::Client),
            Arc::new(AckingHandler(tx)),
        )
        .await
        .unwrap();
    flow.start().unwrap();

    let confirmations = Arc::new(Confirmations::default());
    let publisher = CorrelatingPublisher::new(&session, Arc::clone(&confirmations) as Arc<dyn PublishEventHandler>)
        .await
        .unwrap();
    publisher
        .publish(&Destination::queue("Q1"), OutboundMessage::new("hello"), "k1")
        .await
        .unwrap();

    let message = expect_message(&mut rx).await;
    assert_eq!(message.payload_str(), Some("hello"));
    assert_eq!(message.ack(), AckStatus::AlreadyAcknowledged);
    assert_eq!(confirmations.wait_for(1).await, vec![Confirmed::Ack("k1".to_string())]);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "message delivered more than once");
    assert_eq!(broker.queue_depth("Q1"), Some(0));

    consumer.close_all().await;
    publisher.close().await;
    session.close().await;
    assert_eq!(confirmations.snapshot().len(), 1);
    assert_eq!(broker.flows_released(), 1);
}

#[tokio::test]
async fn every_accepted_publish_gets_exactly_one_callback() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone());
    let session = manager.connect(&config()).await.unwrap();
    EndpointProvisioner::new()
        .provision_queue(
            &session,
            "Q1",
            EndpointProperties::consume().with_max_messages(5),
        )
        .await
        .unwrap();

    let confirmations = Arc::new(Confirmations::default());
    let publisher = CorrelatingPublisher::new(&session, Arc::clone(&confirmations) as Arc<dyn PublishEventHandler>)
        .await
        .unwrap();

    let mut accepted = Vec::new();
    for i in 0..8 {
        let key = format!("k{i}");
        let destination = if i % 4 == 3 {
            Destination::queue("missing")
        } else {
            Destination::queue("Q1")
        };
        if publisher
            .publish(&destination, OutboundMessage::new("m"), key.as_str())
            .await
            .is_ok()
        {
            accepted.push(key);
        }
    }
    publisher.close().await;

    let mut confirmed: Vec<String> = confirmations
        .snapshot()
        .into_iter()
        .map(|c| match c {
            Confirmed::Ack(key) | Confirmed::Nack(key) => key,
        })
        .collect();
    confirmed.sort();
    accepted.sort();
    assert_eq!(confirmed, accepted);
    assert!(!confirmed.iter().any(|key| key == "unused"));

    let nacked = confirmations
        .snapshot()
        .into_iter()
        .filter(|c| matches!(c, Confirmed::Nack(_)))
        .count();
    // k3 and k7 target an unknown queue; the quota of five leaves one more.
    assert_eq!(nacked, 3);
}

#[tokio::test]
async fn provisioning_twice_yields_equal_descriptors() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone());
    let session = manager.connect(&config()).await.unwrap();
    let provisioner = EndpointProvisioner::new();

    let first = provisioner
        .provision_topic_endpoint(&session, "TE1", "ek/tx/new", EndpointProperties::consume())
        .await
        .unwrap();
    let second = provisioner
        .provision_topic_endpoint(&session, "TE1", "ek/tx/new", EndpointProperties::consume())
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn unreachable_broker_exhausts_retries() {
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let manager = ConnectionManager::new(broker.clone());

    let mut cfg = config();
    cfg.channel.connect_retries = Retries::Limited(2);
    let err = manager.connect(&cfg).await.unwrap_err();

    assert!(err.to_string().starts_with("exhausted retries"), "{err}");
    assert!(matches!(
        err,
        ConnectError::Connection(ConnectionError::ExhaustedRetries { attempts: 3, .. })
    ));
    assert!(manager.active_session().await.is_none());
}

#[tokio::test]
async fn missing_capabilities_are_listed_exactly() {
    let advertised: CapabilitySet = [Capability::GuaranteedPublish, Capability::QueueSubscriptions]
        .into_iter()
        .collect();
    let manager = ConnectionManager::new(MemoryBroker::new().with_capabilities(advertised));

    match manager.connect(&config()).await {
        Err(ConnectError::Capability(e)) => {
            let expected: CapabilitySet = [
                Capability::GuaranteedSubscribeFlow,
                Capability::EndpointManagement,
            ]
            .into_iter()
            .collect();
            assert_eq!(e.missing, expected);
        }
        other => panic!("expected capability error, got {other:?}"),
    }
}

#[tokio::test]
async fn auto_mode_ack_never_errors() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone());
    let session = manager.connect(&config()).await.unwrap();
    let queue = EndpointProvisioner::new()
        .provision_queue(&session, "Q1", EndpointProperties::consume())
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let flow = FlowConsumer::new()
        .bind(
            &session,
            FlowProperties::new(queue).with_ack_mode(AckMode::Auto),
            Arc::new(AckingHandler(tx)),
        )
        .await
        .unwrap();
    flow.start().unwrap();

    let publisher = CorrelatingPublisher::new(&session, Arc::new(Confirmations::default()))
        .await
        .unwrap();
    publisher
        .publish(&Destination::queue("Q1"), OutboundMessage::new("hello"), "k1")
        .await
        .unwrap();

    let message = expect_message(&mut rx).await;
    assert_eq!(message.ack(), AckStatus::IgnoredAutoAck);
    assert_eq!(flow.stats().ack_warnings, 2);
    assert_eq!(flow.stats().failures, 0);
}

#[tokio::test]
async fn topic_endpoint_flow_survives_reconnect() {
    let broker = MemoryBroker::new();
    let manager = ConnectionManager::new(broker.clone());
    let session = manager.connect(&config()).await.unwrap();
    let provisioner = EndpointProvisioner::new();

    let te = provisioner
        .provision_topic_endpoint(&session, "TE1", "ek/tx/>", EndpointProperties::consume())
        .await
        .unwrap();
    let queue = provisioner
        .provision_queue(&session, "Q1", EndpointProperties::consume())
        .await
        .unwrap();
    provisioner
        .subscribe_queue(&session, &queue, "ek/tx/>")
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = FlowConsumer::new();
    let te_flow = consumer
        .bind(
            &session,
            FlowProperties::new(te)
                .with_ack_mode(AckMode::Client)
                .with_selector("priority >= 5"),
            Arc::new(AckingHandler(tx)),
        )
        .await
        .unwrap();
    te_flow.start().unwrap();

    let mut events = session.events().subscribe();
    broker.disconnect_all("router restart");
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no reconnect")
            .unwrap();
        if event.kind == SessionEventKind::Reconnected {
            break;
        }
    }
    assert_eq!(broker.queue_subscriptions("Q1"), vec!["ek/tx/>".to_string()]);

    let publisher = CorrelatingPublisher::new(&session, Arc::new(Confirmations::default()))
        .await
        .unwrap();
    for priority in [1_i64, 9] {
        publisher
            .publish(
                &Destination::topic("ek/tx/new"),
                OutboundMessage::new(format!("p{priority}")).with_property("priority", priority),
                CorrelationKey::random(),
            )
            .await
            .unwrap();
    }

    let message = expect_message(&mut rx).await;
    assert_eq!(message.payload_str(), Some("p9"));
    assert_eq!(broker.queue_depth("Q1"), Some(2));

    consumer.close_all().await;
    publisher.close().await;
    session.close().await;
}
