//! Transaction demo against the in-memory broker.
//!
//! Run with: cargo run -p transaction-app -- [config file]
//!
//! Connects, provisions a queue and a durable topic endpoint, binds a flow to
//! each, publishes a batch of transactions and shuts everything down in
//! reverse order. The config file defaults to `application.properties`;
//! `.json` and `.toml` files are read as such, and `BROKER_CLIENT_*`
//! environment variables override any key.

use std::{
    env,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use broker_client_core::{
    AckMode, ClientError, Destination, EndpointProperties, HandlerError, MessagingConfig,
    OutboundMessage, SessionEvent, SessionEventKind,
};
use broker_client_flow::{
    CorrelatingPublisher, DeliveredMessage, EndpointProvisioner, FlowConsumer, FlowProperties,
    LoggingPublishHandler, MessageHandler,
};
use broker_client_session::{ConnectionManager, transport::MemoryBroker};
use futures::StreamExt;
use tokio::sync::Notify;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TRANSACTIONS: usize = 10;

/// Logs each transaction and acknowledges it under client mode.
struct TransactionHandler {
    flow: &'static str,
    ack_mode: AckMode,
    received: AtomicUsize,
}

impl TransactionHandler {
    const fn new(flow: &'static str, ack_mode: AckMode) -> Self {
        Self {
            flow,
            ack_mode,
            received: AtomicUsize::new(0),
        }
    }

    fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageHandler for TransactionHandler {
    async fn on_message(&self, message: &DeliveredMessage) -> Result<(), HandlerError> {
        let body = message
            .payload_str()
            .ok_or_else(|| HandlerError::from("payload is not UTF-8"))?;
        tracing::info!(
            flow = self.flow,
            message_id = message.message_id,
            redelivered = message.redelivered,
            body,
            "Transaction received"
        );
        if self.ack_mode == AckMode::Client {
            message.ack();
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| "application.properties".to_string());
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(78);
        }
    };

    match run(&config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(fatal = e.is_fatal(), "{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn load_config(path: &str) -> anyhow::Result<MessagingConfig> {
    MessagingConfig::load(path).with_context(|| format!("failed to load configuration from {path}"))
}

async fn run(config: &MessagingConfig) -> Result<(), ClientError> {
    let broker_config = &config.broker;
    let endpoints = &config.endpoints;

    let broker = MemoryBroker::new()
        .with_credentials(&broker_config.username, &broker_config.password);
    let lost = Arc::new(Notify::new());
    let on_lost = Arc::clone(&lost);
    let manager = ConnectionManager::new(broker.clone()).with_event_handler(Arc::new(
        move |event: &SessionEvent| {
            if event.kind == SessionEventKind::ConnectionLost {
                on_lost.notify_one();
            }
        },
    ));

    let session = manager.connect(broker_config).await?;
    tracing::info!(session = %session.id(), capabilities = %session.capabilities(), "Connected");

    let mut events = session.events().history_plus_stream();
    let monitor = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            tracing::warn!(kind = %event.kind, cause = %event.cause, "Session event");
        }
    });

    let provisioner = EndpointProvisioner::new();
    let queue = provisioner
        .provision_queue(&session, &endpoints.queue, EndpointProperties::consume())
        .await?;
    provisioner
        .subscribe_queue(&session, &queue, &endpoints.publisher_topic)
        .await?;
    let topic_endpoint = provisioner
        .provision_topic_endpoint(
            &session,
            &endpoints.topic_endpoint,
            &endpoints.publisher_topic,
            EndpointProperties::consume(),
        )
        .await?;

    let queue_handler = Arc::new(TransactionHandler::new("queue", endpoints.queue_ack_mode));
    let te_handler = Arc::new(TransactionHandler::new(
        "topic-endpoint",
        endpoints.topic_endpoint_ack_mode,
    ));

    let consumer = FlowConsumer::new();
    let queue_flow = consumer
        .bind(
            &session,
            FlowProperties::new(queue).with_ack_mode(endpoints.queue_ack_mode),
            Arc::clone(&queue_handler) as Arc<dyn MessageHandler>,
        )
        .await?;
    let mut te_properties =
        FlowProperties::new(topic_endpoint).with_ack_mode(endpoints.topic_endpoint_ack_mode);
    if let Some(selector) = &endpoints.selector {
        te_properties = te_properties.with_selector(selector.as_str());
    }
    let te_flow = consumer
        .bind(
            &session,
            te_properties,
            Arc::clone(&te_handler) as Arc<dyn MessageHandler>,
        )
        .await?;
    queue_flow.start()?;
    te_flow.start()?;

    let publisher = CorrelatingPublisher::new(&session, Arc::new(LoggingPublishHandler)).await?;
    let destination = Destination::topic(endpoints.publisher_topic.as_str());
    for i in 0..TRANSACTIONS {
        let priority = i64::try_from(i % 10).unwrap_or_default();
        let message = OutboundMessage::new(format!("transaction {i}"))
            .with_property("priority", priority);
        if let Err(e) = publisher
            .publish(&destination, message, format!("tx-{i}"))
            .await
        {
            tracing::warn!(error = %e, "Transaction not published");
        }
    }

    for _ in 0..100 {
        if queue_handler.received() >= TRANSACTIONS {
            break;
        }
        tokio::select! {
            () = lost.notified() => {
                tracing::error!("Connection lost before all transactions arrived");
                break;
            }
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
    }

    consumer.close_all().await;
    publisher.close().await;
    tracing::info!(
        queue = queue_handler.received(),
        topic_endpoint = te_handler.received(),
        queue_stats = ?queue_flow.stats(),
        te_stats = ?te_flow.stats(),
        "Deliveries"
    );
    session.close().await;
    manager.close().await;
    monitor.abort();

    Ok(())
}
