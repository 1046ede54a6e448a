//! Consumer flows.
//!
//! A [`Flow`] delivers the messages of one queue or topic endpoint to a
//! [`MessageHandler`], one at a time. The ack mode is chosen per flow:
//! under [`AckMode::Auto`] the broker settles a message when it is handed to
//! the handler, under [`AckMode::Client`] the application calls
//! [`DeliveredMessage::ack`].
//!
//! Closing a flow waits for the in-flight callback to return before the
//! broker-side flow is released, so a handler never runs against a released
//! flow.

use std::{
    any::Any,
    fmt,
    ops::Deref,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Mutex, OnceLock, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use broker_client_core::{
    AckMode, BindError, EndpointDescriptor, EndpointKind, FlowError, InboundMessage,
    traits::{Delivery, DeliverySink, FlowRequest, TransportError, TransportFlow},
};
use broker_client_session::{Session, SessionResource};
use futures::FutureExt;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

use crate::handlers::MessageHandler;

tokio::task_local! {
    /// Flow whose callback is running on the current task.
    static CURRENT_FLOW: Uuid;
}

/// Bind parameters of a consumer flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowProperties {
    pub endpoint: EndpointDescriptor,
    pub ack_mode: AckMode,
    /// SQL-92 style selector on message properties.
    pub selector: Option<String>,
    /// Topic to attach to a topic endpoint on bind.
    pub new_subscription: Option<String>,
}

impl FlowProperties {
    #[must_use]
    pub fn new(endpoint: EndpointDescriptor) -> Self {
        Self {
            endpoint,
            ack_mode: AckMode::default(),
            selector: None,
            new_subscription: None,
        }
    }

    #[must_use]
    pub const fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    #[must_use]
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    #[must_use]
    pub fn with_new_subscription(mut self, topic: impl Into<String>) -> Self {
        self.new_subscription = Some(topic.into());
        self
    }
}

/// Lifecycle state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Created,
    Started,
    Stopped,
    Closed,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Delivery counters of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub delivered: u64,
    /// Callbacks that returned an error or panicked.
    pub failures: u64,
    pub acknowledged: u64,
    /// Acks attempted under auto mode.
    pub ack_warnings: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    failures: AtomicU64,
    acknowledged: AtomicU64,
    ack_warnings: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> FlowStats {
        FlowStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            ack_warnings: self.ack_warnings.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of [`DeliveredMessage::ack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStatus {
    Acknowledged,
    /// This message was acknowledged before.
    AlreadyAcknowledged,
    /// The flow runs in auto mode; nothing was sent.
    IgnoredAutoAck,
    /// The broker no longer tracks the message, e.g. after the flow closed.
    Expired,
}

struct FlowShared {
    id: Uuid,
    endpoint: EndpointDescriptor,
    ack_mode: AckMode,
    selector: Option<String>,
    handler: Arc<dyn MessageHandler>,
    transport: OnceLock<Arc<dyn TransportFlow>>,
    state: Mutex<FlowState>,
    closed: AtomicBool,
    released: AtomicBool,
    /// Held for read by each callback, for write by `close`.
    gate: RwLock<()>,
    /// Completes once an orderly close has drained and released the flow.
    closing: OnceCell<()>,
    counters: Counters,
}

impl FlowShared {
    fn state(&self) -> FlowState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FlowState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn in_own_callback(&self) -> bool {
        CURRENT_FLOW.try_with(|id| *id == self.id).unwrap_or(false)
    }

    fn release_transport(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.get() {
            transport.stop();
            transport.close();
        }
    }

    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        self.set_state(FlowState::Closed);
        first
    }

    /// Orderly close. Every caller returns once the in-flight callback has
    /// drained and the flow is released, except a caller running inside this
    /// flow's callback, which releases without waiting for itself.
    async fn shutdown(&self) {
        if self.in_own_callback() {
            if self.mark_closed() {
                tracing::debug!(flow = %self.id, "Flow closed from its own callback");
            }
            self.release_transport();
            return;
        }
        self.closing
            .get_or_init(|| async move {
                self.mark_closed();
                let _drained = self.gate.write().await;
                self.release_transport();

                let stats = self.counters.snapshot();
                tracing::info!(
                    flow = %self.id,
                    endpoint = %self.endpoint,
                    delivered = stats.delivered,
                    failures = stats.failures,
                    "Flow closed"
                );
            })
            .await;
    }
}

#[async_trait]
impl SessionResource for FlowShared {
    async fn close(&self) {
        self.shutdown().await;
    }

    fn release(&self) {
        if self.mark_closed() {
            tracing::debug!(flow = %self.id, "Flow released with its session");
        }
        self.release_transport();
    }
}

/// A message delivered on a flow.
///
/// Dereferences to the [`InboundMessage`]. Clones share acknowledgement
/// state, so a clone may be acknowledged after the callback returned.
#[derive(Clone)]
pub struct DeliveredMessage {
    message: InboundMessage,
    flow: Arc<FlowShared>,
    acked: Arc<AtomicBool>,
}

impl fmt::Debug for DeliveredMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveredMessage")
            .field("flow", &self.flow.id)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl Deref for DeliveredMessage {
    type Target = InboundMessage;

    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl DeliveredMessage {
    #[must_use]
    pub const fn message(&self) -> &InboundMessage {
        &self.message
    }

    /// Id of the flow that delivered this message.
    #[must_use]
    pub fn flow_id(&self) -> Uuid {
        self.flow.id
    }

    /// Acknowledge the message.
    ///
    /// Never fails. Under auto mode this is a no-op that logs a warning.
    pub fn ack(&self) -> AckStatus {
        let flow = &self.flow;
        if flow.ack_mode == AckMode::Auto {
            flow.counters.ack_warnings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                flow = %flow.id,
                message_id = self.message.message_id,
                "ack attempted under auto mode has no effect"
            );
            return AckStatus::IgnoredAutoAck;
        }

        if self.acked.swap(true, Ordering::SeqCst) {
            return AckStatus::AlreadyAcknowledged;
        }

        let Some(transport) = flow.transport.get() else {
            self.acked.store(false, Ordering::SeqCst);
            return AckStatus::Expired;
        };
        match transport.ack(self.message.message_id) {
            Ok(()) => {
                flow.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                AckStatus::Acknowledged
            }
            Err(e) => {
                self.acked.store(false, Ordering::SeqCst);
                tracing::debug!(flow = %flow.id, message_id = self.message.message_id, error = %e, "Ack not applied");
                AckStatus::Expired
            }
        }
    }
}

/// Bridges transport deliveries to the application handler.
struct FlowSink {
    flow: Weak<FlowShared>,
}

#[async_trait]
impl DeliverySink for FlowSink {
    async fn deliver(&self, message: InboundMessage) -> Delivery {
        let Some(flow) = self.flow.upgrade() else {
            return Delivery::Declined;
        };
        let _in_flight = flow.gate.read().await;
        if flow.closed.load(Ordering::SeqCst) {
            return Delivery::Declined;
        }

        flow.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let message_id = message.message_id;
        let delivered = DeliveredMessage {
            message,
            flow: Arc::clone(&flow),
            acked: Arc::new(AtomicBool::new(false)),
        };

        let callback = AssertUnwindSafe(flow.handler.on_message(&delivered)).catch_unwind();
        match CURRENT_FLOW.scope(flow.id, callback).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                flow.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(flow = %flow.id, message_id, error = %e, "Message handler failed");
            }
            Err(panic) => {
                flow.counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    flow = %flow.id,
                    message_id,
                    panic = %panic_message(&*panic),
                    "Message handler panicked"
                );
            }
        }

        Delivery::Accepted
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Handle to a bound consumer flow.
///
/// Dropping an unclosed flow releases it without waiting for an in-flight
/// callback; call [`Flow::close`] for an orderly shutdown.
pub struct Flow {
    shared: Arc<FlowShared>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.shared.id)
            .field("endpoint", &self.shared.endpoint)
            .field("ack_mode", &self.shared.ack_mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Flow {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn endpoint(&self) -> &EndpointDescriptor {
        &self.shared.endpoint
    }

    #[must_use]
    pub fn ack_mode(&self) -> AckMode {
        self.shared.ack_mode
    }

    #[must_use]
    pub fn selector(&self) -> Option<&str> {
        self.shared.selector.as_deref()
    }

    #[must_use]
    pub fn state(&self) -> FlowState {
        self.shared.state()
    }

    #[must_use]
    pub fn stats(&self) -> FlowStats {
        self.shared.counters.snapshot()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Start or resume delivery.
    ///
    /// # Errors
    /// Returns error if the flow is closed.
    pub fn start(&self) -> Result<(), FlowError> {
        if self.is_closed() {
            return Err(FlowError::Closed);
        }
        let transport = self.shared.transport.get().ok_or(FlowError::Closed)?;
        transport.start().map_err(|e| match e {
            TransportError::NotConnected => FlowError::NotConnected,
            _ => FlowError::Closed,
        })?;
        self.shared.set_state(FlowState::Started);
        tracing::debug!(flow = %self.shared.id, "Flow started");
        Ok(())
    }

    /// Pause delivery. Messages stay on the broker.
    ///
    /// # Errors
    /// Returns error if the flow is closed.
    pub fn stop(&self) -> Result<(), FlowError> {
        if self.is_closed() {
            return Err(FlowError::Closed);
        }
        if let Some(transport) = self.shared.transport.get() {
            transport.stop();
        }
        self.shared.set_state(FlowState::Stopped);
        tracing::debug!(flow = %self.shared.id, "Flow stopped");
        Ok(())
    }

    /// Close the flow. Idempotent.
    ///
    /// Waits for an in-flight callback to return, except when called from
    /// that callback.
    pub async fn close(&self) {
        self.shared.shutdown().await;
    }
}

impl Drop for Flow {
    fn drop(&mut self) {
        if self.shared.mark_closed() {
            self.shared.release_transport();
            tracing::debug!(flow = %self.shared.id, "Flow released on drop");
        }
    }
}

/// Binds consumer flows and tracks them for shutdown.
#[derive(Default)]
pub struct FlowConsumer {
    flows: Mutex<Vec<Weak<FlowShared>>>,
}

impl fmt::Debug for FlowConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowConsumer")
            .field("flows", &self.live_flows().len())
            .finish()
    }
}

impl FlowConsumer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn live_flows(&self) -> Vec<Arc<FlowShared>> {
        let mut flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        flows.retain(|f| f.upgrade().is_some_and(|f| !f.closed.load(Ordering::SeqCst)));
        flows.iter().filter_map(Weak::upgrade).collect()
    }

    /// Bind a flow to a provisioned endpoint. The flow is created stopped.
    ///
    /// A topic endpoint bound without an explicit new subscription attracts
    /// the topic recorded in its descriptor.
    ///
    /// # Errors
    /// Returns error if the session is down, the endpoint does not exist, the
    /// selector is invalid, or the broker refuses the bind.
    pub async fn bind(
        &self,
        session: &Session,
        properties: FlowProperties,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Flow, BindError> {
        if !session.is_connected() {
            return Err(BindError::NotConnected);
        }

        let FlowProperties {
            endpoint,
            ack_mode,
            selector,
            new_subscription,
        } = properties;

        let new_subscription = match endpoint.kind {
            EndpointKind::Queue if new_subscription.is_some() => {
                return Err(BindError::Rejected {
                    endpoint: endpoint.name,
                    reason: "a new subscription can only be attached to a topic endpoint"
                        .to_string(),
                });
            }
            EndpointKind::Queue => None,
            EndpointKind::TopicEndpoint => new_subscription.or_else(|| endpoint.topic.clone()),
        };
        let selector = selector.filter(|s| !s.trim().is_empty());

        let shared = Arc::new(FlowShared {
            id: Uuid::new_v4(),
            endpoint: endpoint.clone(),
            ack_mode,
            selector: selector.clone(),
            handler,
            transport: OnceLock::new(),
            state: Mutex::new(FlowState::Created),
            closed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            gate: RwLock::new(()),
            closing: OnceCell::new(),
            counters: Counters::default(),
        });
        let sink = Arc::new(FlowSink {
            flow: Arc::downgrade(&shared),
        });

        let request = FlowRequest {
            endpoint: endpoint.clone(),
            ack_mode,
            selector,
            new_subscription,
        };
        let transport = session
            .link()
            .create_flow(request, sink)
            .await
            .map_err(|e| match e {
                TransportError::NotFound(_) => BindError::UnknownEndpoint(endpoint.name.clone()),
                TransportError::InvalidSelector(reason) => BindError::InvalidSelector(reason),
                TransportError::NotConnected | TransportError::Closed => BindError::NotConnected,
                other => BindError::Rejected {
                    endpoint: endpoint.name.clone(),
                    reason: other.to_string(),
                },
            })?;
        let _ = shared.transport.set(transport);
        let resource: Weak<dyn SessionResource> = Arc::downgrade(&shared) as Weak<FlowShared>;
        session.track(resource);

        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&shared));
        tracing::info!(flow = %shared.id, %endpoint, %ack_mode, "Flow bound");

        Ok(Flow { shared })
    }

    /// Close every flow bound through this consumer.
    pub async fn close_all(&self) {
        for flow in self.live_flows() {
            flow.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use broker_client_core::{
        BrokerConfig, ChannelProperties, CorrelationKey, Destination, EndpointProperties,
        HandlerError, OutboundMessage, Permission,
    };
    use broker_client_session::{ConnectionManager, transport::MemoryBroker};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        handlers::{FnMessageHandler, LoggingPublishHandler},
        provision::EndpointProvisioner,
        publisher::CorrelatingPublisher,
    };

    struct Harness {
        broker: MemoryBroker,
        _manager: ConnectionManager<MemoryBroker>,
        session: Session,
        queue: EndpointDescriptor,
        publisher: CorrelatingPublisher,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = MemoryBroker::new();
            let manager = ConnectionManager::new(broker.clone());
            let config = BrokerConfig::new("test:55555", "default", "app", "secret")
                .with_channel(ChannelProperties {
                    reconnect_retry_wait_ms: 5,
                    ..ChannelProperties::default()
                });
            let session = manager.connect(&config).await.unwrap();
            let queue = EndpointProvisioner::new()
                .provision_queue(&session, "Q1", EndpointProperties::consume())
                .await
                .unwrap();
            let publisher = CorrelatingPublisher::new(&session, Arc::new(LoggingPublishHandler))
                .await
                .unwrap();
            Self {
                broker,
                _manager: manager,
                session,
                queue,
                publisher,
            }
        }

        async fn publish(&self, body: &str) {
            self.publisher
                .publish(
                    &Destination::queue("Q1"),
                    OutboundMessage::new(body.to_string()),
                    CorrelationKey::random(),
                )
                .await
                .unwrap();
        }
    }

    /// Forwards every delivery to a channel.
    struct Forward(mpsc::UnboundedSender<DeliveredMessage>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn on_message(&self, message: &DeliveredMessage) -> Result<(), HandlerError> {
            let _ = self.0.send(message.clone());
            Ok(())
        }
    }

    fn forward() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<DeliveredMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Forward(tx)), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<DeliveredMessage>) -> DeliveredMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no delivery")
            .expect("handler dropped")
    }

    #[tokio::test]
    async fn test_flow_starts_stopped() {
        let h = Harness::new().await;
        let (handler, mut rx) = forward();
        let flow = FlowConsumer::new()
            .bind(&h.session, FlowProperties::new(h.queue.clone()), handler)
            .await
            .unwrap();
        assert_eq!(flow.state(), FlowState::Created);

        h.publish("hello").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        flow.start().unwrap();
        assert_eq!(recv(&mut rx).await.payload_str(), Some("hello"));
        assert_eq!(flow.state(), FlowState::Started);
    }

    #[tokio::test]
    async fn test_auto_mode_ack_is_a_warning() {
        let h = Harness::new().await;
        let (handler, mut rx) = forward();
        let flow = FlowConsumer::new()
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_ack_mode(AckMode::Auto),
                handler,
            )
            .await
            .unwrap();
        flow.start().unwrap();
        h.publish("hello").await;

        let message = recv(&mut rx).await;
        assert_eq!(message.ack(), AckStatus::IgnoredAutoAck);
        assert_eq!(message.ack(), AckStatus::IgnoredAutoAck);
        assert_eq!(flow.stats().ack_warnings, 2);
        assert_eq!(h.broker.unacked_count(EndpointKind::Queue, "Q1"), Some(0));
        assert_eq!(h.broker.queue_depth("Q1"), Some(0));
    }

    #[tokio::test]
    async fn test_client_mode_ack() {
        let h = Harness::new().await;
        let (handler, mut rx) = forward();
        let flow = FlowConsumer::new()
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_ack_mode(AckMode::Client),
                handler,
            )
            .await
            .unwrap();
        flow.start().unwrap();
        h.publish("hello").await;

        let message = recv(&mut rx).await;
        assert_eq!(h.broker.unacked_count(EndpointKind::Queue, "Q1"), Some(1));
        assert_eq!(message.ack(), AckStatus::Acknowledged);
        assert_eq!(message.ack(), AckStatus::AlreadyAcknowledged);
        assert_eq!(h.broker.unacked_count(EndpointKind::Queue, "Q1"), Some(0));
        assert_eq!(flow.stats().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_ack_after_close_is_expired() {
        let h = Harness::new().await;
        let (handler, mut rx) = forward();
        let flow = FlowConsumer::new()
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_ack_mode(AckMode::Client),
                handler,
            )
            .await
            .unwrap();
        flow.start().unwrap();
        h.publish("hello").await;

        let message = recv(&mut rx).await;
        flow.close().await;
        assert_eq!(message.ack(), AckStatus::Expired);
        assert_eq!(h.broker.queue_depth("Q1"), Some(1));
    }

    #[tokio::test]
    async fn test_handler_failures_do_not_stop_the_flow() {
        let h = Harness::new().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = FnMessageHandler::new(move |message: &DeliveredMessage| {
            match message.payload_str() {
                Some("fail") => Err(HandlerError::from("bad payload")),
                Some("panic") => panic!("handler bug"),
                _ => {
                    let _ = tx.send(message.clone());
                    Ok(())
                }
            }
        });
        let flow = FlowConsumer::new()
            .bind(&h.session, FlowProperties::new(h.queue.clone()), Arc::new(handler))
            .await
            .unwrap();
        flow.start().unwrap();

        for body in ["fail", "panic", "ok"] {
            h.publish(body).await;
        }

        assert_eq!(recv(&mut rx).await.payload_str(), Some("ok"));
        let stats = flow.stats();
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.failures, 2);
    }

    #[tokio::test]
    async fn test_selector_filters_messages() {
        let h = Harness::new().await;
        let (handler, mut rx) = forward();
        let flow = FlowConsumer::new()
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_selector("region = 'eu'"),
                handler,
            )
            .await
            .unwrap();
        flow.start().unwrap();

        for region in ["us", "eu"] {
            h.publisher
                .publish(
                    &Destination::queue("Q1"),
                    OutboundMessage::new(region.to_string()).with_property("region", region),
                    CorrelationKey::random(),
                )
                .await
                .unwrap();
        }

        assert_eq!(recv(&mut rx).await.payload_str(), Some("eu"));
        assert_eq!(h.broker.queue_depth("Q1"), Some(1));
    }

    #[tokio::test]
    async fn test_bind_errors() {
        let h = Harness::new().await;
        let consumer = FlowConsumer::new();
        let (handler, _rx) = forward();

        let err = consumer
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_new_subscription("ek/tx"),
                Arc::clone(&handler),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::Rejected { .. }));

        let err = consumer
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_selector("region ="),
                Arc::clone(&handler),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::InvalidSelector(_)));

        let missing = EndpointDescriptor::queue("missing", EndpointProperties::consume());
        let err = consumer
            .bind(&h.session, FlowProperties::new(missing), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::UnknownEndpoint(name) if name == "missing"));
    }

    /// Signals when a callback starts, then holds it until released.
    struct Blocking {
        started: mpsc::UnboundedSender<()>,
        finished: Arc<AtomicBool>,
        hold: Duration,
    }

    #[async_trait]
    impl MessageHandler for Blocking {
        async fn on_message(&self, _message: &DeliveredMessage) -> Result<(), HandlerError> {
            let _ = self.started.send(());
            tokio::time::sleep(self.hold).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_callback() {
        let h = Harness::new().await;
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let handler = Blocking {
            started: started_tx,
            finished: Arc::clone(&finished),
            hold: Duration::from_millis(100),
        };
        let flow = FlowConsumer::new()
            .bind(&h.session, FlowProperties::new(h.queue.clone()), Arc::new(handler))
            .await
            .unwrap();
        flow.start().unwrap();
        h.publish("slow").await;

        started.recv().await.unwrap();
        flow.close().await;
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(h.broker.flows_released(), 1);

        flow.close().await;
        drop(flow);
        assert_eq!(h.broker.flows_released(), 1);
    }

    /// Holds the callback, then acks the message and reports the outcome.
    struct SlowAck {
        started: mpsc::UnboundedSender<()>,
        outcome: mpsc::UnboundedSender<AckStatus>,
        hold: Duration,
    }

    #[async_trait]
    impl MessageHandler for SlowAck {
        async fn on_message(&self, message: &DeliveredMessage) -> Result<(), HandlerError> {
            let _ = self.started.send(());
            tokio::time::sleep(self.hold).await;
            let _ = self.outcome.send(message.ack());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_session_close_waits_for_in_flight_callback() {
        let h = Harness::new().await;
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let (outcome_tx, mut outcome) = mpsc::unbounded_channel();
        let handler = SlowAck {
            started: started_tx,
            outcome: outcome_tx,
            hold: Duration::from_millis(200),
        };
        let consumer = FlowConsumer::new();
        let flow = consumer
            .bind(
                &h.session,
                FlowProperties::new(h.queue.clone()).with_ack_mode(AckMode::Client),
                Arc::new(handler),
            )
            .await
            .unwrap();
        flow.start().unwrap();
        h.publish("slow").await;

        started.recv().await.unwrap();
        h.session.close().await;

        assert_eq!(outcome.try_recv().ok(), Some(AckStatus::Acknowledged));
        assert_eq!(h.broker.flows_released(), 1);
        assert_eq!(h.broker.queue_depth("Q1"), Some(0));

        assert!(flow.is_closed());
        assert_eq!(flow.state(), FlowState::Closed);
        assert!(matches!(flow.start(), Err(FlowError::Closed)));
        assert!(consumer.live_flows().is_empty());

        consumer.close_all().await;
        drop(flow);
        assert_eq!(h.broker.flows_released(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_closes_all_wait_for_drain() {
        let h = Harness::new().await;
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let handler = Blocking {
            started: started_tx,
            finished: Arc::clone(&finished),
            hold: Duration::from_millis(100),
        };
        let flow = FlowConsumer::new()
            .bind(&h.session, FlowProperties::new(h.queue.clone()), Arc::new(handler))
            .await
            .unwrap();
        flow.start().unwrap();
        h.publish("slow").await;
        started.recv().await.unwrap();

        let first = async {
            flow.close().await;
            finished.load(Ordering::SeqCst)
        };
        let second = async {
            tokio::task::yield_now().await;
            flow.close().await;
            finished.load(Ordering::SeqCst)
        };
        let (first_saw, second_saw) = tokio::join!(first, second);
        assert!(first_saw, "first close returned before the callback finished");
        assert!(second_saw, "second close returned before the callback finished");
        assert_eq!(h.broker.flows_released(), 1);
    }

    #[tokio::test]
    async fn test_bind_refused_without_consume_permission() {
        let h = Harness::new().await;
        let config = BrokerConfig::new("test:55555", "default", "audit", "secret");
        let manager = ConnectionManager::new(h.broker.clone());
        let other = manager.connect(&config).await.unwrap();
        let locked = EndpointProvisioner::new()
            .provision_queue(
                &h.session,
                "LOCKED",
                EndpointProperties::consume().with_permission(Permission::ReadOnly),
            )
            .await
            .unwrap();

        let (handler, _rx) = forward();
        let err = FlowConsumer::new()
            .bind(&other, FlowProperties::new(locked.clone()), Arc::clone(&handler))
            .await
            .unwrap_err();
        assert!(matches!(err, BindError::Rejected { .. }));

        let owned = FlowConsumer::new()
            .bind(&h.session, FlowProperties::new(locked), handler)
            .await
            .unwrap();
        owned.close().await;
    }

    /// Closes its own flow from inside the callback.
    struct SelfClosing {
        flow: Arc<OnceLock<Flow>>,
        done: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl MessageHandler for SelfClosing {
        async fn on_message(&self, _message: &DeliveredMessage) -> Result<(), HandlerError> {
            if let Some(flow) = self.flow.get() {
                flow.close().await;
            }
            let _ = self.done.send(());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_from_own_callback_does_not_deadlock() {
        let h = Harness::new().await;
        let slot = Arc::new(OnceLock::new());
        let (done_tx, mut done) = mpsc::unbounded_channel();
        let handler = SelfClosing {
            flow: Arc::clone(&slot),
            done: done_tx,
        };
        let flow = FlowConsumer::new()
            .bind(&h.session, FlowProperties::new(h.queue.clone()), Arc::new(handler))
            .await
            .unwrap();
        flow.start().unwrap();
        slot.set(flow).unwrap();

        h.publish("close me").await;
        tokio::time::timeout(Duration::from_secs(2), done.recv())
            .await
            .expect("callback deadlocked")
            .unwrap();

        let flow = slot.get().unwrap();
        assert!(flow.is_closed());
        assert!(matches!(flow.start(), Err(FlowError::Closed)));
        assert_eq!(h.broker.flows_released(), 1);
    }

    #[tokio::test]
    async fn test_close_all_and_drop_release_once() {
        let h = Harness::new().await;
        let consumer = FlowConsumer::new();
        let te = EndpointProvisioner::new()
            .provision_topic_endpoint(&h.session, "TE1", "ek/tx", EndpointProperties::consume())
            .await
            .unwrap();

        let (handler, _rx) = forward();
        let queue_flow = consumer
            .bind(&h.session, FlowProperties::new(h.queue.clone()), Arc::clone(&handler))
            .await
            .unwrap();
        let te_flow = consumer
            .bind(&h.session, FlowProperties::new(te), handler)
            .await
            .unwrap();
        assert_eq!(h.broker.topic_endpoint_subscription("TE1").as_deref(), Some("ek/tx"));

        consumer.close_all().await;
        assert!(queue_flow.is_closed() && te_flow.is_closed());
        assert_eq!(h.broker.flows_released(), 2);

        drop(queue_flow);
        drop(te_flow);
        assert_eq!(h.broker.flows_released(), 2);
    }
}
