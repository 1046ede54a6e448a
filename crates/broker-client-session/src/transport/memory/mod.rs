//! In-memory broker transport.
//!
//! Useful for development, tests and single-process demos. Endpoints,
//! spools and subscriptions live in process memory and are lost on drop.
//! The broker can be told to refuse connections or to drop every link, which
//! is how reconnect behaviour is exercised without a network.

mod selector;
mod topic;

pub use selector::{Selector, SelectorError};
pub use topic::{is_valid_subscription, is_valid_topic, matches as topic_matches};

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::SystemTime,
};

use async_trait::async_trait;
use broker_client_core::{
    AccessType, AckMode, BrokerConfig, CapabilitySet, CorrelationKey, Destination, EndpointDescriptor,
    EndpointKind, EndpointProperties, InboundMessage, OutboundMessage, Properties,
    traits::{
        BrokerLink, Confirmation, Delivery, DeliverySink, FlowRequest, LinkEvent, Transport,
        TransportError, TransportFlow, TransportProducer,
    },
};
use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

const MAX_NAME_LEN: usize = 200;

type EndpointKey = (EndpointKind, String);

#[derive(Debug, Clone)]
struct Spooled {
    id: u64,
    destination: Destination,
    payload: Bytes,
    properties: Properties,
    redelivered: bool,
}

impl Spooled {
    fn to_inbound(&self) -> InboundMessage {
        InboundMessage {
            message_id: self.id,
            destination: self.destination.clone(),
            payload: self.payload.clone(),
            properties: self.properties.clone(),
            redelivered: self.redelivered,
        }
    }
}

#[derive(Debug)]
struct Subscription {
    topic: String,
    /// Link that added the subscription; `None` for endpoint-owned ones.
    owner: Option<u64>,
}

#[derive(Debug)]
struct Endpoint {
    properties: EndpointProperties,
    /// Client username that provisioned the endpoint.
    owner: String,
    subscriptions: Vec<Subscription>,
    spool: VecDeque<Spooled>,
    /// Delivered but not yet acknowledged, keyed by message id.
    unacked: BTreeMap<u64, (u64, Spooled)>,
    /// Ids of bound flows.
    bound: Vec<u64>,
}

impl Endpoint {
    fn new(properties: EndpointProperties, owner: &str) -> Self {
        Self {
            properties,
            owner: owner.to_string(),
            subscriptions: Vec::new(),
            spool: VecDeque::new(),
            unacked: BTreeMap::new(),
            bound: Vec::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.properties
            .max_messages
            .is_some_and(|max| self.spool.len() + self.unacked.len() >= max)
    }

    /// Put every unacknowledged message of `flow_id` back at the spool front.
    fn requeue(&mut self, flow_id: u64) {
        let ids: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == flow_id)
            .map(|(id, _)| *id)
            .collect();
        for id in ids.into_iter().rev() {
            if let Some((_, mut message)) = self.unacked.remove(&id) {
                message.redelivered = true;
                self.spool.push_front(message);
            }
        }
    }
}

struct BrokerState {
    reachable: bool,
    unreachable_hosts: HashSet<String>,
    credentials: Option<(String, String)>,
    capabilities: CapabilitySet,
    endpoints: HashMap<EndpointKey, Endpoint>,
    links: Vec<Weak<MemoryLink>>,
    connect_attempts: u32,
    flows_released: u64,
}

impl BrokerState {
    fn accepts(&self, host: &str) -> Result<(), TransportError> {
        if self.reachable && !self.unreachable_hosts.contains(host) {
            Ok(())
        } else {
            Err(TransportError::Unreachable(format!("{host}: connection refused")))
        }
    }

    fn drop_link_subscriptions(&mut self, link_id: u64) {
        for endpoint in self.endpoints.values_mut() {
            endpoint.subscriptions.retain(|s| s.owner != Some(link_id));
        }
    }
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spool a published message on every matching endpoint.
    ///
    /// Returns the nack cause when the broker refuses the message.
    fn route(&self, destination: &Destination, message: &OutboundMessage) -> Result<usize, String> {
        let mut state = self.state();

        let targets: Vec<EndpointKey> = match destination {
            Destination::Queue(name) => {
                let key = (EndpointKind::Queue, name.clone());
                if !state.endpoints.contains_key(&key) {
                    return Err(format!("unknown queue '{name}'"));
                }
                vec![key]
            }
            Destination::Topic(topic) => state
                .endpoints
                .iter()
                .filter(|(_, ep)| ep.subscriptions.iter().any(|s| topic::matches(&s.topic, topic)))
                .map(|(key, _)| key.clone())
                .collect(),
        };

        if let Some((_, name)) = targets
            .iter()
            .find(|key| state.endpoints.get(*key).is_some_and(Endpoint::is_full))
        {
            return Err(format!("spool over quota for '{name}'"));
        }

        for key in &targets {
            let id = self.next_id();
            if let Some(endpoint) = state.endpoints.get_mut(key) {
                endpoint.spool.push_back(Spooled {
                    id,
                    destination: destination.clone(),
                    payload: message.payload.clone(),
                    properties: message.properties.clone(),
                    redelivered: false,
                });
            }
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(targets.len())
    }

    /// Take the next selectable message of a flow off its spool.
    ///
    /// Client-ack flows keep a copy in the unacked set until `ack`.
    fn take_next(&self, flow: &MemoryFlow) -> Option<Spooled> {
        let mut state = self.state();
        let endpoint = state.endpoints.get_mut(&flow.endpoint)?;
        let pos = endpoint.spool.iter().position(|m| {
            flow.selector
                .as_ref()
                .is_none_or(|selector| selector.matches(&m.properties))
        })?;
        let message = endpoint.spool.remove(pos)?;
        if flow.ack_mode == AckMode::Client {
            endpoint.unacked.insert(message.id, (flow.id, message.clone()));
        }
        Some(message)
    }

    /// Put a message the sink declined back at the spool front.
    fn decline(&self, flow: &MemoryFlow, message: Spooled) {
        {
            let mut state = self.state();
            let Some(endpoint) = state.endpoints.get_mut(&flow.endpoint) else {
                return;
            };
            match flow.ack_mode {
                AckMode::Auto => endpoint.spool.push_front(message),
                AckMode::Client => {
                    let owned = endpoint
                        .unacked
                        .get(&message.id)
                        .is_some_and(|(owner, _)| *owner == flow.id);
                    if owned {
                        endpoint.unacked.remove(&message.id);
                        endpoint.spool.push_front(message);
                    }
                }
            }
        }
        self.notify.notify_waiters();
    }
}

/// In-memory broker.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a reachable broker advertising every required capability.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState {
                    reachable: true,
                    unreachable_hosts: HashSet::new(),
                    credentials: None,
                    capabilities: CapabilitySet::required(),
                    endpoints: HashMap::new(),
                    links: Vec::new(),
                    connect_attempts: 0,
                    flows_released: 0,
                }),
                notify: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Only accept this username / password pair.
    #[must_use]
    pub fn with_credentials(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.inner.state().credentials = Some((username.into(), password.into()));
        self
    }

    /// Advertise this capability set to new links.
    #[must_use]
    pub fn with_capabilities(self, capabilities: CapabilitySet) -> Self {
        self.inner.state().capabilities = capabilities;
        self
    }

    /// Accept or refuse all connection attempts.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.state().reachable = reachable;
    }

    /// Accept or refuse connection attempts to one host.
    pub fn set_host_reachable(&self, host: &str, reachable: bool) {
        let mut state = self.inner.state();
        if reachable {
            state.unreachable_hosts.remove(host);
        } else {
            state.unreachable_hosts.insert(host.to_string());
        }
    }

    /// Drop every live connection, as a router restart would.
    pub fn disconnect_all(&self, cause: &str) {
        let links: Vec<Arc<MemoryLink>> = {
            let mut state = self.inner.state();
            state.links.retain(|l| l.strong_count() > 0);
            state.links.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::debug!(links = links.len(), cause, "Dropping broker connections");
        for link in links {
            link.drop_connection(cause);
        }
    }

    /// Total connection attempts seen, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.inner.state().connect_attempts
    }

    /// Number of consumer flows released so far.
    #[must_use]
    pub fn flows_released(&self) -> u64 {
        self.inner.state().flows_released
    }

    #[must_use]
    pub fn endpoint_exists(&self, kind: EndpointKind, name: &str) -> bool {
        self.inner
            .state()
            .endpoints
            .contains_key(&(kind, name.to_string()))
    }

    /// Spooled messages waiting for delivery on a queue.
    #[must_use]
    pub fn queue_depth(&self, name: &str) -> Option<usize> {
        self.depth(EndpointKind::Queue, name)
    }

    /// Spooled messages waiting for delivery on a topic endpoint.
    #[must_use]
    pub fn topic_endpoint_depth(&self, name: &str) -> Option<usize> {
        self.depth(EndpointKind::TopicEndpoint, name)
    }

    fn depth(&self, kind: EndpointKind, name: &str) -> Option<usize> {
        self.inner
            .state()
            .endpoints
            .get(&(kind, name.to_string()))
            .map(|ep| ep.spool.len())
    }

    /// Delivered but unacknowledged messages on an endpoint.
    #[must_use]
    pub fn unacked_count(&self, kind: EndpointKind, name: &str) -> Option<usize> {
        self.inner
            .state()
            .endpoints
            .get(&(kind, name.to_string()))
            .map(|ep| ep.unacked.len())
    }

    /// Topic subscriptions currently attached to a queue.
    #[must_use]
    pub fn queue_subscriptions(&self, name: &str) -> Vec<String> {
        self.inner
            .state()
            .endpoints
            .get(&(EndpointKind::Queue, name.to_string()))
            .map(|ep| ep.subscriptions.iter().map(|s| s.topic.clone()).collect())
            .unwrap_or_default()
    }

    /// Topic a topic endpoint is subscribed to.
    #[must_use]
    pub fn topic_endpoint_subscription(&self, name: &str) -> Option<String> {
        self.inner
            .state()
            .endpoints
            .get(&(EndpointKind::TopicEndpoint, name.to_string()))
            .and_then(|ep| ep.subscriptions.first().map(|s| s.topic.clone()))
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(
        &self,
        host: &str,
        config: &BrokerConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn BrokerLink>, TransportError> {
        let mut state = self.inner.state();
        state.connect_attempts += 1;
        state.accepts(host)?;

        if let Some((username, password)) = &state.credentials {
            if config.username != *username || config.password != *password {
                return Err(TransportError::Authentication(format!(
                    "client username '{}' rejected",
                    config.username
                )));
            }
        }

        let link = Arc::new(MemoryLink {
            id: self.inner.next_id(),
            username: config.username.clone(),
            broker: Arc::clone(&self.inner),
            host: Mutex::new(host.to_string()),
            status: Arc::new(LinkStatus::default()),
            events,
            flows: Mutex::new(Vec::new()),
            producers: Mutex::new(Vec::new()),
        });
        link.status.connected.store(true, Ordering::SeqCst);

        state.links.retain(|l| l.strong_count() > 0);
        state.links.push(Arc::downgrade(&link));
        tracing::debug!(link = link.id, host, vpn = %config.vpn_name, "Link connected");

        Ok(link)
    }
}

#[derive(Debug, Default)]
struct LinkStatus {
    connected: AtomicBool,
    closed: AtomicBool,
}

impl LinkStatus {
    fn check(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

struct MemoryLink {
    id: u64,
    username: String,
    broker: Arc<BrokerInner>,
    host: Mutex<String>,
    status: Arc<LinkStatus>,
    events: mpsc::UnboundedSender<LinkEvent>,
    flows: Mutex<Vec<Weak<MemoryFlow>>>,
    producers: Mutex<Vec<Weak<MemoryProducer>>>,
}

impl MemoryLink {
    fn live_flows(&self) -> Vec<Arc<MemoryFlow>> {
        let mut flows = self.flows.lock().unwrap_or_else(PoisonError::into_inner);
        flows.retain(|f| f.strong_count() > 0);
        flows.iter().filter_map(Weak::upgrade).collect()
    }

    fn drop_connection(&self, cause: &str) {
        if self.status.closed.load(Ordering::SeqCst) || !self.status.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let flows = self.live_flows();
        {
            let mut state = self.broker.state();
            state.drop_link_subscriptions(self.id);
            for flow in &flows {
                if let Some(endpoint) = state.endpoints.get_mut(&flow.endpoint) {
                    endpoint.requeue(flow.id);
                }
            }
        }
        self.broker.notify.notify_waiters();
        let _ = self.events.send(LinkEvent::Down {
            cause: cause.to_string(),
        });
    }

    fn validate_name(name: &str) -> Result<(), TransportError> {
        if name.trim().is_empty() || name.len() > MAX_NAME_LEN || name.contains(['*', '>', '#']) {
            return Err(TransportError::Rejected(format!("invalid endpoint name '{name}'")));
        }
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    fn capabilities(&self) -> CapabilitySet {
        self.broker.state().capabilities.clone()
    }

    fn is_connected(&self) -> bool {
        self.status.check().is_ok()
    }

    async fn reconnect(&self, host: &str) -> Result<(), TransportError> {
        if self.status.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        {
            let mut state = self.broker.state();
            state.connect_attempts += 1;
            state.accepts(host)?;
        }
        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = host.to_string();
        self.status.connected.store(true, Ordering::SeqCst);
        self.broker.notify.notify_waiters();
        tracing::debug!(link = self.id, host, "Link reconnected");
        Ok(())
    }

    async fn provision(&self, endpoint: &EndpointDescriptor) -> Result<(), TransportError> {
        self.status.check()?;
        Self::validate_name(&endpoint.name)?;

        let mut state = self.broker.state();
        let key = (endpoint.kind, endpoint.name.clone());
        match state.endpoints.get(&key).map(|existing| existing.properties) {
            Some(properties) if properties == endpoint.properties => {
                Err(TransportError::AlreadyExists(endpoint.name.clone()))
            }
            Some(_) => Err(TransportError::Rejected(format!(
                "endpoint property mismatch for '{}'",
                endpoint.name
            ))),
            None => {
                state
                    .endpoints
                    .insert(key, Endpoint::new(endpoint.properties, &self.username));
                tracing::debug!(kind = %endpoint.kind, name = %endpoint.name, "Endpoint provisioned");
                Ok(())
            }
        }
    }

    async fn deprovision(&self, kind: EndpointKind, name: &str) -> Result<(), TransportError> {
        self.status.check()?;
        let mut state = self.broker.state();
        let key = (kind, name.to_string());
        let status = state.endpoints.get(&key).map(|endpoint| {
            let permitted =
                endpoint.owner == self.username || endpoint.properties.permission.allows_delete();
            (permitted, endpoint.bound.is_empty())
        });
        match status {
            None => Err(TransportError::NotFound(name.to_string())),
            Some((false, _)) => Err(TransportError::Rejected(format!(
                "permission denied to delete '{name}'"
            ))),
            Some((true, false)) => Err(TransportError::Rejected(format!(
                "endpoint '{name}' has bound flows"
            ))),
            Some((true, true)) => {
                state.endpoints.remove(&key);
                Ok(())
            }
        }
    }

    async fn add_subscription(&self, queue: &str, topic: &str) -> Result<(), TransportError> {
        self.status.check()?;
        if !topic::is_valid_subscription(topic) {
            return Err(TransportError::Rejected(format!("invalid subscription '{topic}'")));
        }
        let mut state = self.broker.state();
        let endpoint = state
            .endpoints
            .get_mut(&(EndpointKind::Queue, queue.to_string()))
            .ok_or_else(|| TransportError::NotFound(queue.to_string()))?;
        if !endpoint.subscriptions.iter().any(|s| s.topic == topic) {
            endpoint.subscriptions.push(Subscription {
                topic: topic.to_string(),
                owner: Some(self.id),
            });
        }
        Ok(())
    }

    async fn remove_subscription(&self, queue: &str, topic: &str) -> Result<(), TransportError> {
        self.status.check()?;
        let mut state = self.broker.state();
        let endpoint = state
            .endpoints
            .get_mut(&(EndpointKind::Queue, queue.to_string()))
            .ok_or_else(|| TransportError::NotFound(queue.to_string()))?;
        let before = endpoint.subscriptions.len();
        endpoint.subscriptions.retain(|s| s.topic != topic);
        if endpoint.subscriptions.len() == before {
            return Err(TransportError::NotFound(format!("subscription '{topic}'")));
        }
        Ok(())
    }

    async fn create_flow(
        &self,
        request: FlowRequest,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<dyn TransportFlow>, TransportError> {
        self.status.check()?;

        let selector = request
            .selector
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(Selector::parse)
            .transpose()
            .map_err(|e| TransportError::InvalidSelector(e.to_string()))?;

        let name = request.endpoint.name.clone();
        let key = (request.endpoint.kind, name.clone());
        let flow_id = self.broker.next_id();
        {
            let mut state = self.broker.state();
            let endpoint = state
                .endpoints
                .get_mut(&key)
                .ok_or_else(|| TransportError::NotFound(name.clone()))?;

            if endpoint.owner != self.username && !endpoint.properties.permission.allows_consume() {
                return Err(TransportError::Rejected(format!(
                    "permission denied to consume from '{name}'"
                )));
            }
            if endpoint.properties.access_type == AccessType::Exclusive
                && !endpoint.bound.is_empty()
            {
                return Err(TransportError::Rejected(format!(
                    "exclusive endpoint '{name}' already has a bound flow"
                )));
            }

            if let Some(topic) = &request.new_subscription {
                if request.endpoint.kind != EndpointKind::TopicEndpoint {
                    return Err(TransportError::Rejected(
                        "subscriptions can only be attached to topic endpoints".to_string(),
                    ));
                }
                if !topic::is_valid_subscription(topic) {
                    return Err(TransportError::Rejected(format!("invalid subscription '{topic}'")));
                }
                let current = endpoint.subscriptions.first().map(|s| s.topic.as_str());
                if current != Some(topic.as_str()) {
                    // Changing a topic endpoint's subscription discards its spool.
                    endpoint.spool.clear();
                    endpoint.subscriptions = vec![Subscription {
                        topic: topic.clone(),
                        owner: None,
                    }];
                }
            }

            endpoint.bound.push(flow_id);
        }

        let flow = Arc::new(MemoryFlow {
            id: flow_id,
            endpoint: key,
            ack_mode: request.ack_mode,
            selector,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            link: Arc::clone(&self.status),
            broker: Arc::clone(&self.broker),
        });
        self.flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&flow));

        tokio::spawn(run_flow(Arc::clone(&flow), sink));
        tracing::debug!(flow = flow_id, endpoint = %name, ack_mode = %request.ack_mode, "Flow bound");

        Ok(flow)
    }

    async fn open_producer(
        &self,
        confirmations: mpsc::UnboundedSender<Confirmation>,
    ) -> Result<Arc<dyn TransportProducer>, TransportError> {
        self.status.check()?;
        let producer = Arc::new(MemoryProducer {
            link: Arc::clone(&self.status),
            broker: Arc::clone(&self.broker),
            confirmations: Mutex::new(Some(confirmations)),
        });
        self.producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&producer));
        Ok(producer)
    }

    fn close(&self) {
        if self.status.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.connected.store(false, Ordering::SeqCst);

        for flow in self.live_flows() {
            flow.close();
        }
        let producers: Vec<Arc<MemoryProducer>> = self
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|p| p.upgrade())
            .collect();
        for producer in producers {
            producer.close();
        }

        self.broker.state().drop_link_subscriptions(self.id);
        self.broker.notify.notify_waiters();
        tracing::debug!(link = self.id, "Link closed");
    }
}

struct MemoryFlow {
    id: u64,
    endpoint: EndpointKey,
    ack_mode: AckMode,
    selector: Option<Selector>,
    started: AtomicBool,
    closed: AtomicBool,
    link: Arc<LinkStatus>,
    broker: Arc<BrokerInner>,
}

impl MemoryFlow {
    fn is_finished(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.link.closed.load(Ordering::SeqCst)
    }

    fn is_active(&self) -> bool {
        self.started.load(Ordering::SeqCst) && self.link.connected.load(Ordering::SeqCst)
    }
}

impl TransportFlow for MemoryFlow {
    fn start(&self) -> Result<(), TransportError> {
        if self.is_finished() {
            return Err(TransportError::Closed);
        }
        self.started.store(true, Ordering::SeqCst);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    fn ack(&self, message_id: u64) -> Result<(), TransportError> {
        let mut state = self.broker.state();
        let endpoint = state
            .endpoints
            .get_mut(&self.endpoint)
            .ok_or_else(|| TransportError::NotFound(self.endpoint.1.clone()))?;
        let owned = endpoint
            .unacked
            .get(&message_id)
            .is_some_and(|(owner, _)| *owner == self.id);
        if !owned {
            return Err(TransportError::NotFound(format!("message {message_id}")));
        }
        endpoint.unacked.remove(&message_id);
        drop(state);
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.broker.state();
            if let Some(endpoint) = state.endpoints.get_mut(&self.endpoint) {
                endpoint.requeue(self.id);
                endpoint.bound.retain(|id| *id != self.id);
            }
            state.flows_released += 1;
        }
        self.broker.notify.notify_waiters();
        tracing::debug!(flow = self.id, "Flow released");
    }
}

/// Delivery task of one flow: one message at a time, in spool order.
async fn run_flow(flow: Arc<MemoryFlow>, sink: Arc<dyn DeliverySink>) {
    loop {
        let notified = flow.broker.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if flow.is_finished() {
            break;
        }

        let next = if flow.is_active() {
            flow.broker.take_next(&flow)
        } else {
            None
        };
        let Some(message) = next else {
            notified.await;
            continue;
        };

        if sink.deliver(message.to_inbound()).await == Delivery::Declined {
            flow.broker.decline(&flow, message);
        }
    }
}

struct MemoryProducer {
    link: Arc<LinkStatus>,
    broker: Arc<BrokerInner>,
    confirmations: Mutex<Option<mpsc::UnboundedSender<Confirmation>>>,
}

#[async_trait]
impl TransportProducer for MemoryProducer {
    async fn send(
        &self,
        destination: &Destination,
        message: OutboundMessage,
        key: CorrelationKey,
    ) -> Result<(), TransportError> {
        let tx = self
            .confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(TransportError::Closed)?;
        self.link.check()?;
        if let Destination::Topic(topic) = destination {
            if !topic::is_valid_topic(topic) {
                return Err(TransportError::Rejected(format!("invalid topic '{topic}'")));
            }
        }

        let confirmation = match self.broker.route(destination, &message) {
            Ok(_) => Confirmation::Ack { key },
            Err(cause) => Confirmation::Nack {
                key,
                cause,
                timestamp: SystemTime::now(),
            },
        };
        let _ = tx.send(confirmation);
        Ok(())
    }

    fn close(&self) {
        self.confirmations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
