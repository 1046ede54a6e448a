//! Transport traits.
//!
//! The client never builds wire frames itself. Everything it asks of a
//! broker goes through these traits, implemented by a transport backend.

use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    AckMode, BrokerConfig, CapabilitySet, CorrelationKey, Destination, EndpointDescriptor,
    EndpointKind, InboundMessage, OutboundMessage,
};

/// Transport error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Host unreachable: {0}")]
    Unreachable(String),
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected: {0}")]
    Rejected(String),
    #[error("Invalid selector: {0}")]
    InvalidSelector(String),
    #[error("Closed")]
    Closed,
}

/// Link-level notification pushed to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The connection dropped; the link can be reconnected.
    Down { cause: String },
}

/// Broker confirmation for one correlated publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack {
        key: CorrelationKey,
    },
    Nack {
        key: CorrelationKey,
        cause: String,
        timestamp: SystemTime,
    },
}

impl Confirmation {
    #[must_use]
    pub const fn key(&self) -> &CorrelationKey {
        match self {
            Self::Ack { key } | Self::Nack { key, .. } => key,
        }
    }
}

/// Consumer flow bind request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRequest {
    pub endpoint: EndpointDescriptor,
    pub ack_mode: AckMode,
    pub selector: Option<String>,
    /// Topic subscription to attach to a topic endpoint.
    pub new_subscription: Option<String>,
}

/// Outcome of handing one message to a delivery sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The consumer took the message.
    Accepted,
    /// The consumer is shutting down; the broker keeps the message.
    Declined,
}

/// Receives messages from a transport flow, one at a time, in broker order.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, message: InboundMessage) -> Delivery;
}

/// Broker-side handle of a bound consumer flow.
pub trait TransportFlow: Send + Sync {
    /// Begin delivering messages to the sink.
    ///
    /// # Errors
    /// Returns error if the flow is closed.
    fn start(&self) -> Result<(), TransportError>;

    /// Pause delivery.
    fn stop(&self);

    /// Acknowledge a message delivered under client ack mode.
    ///
    /// # Errors
    /// Returns error if the message is no longer outstanding on this flow.
    fn ack(&self, message_id: u64) -> Result<(), TransportError>;

    /// Unbind and release broker-side resources.
    fn close(&self);
}

/// Broker-side handle of a publisher.
#[async_trait]
pub trait TransportProducer: Send + Sync {
    /// Send one guaranteed message; its confirmation arrives asynchronously.
    async fn send(
        &self,
        destination: &Destination,
        message: OutboundMessage,
        key: CorrelationKey,
    ) -> Result<(), TransportError>;

    /// Stop accepting sends and close the confirmation channel.
    fn close(&self);
}

/// One authenticated connection to a broker.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Capabilities the broker advertised for this connection.
    fn capabilities(&self) -> CapabilitySet;

    fn is_connected(&self) -> bool;

    /// Re-establish a dropped connection against `host`.
    async fn reconnect(&self, host: &str) -> Result<(), TransportError>;

    /// Create an endpoint. Reports `AlreadyExists` for an identical endpoint.
    async fn provision(&self, endpoint: &EndpointDescriptor) -> Result<(), TransportError>;

    async fn deprovision(&self, kind: EndpointKind, name: &str) -> Result<(), TransportError>;

    /// Attract messages published on `topic` into `queue`.
    async fn add_subscription(&self, queue: &str, topic: &str) -> Result<(), TransportError>;

    async fn remove_subscription(&self, queue: &str, topic: &str) -> Result<(), TransportError>;

    /// Bind a consumer flow; the flow is created stopped.
    async fn create_flow(
        &self,
        request: FlowRequest,
        sink: Arc<dyn DeliverySink>,
    ) -> Result<Arc<dyn TransportFlow>, TransportError>;

    /// Open a producer whose confirmations are sent to `confirmations`.
    async fn open_producer(
        &self,
        confirmations: mpsc::UnboundedSender<Confirmation>,
    ) -> Result<Arc<dyn TransportProducer>, TransportError>;

    /// Close the connection and every flow and producer opened on it.
    fn close(&self);
}

/// Factory of broker links.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Make a single connection attempt to `host`.
    async fn connect(
        &self,
        host: &str,
        config: &BrokerConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn BrokerLink>, TransportError>;
}
