//! Core abstractions for a guaranteed-messaging broker client.
//!
//! This crate provides the fundamental building blocks:
//! - `MessagingConfig` - Explicit connection and endpoint configuration
//! - `EventStore` - Broadcast + history of session events
//! - Message, endpoint and capability types
//! - Transport traits the session and flow layers are written against
//! - The client error taxonomy

pub mod capability;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event_store;
pub mod message;
pub mod traits;

pub use capability::{Capability, CapabilitySet};
pub use config::{AckMode, BrokerConfig, ChannelProperties, EndpointConfig, MessagingConfig, Retries};
pub use endpoint::{AccessType, EndpointDescriptor, EndpointKind, EndpointProperties, Permission};
pub use error::{
    BindError, CapabilityError, ClientError, ConfigError, ConnectError, ConnectionError,
    FlowError, HandlerError, ProvisionError, PublishError,
};
pub use event_store::{EventStore, SessionEvent, SessionEventHandler, SessionEventKind};
pub use message::{CorrelationKey, Destination, InboundMessage, OutboundMessage, PropertyValue, Properties};
pub use traits::{
    BrokerLink, Confirmation, Delivery, DeliverySink, FlowRequest, LinkEvent, Transport,
    TransportError, TransportFlow, TransportProducer,
};
