//! Endpoint provisioning, consumer flows and correlated publishing.
//!
//! Provides:
//! - `EndpointProvisioner` - idempotent queue / topic endpoint creation
//! - `FlowConsumer` - binds consumer flows with an explicit ack mode
//! - `CorrelatingPublisher` - guaranteed publish with per-key confirmation
//! - Handler traits the application implements

pub mod consumer;
pub mod handlers;
pub mod provision;
pub mod publisher;

pub use consumer::{AckStatus, DeliveredMessage, Flow, FlowConsumer, FlowProperties, FlowState, FlowStats};
pub use handlers::{FnMessageHandler, LoggingPublishHandler, MessageHandler, PublishEventHandler};
pub use provision::{EndpointProvisioner, ProvisionFlags};
pub use publisher::CorrelatingPublisher;
