//! Error taxonomy of the broker client.
//!
//! Every failure path maps to one discriminable kind. Setup-time kinds
//! (connection, capability, provisioning, binding) are fatal to the startup
//! path that hit them; publish and handler failures are recoverable.

use thiserror::Error;

use crate::{capability::CapabilitySet, message::CorrelationKey};

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),
    #[error("Invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Properties error: {0}")]
    Properties(#[from] java_properties::PropertiesError),
    #[error("Invalid configuration format: {0}")]
    Format(#[from] figment::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The broker could not be reached or refused the client.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("exhausted retries after {attempts} connection attempts: {last_cause}")]
    ExhaustedRetries { attempts: u32, last_cause: String },
    #[error("authentication rejected: {0}")]
    Authentication(String),
    #[error("a session is already active on this connection manager")]
    AlreadyActive,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// The connected broker lacks capabilities the client depends on.
#[derive(Debug, Error)]
#[error("missing required capabilities: {missing}")]
pub struct CapabilityError {
    pub missing: CapabilitySet,
}

/// Failure of `ConnectionManager::connect`.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

/// Endpoint provisioning was rejected.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("provisioning of '{endpoint}' rejected: {reason}")]
    Rejected { endpoint: String, reason: String },
    #[error("session is not connected")]
    NotConnected,
}

/// A consumer flow could not be bound.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("bind to '{endpoint}' rejected: {reason}")]
    Rejected { endpoint: String, reason: String },
    #[error("endpoint '{0}' does not exist")]
    UnknownEndpoint(String),
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    #[error("session is not connected")]
    NotConnected,
}

/// Lifecycle operation on a bound flow failed.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow is closed")]
    Closed,
    #[error("session is not connected")]
    NotConnected,
}

/// A publish was refused synchronously; no confirmation callback will fire.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("session is not connected")]
    NotConnected,
    #[error("publisher is closed")]
    Closed,
    #[error("correlation key '{0}' is already outstanding")]
    DuplicateKey(CorrelationKey),
    #[error("publish rejected: {0}")]
    Rejected(String),
}

/// Error returned by a message handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<&str> for HandlerError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

/// Any client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),
    #[error("Provision error: {0}")]
    Provision(#[from] ProvisionError),
    #[error("Bind error: {0}")]
    Bind(#[from] BindError),
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

impl From<ConnectError> for ClientError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Connection(e) => Self::Connection(e),
            ConnectError::Capability(e) => Self::Capability(e),
        }
    }
}

impl ClientError {
    /// Whether the error must abort application startup.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::Publish(_) | Self::Flow(_))
    }

    /// Process exit code for a fatal error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Capability(_) => 1,
            Self::Config(_) => 78,
            _ => 2,
        }
    }
}
