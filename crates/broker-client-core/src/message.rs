//! Messages, destinations and correlation keys.

use std::{collections::BTreeMap, fmt};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User property value carried in message metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::String(s) => write!(f, "'{s}'"),
        }
    }
}

/// User properties keyed by name.
pub type Properties = BTreeMap<String, PropertyValue>;

/// Where a message is published to, or where it was delivered from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Destination {
    Topic(String),
    Queue(String),
}

impl Destination {
    #[must_use]
    pub fn topic(name: impl Into<String>) -> Self {
        Self::Topic(name.into())
    }

    #[must_use]
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue(name.into())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Topic(name) | Self::Queue(name) => name,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Topic(name) => write!(f, "topic '{name}'"),
            Self::Queue(name) => write!(f, "queue '{name}'"),
        }
    }
}

/// Message handed to a publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub properties: Properties,
}

impl OutboundMessage {
    /// Create a guaranteed message with the given payload.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: Properties::new(),
        }
    }

    /// Attach a user property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

/// Message delivered to a consumer flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned id, used for acknowledgement.
    pub message_id: u64,
    /// Destination the message was published to.
    pub destination: Destination,
    pub payload: Bytes,
    pub properties: Properties,
    /// Set when the broker delivered this message before without an ack.
    pub redelivered: bool,
}

impl InboundMessage {
    /// Payload as UTF-8, if it is valid.
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}

/// Caller-assigned token matching a publish to its confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// A fresh random key.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for CorrelationKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
