//! Endpoint descriptors and provisioning properties.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of guaranteed-messaging endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Queue,
    TopicEndpoint,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("queue"),
            Self::TopicEndpoint => f.write_str("topic endpoint"),
        }
    }
}

/// Permission granted to clients other than the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    None,
    ReadOnly,
    #[default]
    Consume,
    ModifyTopic,
    Delete,
}

impl Permission {
    /// Whether clients other than the owner may bind consumer flows.
    #[must_use]
    pub const fn allows_consume(self) -> bool {
        !matches!(self, Self::None | Self::ReadOnly)
    }

    /// Whether clients other than the owner may deprovision the endpoint.
    #[must_use]
    pub const fn allows_delete(self) -> bool {
        matches!(self, Self::Delete)
    }
}

/// How many flows may consume from an endpoint at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    #[default]
    Exclusive,
    NonExclusive,
}

/// Properties requested when provisioning an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct EndpointProperties {
    pub permission: Permission,
    pub access_type: AccessType,
    /// Spool quota in messages; `None` means unbounded.
    pub max_messages: Option<usize>,
}

impl EndpointProperties {
    /// Consume permission, exclusive access.
    #[must_use]
    pub fn consume() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    #[must_use]
    pub const fn with_access_type(mut self, access_type: AccessType) -> Self {
        self.access_type = access_type;
        self
    }

    #[must_use]
    pub const fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = Some(max_messages);
        self
    }
}

/// Identifies a provisioned queue or durable topic endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub kind: EndpointKind,
    pub name: String,
    /// Topic a topic endpoint subscribes to.
    pub topic: Option<String>,
    pub properties: EndpointProperties,
}

impl EndpointDescriptor {
    #[must_use]
    pub fn queue(name: impl Into<String>, properties: EndpointProperties) -> Self {
        Self {
            kind: EndpointKind::Queue,
            name: name.into(),
            topic: None,
            properties,
        }
    }

    #[must_use]
    pub fn topic_endpoint(
        name: impl Into<String>,
        topic: impl Into<String>,
        properties: EndpointProperties,
    ) -> Self {
        Self {
            kind: EndpointKind::TopicEndpoint,
            name: name.into(),
            topic: Some(topic.into()),
            properties,
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}
