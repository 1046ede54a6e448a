//! Broker-advertised capabilities.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

/// A broker feature the client depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Persistent publishing with broker acknowledgement.
    GuaranteedPublish,
    /// Guaranteed consumer flows bound to endpoints.
    GuaranteedSubscribeFlow,
    /// Client-side provisioning of queues and topic endpoints.
    EndpointManagement,
    /// Topic subscriptions attached to queues.
    QueueSubscriptions,
}

impl Capability {
    /// Every capability the client requires from a session.
    pub const REQUIRED: [Self; 4] = [
        Self::GuaranteedPublish,
        Self::GuaranteedSubscribeFlow,
        Self::EndpointManagement,
        Self::QueueSubscriptions,
    ];

    /// Broker-facing name of the capability.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GuaranteedPublish => "PUB_GUARANTEED",
            Self::GuaranteedSubscribeFlow => "SUB_FLOW_GUARANTEED",
            Self::EndpointManagement => "ENDPOINT_MANAGEMENT",
            Self::QueueSubscriptions => "QUEUE_SUBSCRIPTIONS",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of capabilities, ordered for stable reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The full set of required capabilities.
    #[must_use]
    pub fn required() -> Self {
        Capability::REQUIRED.into_iter().collect()
    }

    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn remove(&mut self, capability: Capability) -> bool {
        self.0.remove(&capability)
    }

    /// Capabilities in `self` that `advertised` lacks.
    #[must_use]
    pub fn missing_from(&self, advertised: &Self) -> Self {
        self.0.difference(&advertised.0).copied().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|c| c.as_str()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}
