//! Endpoint provisioning.
//!
//! Every call makes exactly one attempt against the broker. Retrying is the
//! caller's decision.

use broker_client_core::{
    EndpointDescriptor, EndpointKind, EndpointProperties, ProvisionError,
    traits::TransportError,
};
use broker_client_session::Session;

/// How provisioning treats endpoints that already exist or are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionFlags {
    /// Succeed when the endpoint already exists with identical properties.
    pub ignore_exists: bool,
    /// Succeed when deprovisioning an endpoint that does not exist.
    pub ignore_missing: bool,
}

impl Default for ProvisionFlags {
    fn default() -> Self {
        Self {
            ignore_exists: true,
            ignore_missing: true,
        }
    }
}

impl ProvisionFlags {
    /// Report existing and missing endpoints as errors.
    #[must_use]
    pub const fn strict() -> Self {
        Self {
            ignore_exists: false,
            ignore_missing: false,
        }
    }

    #[must_use]
    pub const fn with_ignore_exists(mut self, ignore: bool) -> Self {
        self.ignore_exists = ignore;
        self
    }

    #[must_use]
    pub const fn with_ignore_missing(mut self, ignore: bool) -> Self {
        self.ignore_missing = ignore;
        self
    }
}

/// Creates broker endpoints.
#[derive(Debug, Clone, Default)]
pub struct EndpointProvisioner {
    flags: ProvisionFlags,
}

impl EndpointProvisioner {
    /// Create a provisioner that ignores already-existing endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_flags(flags: ProvisionFlags) -> Self {
        Self { flags }
    }

    #[must_use]
    pub const fn flags(&self) -> ProvisionFlags {
        self.flags
    }

    /// Provision a durable queue.
    ///
    /// # Errors
    /// Returns error if the broker rejects the queue or the session is down.
    pub async fn provision_queue(
        &self,
        session: &Session,
        name: &str,
        properties: EndpointProperties,
    ) -> Result<EndpointDescriptor, ProvisionError> {
        self.provision(session, EndpointDescriptor::queue(name, properties))
            .await
    }

    /// Provision a durable topic endpoint attracting `topic`.
    ///
    /// # Errors
    /// Returns error if the broker rejects the endpoint or the session is down.
    pub async fn provision_topic_endpoint(
        &self,
        session: &Session,
        name: &str,
        topic: &str,
        properties: EndpointProperties,
    ) -> Result<EndpointDescriptor, ProvisionError> {
        self.provision(
            session,
            EndpointDescriptor::topic_endpoint(name, topic, properties),
        )
        .await
    }

    /// Provision an endpoint from a descriptor.
    ///
    /// # Errors
    /// Returns error if the broker rejects the endpoint or the session is down.
    pub async fn provision(
        &self,
        session: &Session,
        descriptor: EndpointDescriptor,
    ) -> Result<EndpointDescriptor, ProvisionError> {
        match session.link().provision(&descriptor).await {
            Ok(()) => {
                tracing::info!(endpoint = %descriptor, "Endpoint provisioned");
                Ok(descriptor)
            }
            Err(TransportError::AlreadyExists(_)) if self.flags.ignore_exists => {
                tracing::debug!(endpoint = %descriptor, "Endpoint already exists");
                Ok(descriptor)
            }
            Err(e) => Err(rejected(&descriptor.name, e)),
        }
    }

    /// Remove an endpoint.
    ///
    /// # Errors
    /// Returns error if the broker refuses, or the endpoint is missing and
    /// `ignore_missing` is off.
    pub async fn deprovision(
        &self,
        session: &Session,
        descriptor: &EndpointDescriptor,
    ) -> Result<(), ProvisionError> {
        match session
            .link()
            .deprovision(descriptor.kind, &descriptor.name)
            .await
        {
            Ok(()) => {
                tracing::info!(endpoint = %descriptor, "Endpoint deprovisioned");
                Ok(())
            }
            Err(TransportError::NotFound(_)) if self.flags.ignore_missing => Ok(()),
            Err(e) => Err(rejected(&descriptor.name, e)),
        }
    }

    /// Add a topic subscription to a queue.
    ///
    /// The subscription is recorded on the session and reapplied after a
    /// reconnect when the session is configured to do so.
    ///
    /// # Errors
    /// Returns error if the endpoint is not a queue or the broker refuses.
    pub async fn subscribe_queue(
        &self,
        session: &Session,
        queue: &EndpointDescriptor,
        topic: &str,
    ) -> Result<(), ProvisionError> {
        ensure_queue(queue)?;
        session
            .link()
            .add_subscription(&queue.name, topic)
            .await
            .map_err(|e| rejected(&queue.name, e))?;
        session.record_subscription(&queue.name, topic);
        tracing::info!(queue = %queue.name, topic, "Queue subscription added");
        Ok(())
    }

    /// Remove a topic subscription from a queue.
    ///
    /// # Errors
    /// Returns error if the endpoint is not a queue or the broker refuses.
    pub async fn unsubscribe_queue(
        &self,
        session: &Session,
        queue: &EndpointDescriptor,
        topic: &str,
    ) -> Result<(), ProvisionError> {
        ensure_queue(queue)?;
        session.forget_subscription(&queue.name, topic);
        match session.link().remove_subscription(&queue.name, topic).await {
            Ok(()) => Ok(()),
            Err(TransportError::NotFound(_)) if self.flags.ignore_missing => Ok(()),
            Err(e) => Err(rejected(&queue.name, e)),
        }
    }
}

fn ensure_queue(descriptor: &EndpointDescriptor) -> Result<(), ProvisionError> {
    if descriptor.kind == EndpointKind::Queue {
        Ok(())
    } else {
        Err(ProvisionError::Rejected {
            endpoint: descriptor.name.clone(),
            reason: "topic subscriptions can only be added to queues".to_string(),
        })
    }
}

fn rejected(endpoint: &str, error: TransportError) -> ProvisionError {
    match error {
        TransportError::NotConnected | TransportError::Closed => ProvisionError::NotConnected,
        other => ProvisionError::Rejected {
            endpoint: endpoint.to_string(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use broker_client_core::{AccessType, BrokerConfig, ChannelProperties};
    use broker_client_session::{ConnectionManager, transport::MemoryBroker};

    use super::*;

    async fn session(broker: &MemoryBroker) -> (ConnectionManager<MemoryBroker>, Session) {
        let manager = ConnectionManager::new(broker.clone());
        let config = BrokerConfig::new("test:55555", "default", "app", "secret")
            .with_channel(ChannelProperties {
                reconnect_retry_wait_ms: 5,
                ..ChannelProperties::default()
            });
        let session = manager.connect(&config).await.unwrap();
        (manager, session)
    }

    #[tokio::test]
    async fn test_provision_queue_is_idempotent() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;
        let provisioner = EndpointProvisioner::new();

        let first = provisioner
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap();
        let second = provisioner
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(broker.endpoint_exists(EndpointKind::Queue, "Q1"));
    }

    #[tokio::test]
    async fn test_strict_flags_report_existing() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;
        let provisioner = EndpointProvisioner::with_flags(ProvisionFlags::strict());

        provisioner
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap();
        let err = provisioner
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Rejected { endpoint, .. } if endpoint == "Q1"));
    }

    #[tokio::test]
    async fn test_rejections_are_reported() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;
        let provisioner = EndpointProvisioner::new();

        let err = provisioner
            .provision_queue(&session, "", EndpointProperties::consume())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Rejected { .. }));

        provisioner
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap();
        let mismatch = EndpointProperties::consume().with_access_type(AccessType::NonExclusive);
        let err = provisioner
            .provision_queue(&session, "Q1", mismatch)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"), "{err}");
    }

    #[tokio::test]
    async fn test_provision_topic_endpoint_keeps_topic() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;

        let descriptor = EndpointProvisioner::new()
            .provision_topic_endpoint(&session, "TE1", "ek/tx/new", EndpointProperties::consume())
            .await
            .unwrap();
        assert_eq!(descriptor.kind, EndpointKind::TopicEndpoint);
        assert_eq!(descriptor.topic.as_deref(), Some("ek/tx/new"));
        assert!(broker.endpoint_exists(EndpointKind::TopicEndpoint, "TE1"));
    }

    #[tokio::test]
    async fn test_queue_subscriptions_are_recorded() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;
        let provisioner = EndpointProvisioner::new();
        let queue = provisioner
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap();

        provisioner
            .subscribe_queue(&session, &queue, "ek/tx/>")
            .await
            .unwrap();
        assert_eq!(session.subscriptions(), vec![("Q1".to_string(), "ek/tx/>".to_string())]);
        assert_eq!(broker.queue_subscriptions("Q1"), vec!["ek/tx/>".to_string()]);

        provisioner
            .unsubscribe_queue(&session, &queue, "ek/tx/>")
            .await
            .unwrap();
        assert!(session.subscriptions().is_empty());
        assert!(broker.queue_subscriptions("Q1").is_empty());
    }

    #[tokio::test]
    async fn test_deprovision_ignores_missing() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;
        let queue = EndpointDescriptor::queue("Q1", EndpointProperties::consume());

        tokio_test::assert_ok!(EndpointProvisioner::new().deprovision(&session, &queue).await);
        tokio_test::assert_err!(
            EndpointProvisioner::with_flags(ProvisionFlags::strict())
                .deprovision(&session, &queue)
                .await
        );
    }

    #[tokio::test]
    async fn test_closed_session_is_not_connected() {
        let broker = MemoryBroker::new();
        let (_manager, session) = session(&broker).await;
        session.close().await;

        let err = EndpointProvisioner::new()
            .provision_queue(&session, "Q1", EndpointProperties::consume())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::NotConnected));
    }
}
