//! Callback traits for consumers and publishers.

use std::{fmt, time::SystemTime};

use async_trait::async_trait;
use broker_client_core::{CorrelationKey, HandlerError};

use crate::consumer::DeliveredMessage;

/// Receives messages delivered on a consumer flow.
///
/// Calls for one flow never overlap. An error or panic is logged and
/// counted; the flow keeps delivering.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, message: &DeliveredMessage) -> Result<(), HandlerError>;
}

/// Message handler backed by a synchronous closure.
pub struct FnMessageHandler<F>(F);

impl<F> FnMessageHandler<F>
where
    F: Fn(&DeliveredMessage) -> Result<(), HandlerError> + Send + Sync,
{
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> fmt::Debug for FnMessageHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnMessageHandler")
    }
}

#[async_trait]
impl<F> MessageHandler for FnMessageHandler<F>
where
    F: Fn(&DeliveredMessage) -> Result<(), HandlerError> + Send + Sync,
{
    async fn on_message(&self, message: &DeliveredMessage) -> Result<(), HandlerError> {
        (self.0)(message)
    }
}

/// Receives the broker's confirmation for each published message.
///
/// Exactly one of the two methods is called per accepted publish. Calls
/// come from the publisher's dispatcher task and must not block.
pub trait PublishEventHandler: Send + Sync {
    fn on_ack(&self, key: &CorrelationKey);

    fn on_nack(&self, key: &CorrelationKey, cause: &str, timestamp: SystemTime);
}

/// Publish handler that only logs confirmations.
#[derive(Debug, Default, Clone)]
pub struct LoggingPublishHandler;

impl PublishEventHandler for LoggingPublishHandler {
    fn on_ack(&self, key: &CorrelationKey) {
        tracing::info!(%key, "Publish acknowledged");
    }

    fn on_nack(&self, key: &CorrelationKey, cause: &str, timestamp: SystemTime) {
        tracing::error!(%key, cause, ?timestamp, "Publish rejected");
    }
}
