//! Correlating publisher.
//!
//! Every accepted publish is tracked by its correlation key until the
//! broker confirms it. A dispatcher task turns confirmations into exactly one
//! `on_ack` or `on_nack` per key. Confirmations for keys that are not
//! outstanding are logged and dropped.

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::SystemTime,
};

use broker_client_core::{
    CorrelationKey, Destination, OutboundMessage, PublishError,
    traits::{Confirmation, TransportError, TransportProducer},
};
use broker_client_session::Session;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::handlers::PublishEventHandler;

const CLOSED_CAUSE: &str = "producer closed before confirmation";

type Outstanding = Arc<Mutex<HashMap<CorrelationKey, Destination>>>;

/// Publishes guaranteed messages and reports their confirmations.
pub struct CorrelatingPublisher {
    session: Session,
    producer: Arc<dyn TransportProducer>,
    outstanding: Outstanding,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CorrelatingPublisher {
    /// Open a producer on `session`.
    ///
    /// # Errors
    /// Returns error if the session is not connected.
    pub async fn new(
        session: &Session,
        handler: Arc<dyn PublishEventHandler>,
    ) -> Result<Self, PublishError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let producer = session
            .link()
            .open_producer(tx)
            .await
            .map_err(|e| match e {
                TransportError::NotConnected => PublishError::NotConnected,
                TransportError::Closed => PublishError::Closed,
                other => PublishError::Rejected(other.to_string()),
            })?;

        let outstanding: Outstanding = Arc::new(Mutex::new(HashMap::new()));
        let dispatcher = tokio::spawn(dispatch(rx, Arc::clone(&outstanding), handler));
        tracing::debug!(session = %session.id(), "Publisher opened");

        Ok(Self {
            session: session.clone(),
            producer,
            outstanding,
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    /// Publish one message under `key`.
    ///
    /// On `Ok` exactly one confirmation callback will fire for `key`; on
    /// `Err` none will.
    ///
    /// # Errors
    /// Returns error if the publisher is closed, the session is down, `key`
    /// is still outstanding, or the message is refused before sending.
    pub async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
        key: impl Into<CorrelationKey>,
    ) -> Result<(), PublishError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        if !self.session.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let key = key.into();
        {
            let mut outstanding = self.lock_outstanding();
            if outstanding.contains_key(&key) {
                return Err(PublishError::DuplicateKey(key));
            }
            outstanding.insert(key.clone(), destination.clone());
        }

        if let Err(e) = self.producer.send(destination, message, key.clone()).await {
            self.lock_outstanding().remove(&key);
            tracing::warn!(%key, %destination, error = %e, "Publish refused");
            return Err(match e {
                TransportError::NotConnected => PublishError::NotConnected,
                TransportError::Closed => PublishError::Closed,
                other => PublishError::Rejected(other.to_string()),
            });
        }

        tracing::debug!(%key, %destination, "Message published");
        Ok(())
    }

    /// Number of publishes awaiting confirmation.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.lock_outstanding().len()
    }

    /// Close the producer.
    ///
    /// Returns once every outstanding key got its callback; keys the broker
    /// never confirmed are nacked.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.producer.close();

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                tracing::error!(error = %e, "Publisher dispatcher failed");
            }
        }
        tracing::debug!(session = %self.session.id(), "Publisher closed");
    }

    fn lock_outstanding(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationKey, Destination>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CorrelatingPublisher {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.producer.close();
        }
    }
}

/// Deliver confirmations to the handler until the producer closes.
async fn dispatch(
    mut confirmations: mpsc::UnboundedReceiver<Confirmation>,
    outstanding: Outstanding,
    handler: Arc<dyn PublishEventHandler>,
) {
    while let Some(confirmation) = confirmations.recv().await {
        let known = outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(confirmation.key())
            .is_some();
        if !known {
            tracing::warn!(key = %confirmation.key(), "Confirmation for unknown correlation key dropped");
            continue;
        }
        notify(handler.as_ref(), &confirmation);
    }

    let leftover: Vec<CorrelationKey> = outstanding
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain()
        .map(|(key, _)| key)
        .collect();
    let now = SystemTime::now();
    for key in leftover {
        notify(
            handler.as_ref(),
            &Confirmation::Nack {
                key,
                cause: CLOSED_CAUSE.to_string(),
                timestamp: now,
            },
        );
    }
}

fn notify(handler: &dyn PublishEventHandler, confirmation: &Confirmation) {
    let result = catch_unwind(AssertUnwindSafe(|| match confirmation {
        Confirmation::Ack { key } => handler.on_ack(key),
        Confirmation::Nack {
            key,
            cause,
            timestamp,
        } => handler.on_nack(key, cause, *timestamp),
    }));
    if result.is_err() {
        tracing::error!(key = %confirmation.key(), "Publish event handler panicked");
    }
}
