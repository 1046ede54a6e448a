//! Connection manager for broker sessions.
//!
//! Owns the connect policy (host list walk, per-host retries, capability
//! check) and the reconnect supervisor that keeps a session alive after the
//! link drops.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock, Weak},
};

use broker_client_core::{
    BrokerConfig, CapabilityError, CapabilitySet, ConfigError, ConnectError, ConnectionError,
    EventStore, SessionEvent, SessionEventHandler, SessionEventKind,
    traits::{BrokerLink, LinkEvent, Transport, TransportError},
};
use async_trait::async_trait;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// The link dropped; the supervisor is retrying.
    Reconnecting,
    /// Reconnect retries ran out.
    Down,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Down => "down",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something bound through a session that must be shut down before the
/// session releases its link, such as a consumer flow.
#[async_trait]
pub trait SessionResource: Send + Sync {
    /// Shut down, waiting for in-flight work to finish.
    async fn close(&self);

    /// Mark closed and release immediately without waiting.
    fn release(&self);
}

struct SessionShared {
    id: Uuid,
    config: BrokerConfig,
    host: Mutex<String>,
    link: Arc<dyn BrokerLink>,
    state: RwLock<SessionState>,
    events: Arc<EventStore>,
    handler: Option<Arc<dyn SessionEventHandler>>,
    /// Queue subscriptions to reapply after a reconnect.
    subscriptions: Mutex<Vec<(String, String)>>,
    resources: Mutex<Vec<Weak<dyn SessionResource>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `next` unless the session is already closed.
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Closed {
            return false;
        }
        *state = next;
        true
    }

    fn emit(&self, kind: SessionEventKind, cause: impl Into<String>) {
        let event = SessionEvent::new(self.id, kind, cause);
        if let Some(handler) = &self.handler {
            handler.handle_event(&event);
        }
        self.events.push(event);
    }

    /// Move to `Closed` and stop the supervisor. False if already closed.
    fn begin_close(&self) -> bool {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        if let Some(supervisor) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            supervisor.abort();
        }
        true
    }

    fn take_resources(&self) -> Vec<Arc<dyn SessionResource>> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .filter_map(|r| r.upgrade())
            .collect()
    }

    /// Drain every bound resource, then release the link.
    async fn shutdown(&self) {
        if !self.begin_close() {
            return;
        }
        let resources = self.take_resources();
        tracing::debug!(session = %self.id, resources = resources.len(), "Draining session resources");
        for resource in resources {
            resource.close().await;
        }
        self.link.close();
        tracing::info!(session = %self.id, "Session closed");
    }

    /// Release everything without waiting for in-flight work.
    fn close_now(&self) {
        if !self.begin_close() {
            return;
        }
        for resource in self.take_resources() {
            resource.release();
        }
        self.link.close();
        tracing::info!(session = %self.id, "Session released");
    }

    async fn recover(&self, cause: &str) {
        if !self.transition(SessionState::Reconnecting) {
            return;
        }
        tracing::warn!(session = %self.id, cause, "Connection lost, reconnecting");
        self.emit(SessionEventKind::Reconnecting, cause);

        let channel = &self.config.channel;
        let mut last_cause = cause.to_string();
        let mut round = 0u32;
        while channel.reconnect_retries.permits(round) {
            round += 1;
            tokio::time::sleep(channel.reconnect_retry_wait()).await;

            for host in self.config.hosts() {
                if self.state() == SessionState::Closed {
                    return;
                }
                match self.link.reconnect(host).await {
                    Ok(()) => {
                        *self.host.lock().unwrap_or_else(PoisonError::into_inner) = host.to_string();
                        if !self.transition(SessionState::Connected) {
                            return;
                        }
                        if self.config.reapply_subscriptions {
                            self.reapply().await;
                        }
                        tracing::info!(session = %self.id, host, round, "Session reconnected");
                        self.emit(SessionEventKind::Reconnected, format!("reconnected to {host}"));
                        return;
                    }
                    Err(e) => {
                        tracing::debug!(session = %self.id, host, round, error = %e, "Reconnect attempt failed");
                        last_cause = e.to_string();
                    }
                }
            }
        }

        if self.transition(SessionState::Down) {
            tracing::error!(session = %self.id, rounds = round, cause = %last_cause, "Reconnect retries exhausted");
            self.emit(
                SessionEventKind::ConnectionLost,
                format!("reconnect retries exhausted: {last_cause}"),
            );
        }
    }

    async fn reapply(&self) {
        let subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (queue, topic) in subscriptions {
            match self.link.add_subscription(&queue, &topic).await {
                Ok(()) => tracing::debug!(session = %self.id, %queue, %topic, "Subscription reapplied"),
                Err(e) => {
                    tracing::warn!(session = %self.id, %queue, %topic, error = %e, "Failed to reapply subscription");
                    self.emit(
                        SessionEventKind::SubscriptionError,
                        format!("{topic} on {queue}: {e}"),
                    );
                }
            }
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        self.close_now();
    }
}

/// Handle to a connected broker session.
///
/// Clones share one underlying connection. The connection is released by
/// [`Session::close`] or when the last handle is dropped.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("host", &self.host())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Host the session is currently connected to.
    #[must_use]
    pub fn host(&self) -> String {
        self.shared
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected && self.shared.link.is_connected()
    }

    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        self.shared.link.capabilities()
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    /// Session event store (history and live subscription).
    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.shared.events)
    }

    /// Underlying transport link.
    #[must_use]
    pub fn link(&self) -> Arc<dyn BrokerLink> {
        Arc::clone(&self.shared.link)
    }

    /// Remember a queue subscription so it is reapplied after reconnect.
    pub fn record_subscription(&self, queue: &str, topic: &str) {
        let mut subscriptions = self
            .shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !subscriptions.iter().any(|(q, t)| q == queue && t == topic) {
            subscriptions.push((queue.to_string(), topic.to_string()));
        }
    }

    pub fn forget_subscription(&self, queue: &str, topic: &str) {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(q, t)| q != queue || t != topic);
    }

    /// Recorded queue subscriptions as `(queue, topic)` pairs.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<(String, String)> {
        self.shared
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Shut `resource` down before the link when the session closes.
    ///
    /// A resource tracked after the session closed is released at once.
    pub fn track(&self, resource: Weak<dyn SessionResource>) {
        let mut resources = self
            .shared
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.state() == SessionState::Closed {
            drop(resources);
            if let Some(resource) = resource.upgrade() {
                resource.release();
            }
            return;
        }
        resources.retain(|r| r.strong_count() > 0);
        resources.push(resource);
    }

    /// Close the session. Idempotent.
    ///
    /// Tracked resources are closed first, each waiting for its in-flight
    /// callback, and the link is released afterwards. A call made while
    /// another close is in progress returns without waiting.
    pub async fn close(&self) {
        self.shared.shutdown().await;
    }
}

/// Connection manager.
///
/// Produces at most one live [`Session`] at a time.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    handler: Option<Arc<dyn SessionEventHandler>>,
    active: tokio::sync::Mutex<Weak<SessionShared>>,
}

impl<T: Transport + 'static> ConnectionManager<T> {
    /// Create a new connection manager.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            transport: Arc::new(transport),
            handler: None,
            active: tokio::sync::Mutex::new(Weak::new()),
        }
    }

    /// Register an observer for session events.
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn SessionEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Connect to the broker and verify its capabilities.
    ///
    /// # Errors
    /// Returns `ConnectionError` if the configuration is invalid, the broker
    /// refuses the credentials, every attempt in the retry budget fails, or a
    /// session is already active. Returns `CapabilityError` if the broker
    /// lacks a required capability.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<Session, ConnectError> {
        config.validate().map_err(ConnectionError::Config)?;

        let mut active = self.active.lock().await;
        if active
            .upgrade()
            .is_some_and(|s| s.state() != SessionState::Closed)
        {
            return Err(ConnectionError::AlreadyActive.into());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (host, link) = self.establish(config, &events_tx).await?;
        drop(events_tx);

        let advertised = link.capabilities();
        let required = CapabilitySet::required();
        for capability in required.iter() {
            tracing::debug!(
                capability = capability.as_str(),
                supported = advertised.contains(capability),
                "Broker capability"
            );
        }
        let missing = required.missing_from(&advertised);
        if !missing.is_empty() {
            tracing::error!(%host, %missing, "Broker lacks required capabilities");
            link.close();
            return Err(CapabilityError { missing }.into());
        }

        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            config: config.clone(),
            host: Mutex::new(host.clone()),
            link,
            state: RwLock::new(SessionState::Connected),
            events: Arc::new(EventStore::new()),
            handler: self.handler.clone(),
            subscriptions: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        });

        let supervisor = tokio::spawn(supervise(Arc::downgrade(&shared), events_rx));
        *shared
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        *active = Arc::downgrade(&shared);
        tracing::info!(session = %shared.id, %host, vpn = %config.vpn_name, "Session connected");

        Ok(Session { shared })
    }

    /// Walk the host list within the configured retry budget.
    async fn establish(
        &self,
        config: &BrokerConfig,
        events: &mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<(String, Arc<dyn BrokerLink>), ConnectionError> {
        let hosts = config.hosts();
        if hosts.is_empty() {
            return Err(ConfigError::Missing("host".to_string()).into());
        }

        let channel = &config.channel;
        let wait = channel.reconnect_retry_wait();
        let mut attempts = 0u32;
        let mut last_cause = String::new();
        let mut pass = 0u32;

        loop {
            for host in &hosts {
                let mut retry = 0u32;
                loop {
                    if attempts > 0 {
                        tokio::time::sleep(wait).await;
                    }
                    attempts += 1;

                    match self.transport.connect(host, config, events.clone()).await {
                        Ok(link) => return Ok(((*host).to_string(), link)),
                        Err(TransportError::Authentication(cause)) => {
                            tracing::error!(host, %cause, "Broker rejected credentials");
                            return Err(ConnectionError::Authentication(cause));
                        }
                        Err(e) => {
                            tracing::warn!(host, attempt = attempts, error = %e, "Connection attempt failed");
                            last_cause = e.to_string();
                        }
                    }

                    if !channel.connect_retries_per_host.permits(retry) {
                        break;
                    }
                    retry += 1;
                }
            }

            if !channel.connect_retries.permits(pass) {
                break;
            }
            pass += 1;
        }

        Err(ConnectionError::ExhaustedRetries {
            attempts,
            last_cause,
        })
    }

    /// The live session, if any.
    pub async fn active_session(&self) -> Option<Session> {
        self.active
            .lock()
            .await
            .upgrade()
            .filter(|s| s.state() != SessionState::Closed)
            .map(|shared| Session { shared })
    }

    /// Close the live session, if any.
    pub async fn close(&self) {
        let shared = std::mem::take(&mut *self.active.lock().await).upgrade();
        if let Some(shared) = shared {
            shared.shutdown().await;
        }
    }
}

/// Reconnect supervisor of one session.
async fn supervise(session: Weak<SessionShared>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(LinkEvent::Down { cause }) = events.recv().await {
        let Some(shared) = session.upgrade() else {
            break;
        };
        if shared.state() == SessionState::Closed {
            break;
        }
        shared.recover(&cause).await;
    }
}
