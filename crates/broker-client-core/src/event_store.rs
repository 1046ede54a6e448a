//! Session events with broadcast + history.

use std::{
    collections::VecDeque,
    fmt,
    sync::RwLock,
    time::SystemTime,
};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

/// Default history size limit (events).
const HISTORY_EVENTS: usize = 1024;

/// What happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
    /// The link went down and reconnection is in progress.
    Reconnecting,
    /// The link is back up.
    Reconnected,
    /// Reconnection gave up; the session is down for good.
    ConnectionLost,
    /// A recorded subscription could not be reapplied after reconnect.
    SubscriptionError,
}

impl fmt::Display for SessionEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Reconnecting => "reconnecting",
            Self::Reconnected => "reconnected",
            Self::ConnectionLost => "connection-lost",
            Self::SubscriptionError => "subscription-error",
        };
        f.write_str(name)
    }
}

/// Immutable notification about a session's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub kind: SessionEventKind,
    /// Human-readable cause.
    pub cause: String,
    pub timestamp: SystemTime,
}

impl SessionEvent {
    #[must_use]
    pub fn new(session_id: Uuid, kind: SessionEventKind, cause: impl Into<String>) -> Self {
        Self {
            session_id,
            kind,
            cause: cause.into(),
            timestamp: SystemTime::now(),
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {} {}: {}", self.session_id, self.kind, self.cause)
    }
}

/// Observer of session events.
///
/// Called on the session's supervisor task; implementations must not block.
pub trait SessionEventHandler: Send + Sync {
    fn handle_event(&self, event: &SessionEvent);
}

impl<F> SessionEventHandler for F
where
    F: Fn(&SessionEvent) + Send + Sync,
{
    fn handle_event(&self, event: &SessionEvent) {
        self(event);
    }
}

/// Event store with broadcast and bounded history.
///
/// Late observers receive the history, then live events.
pub struct EventStore {
    history: RwLock<VecDeque<SessionEvent>>,
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore {
    /// Create a new event store.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            history: RwLock::new(VecDeque::with_capacity(16)),
            sender,
        }
    }

    /// Push an event to both live listeners and history.
    pub fn push(&self, event: SessionEvent) {
        let _ = self.sender.send(event.clone()); // live listeners

        let mut history = self
            .history
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if history.len() == HISTORY_EVENTS {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Get a snapshot of the history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.history
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = (self.history(), self.subscribe());

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
