//! Event Bus
//!
//! Fan-out of session state changes and metrics snapshots to any number of
//! subscribers. Publishing never waits on a subscriber: a subscriber that
//! falls more than the channel capacity behind is disconnected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::metrics::MetricsSnapshot;
use crate::session::{SessionId, SessionState, StateChange};

/// Default channel capacity for bus events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StateChanged {
        session_id: SessionId,
        old_state: SessionState,
        new_state: SessionState,
        retry_count: u32,
        last_error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Metrics {
        snapshot: MetricsSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    pub fn metrics(snapshot: MetricsSnapshot) -> Self {
        Self::Metrics {
            snapshot,
            timestamp: Utc::now(),
        }
    }

    /// SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state",
            Self::Metrics { .. } => "metrics",
        }
    }
}

impl From<&StateChange> for Event {
    fn from(change: &StateChange) -> Self {
        Self::StateChanged {
            session_id: change.session_id.clone(),
            old_state: change.old_state,
            new_state: change.new_state,
            retry_count: change.retry_count,
            last_error: change.last_error.clone(),
            timestamp: change.at,
        }
    }
}

/// Broadcaster for bus events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to future events. No history is replayed.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: Some(self.sender.subscribe()),
        }
    }

    /// Publish an event without blocking.
    ///
    /// Returns the number of subscribers the event was queued for.
    pub fn publish(&self, event: Event) -> usize {
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                debug!("No event subscribers");
                0
            }
        }
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscriber's channel.
pub struct Subscription {
    receiver: Option<broadcast::Receiver<Event>>,
}

impl Subscription {
    /// Next event, or `None` once the channel is closed.
    ///
    /// A subscriber that lagged behind is closed rather than resynchronized,
    /// so it never observes a gap silently.
    pub async fn recv(&mut self) -> Option<Event> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event subscriber fell behind, disconnecting");
                self.receiver = None;
                None
            }
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                None
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.receiver.is_none()
    }
}
