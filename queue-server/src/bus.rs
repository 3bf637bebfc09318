//! Event Bus.
//!
//! One broadcast topic per session carries both event families, so a
//! subscriber sees queue and session events in the order the room published
//! them. Delivery is best effort: a subscriber that falls behind gets
//! `RecvError::Lagged` and recovers with a full sync. Nothing is buffered
//! for connections that are not subscribed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::broadcast;

use queue_core::{QueueEvent, SessionEvent};

/// Default per-session broadcast buffer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// An event published for one session.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Queue change.
    Queue(QueueEvent),
    /// Membership or metadata change.
    Session(SessionEvent),
}

type Topics = RwLock<HashMap<String, broadcast::Sender<BusEvent>>>;

/// Per-session publish/subscribe.
#[derive(Clone)]
pub struct EventBus {
    topics: Arc<Topics>,
    capacity: usize,
}

impl EventBus {
    /// Bus with the default buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Bus with a custom per-session buffer size.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Publish a queue event. Returns how many subscribers it reached.
    pub fn publish_queue(&self, session_id: &str, event: QueueEvent) -> usize {
        self.publish(session_id, BusEvent::Queue(event))
    }

    /// Publish a session event. Returns how many subscribers it reached.
    pub fn publish_session(&self, session_id: &str, event: SessionEvent) -> usize {
        self.publish(session_id, BusEvent::Session(event))
    }

    /// Publish to every current subscriber of `session_id`.
    pub fn publish(&self, session_id: &str, event: BusEvent) -> usize {
        let topics = self
            .topics
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sender) = topics.get(session_id) else {
            return 0;
        };
        // No receivers is fine.
        sender.send(event).unwrap_or(0)
    }

    /// Subscribe to a session. Dropping the subscription unsubscribes.
    #[must_use]
    pub fn subscribe(&self, session_id: &str) -> BusSubscription {
        let mut topics = self
            .topics
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let rx = topics
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        BusSubscription {
            session_id: session_id.to_string(),
            rx: Some(rx),
            topics: Arc::downgrade(&self.topics),
        }
    }

    /// Drop a session's topic once nobody is subscribed.
    ///
    /// A topic with live subscribers is kept: they subscribed ahead of a
    /// join and belong to whichever room next takes the session id. The
    /// last subscription to drop prunes it. Returns whether it was removed.
    pub fn close_session(&self, session_id: &str) -> bool {
        let mut topics = self
            .topics
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if topics
            .get(session_id)
            .is_some_and(|tx| tx.receiver_count() > 0)
        {
            tracing::debug!(session_id = %session_id, "Keeping topic with pending subscribers");
            return false;
        }
        topics.remove(session_id).is_some()
    }

    /// Number of subscribers for a session.
    #[must_use]
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.topics
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Number of sessions with a topic.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a session topic.
pub struct BusSubscription {
    session_id: String,
    rx: Option<broadcast::Receiver<BusEvent>>,
    topics: Weak<Topics>,
}

impl BusSubscription {
    /// Session this subscription belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the next event.
    ///
    /// # Errors
    ///
    /// Returns `Lagged` when events were dropped for this subscriber and
    /// `Closed` once the session topic is gone.
    pub async fn recv(&mut self) -> Result<BusEvent, broadcast::error::RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => Err(broadcast::error::RecvError::Closed),
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        drop(self.rx.take());
        let Some(topics) = self.topics.upgrade() else {
            return;
        };
        let mut topics = topics
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if topics
            .get(&self.session_id)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            topics.remove(&self.session_id);
        }
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
