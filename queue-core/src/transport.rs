//! Transport abstraction.
//!
//! One interface over session mode (connected to a room on a server) and
//! peer mode (a direct mesh where one peer hosts the queue). The sync agent
//! and the daemon bridge only see [`Transport`].
//!
//! Handlers run on the transport's delivery path. They must not call back
//! into a transport; forward into a channel instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};

use crate::error::QueueResult;
use crate::protocol::{ClientMessage, ServerMessage};

/// What a transport is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Relayed through a room on the session server.
    Session,
    /// Direct mesh with an elected host.
    Peer,
}

/// The role that owns the authoritative queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    /// The session server's room.
    Server,
    /// The peer-mode host with this peer id.
    Host(String),
    /// Peer mode before a host is known.
    Unknown,
}

/// Delivered to transport subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A connection attempt started.
    Connecting,
    /// The transport is ready to send.
    Connected,
    /// The transport dropped.
    Disconnected {
        /// Why the transport dropped.
        reason: String,
    },
    /// A frame from the authority.
    Message(ServerMessage),
}

/// Subscriber callback.
pub type DataHandler = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

type HandlerList = RwLock<Vec<(u64, DataHandler)>>;

/// Registered transport subscribers.
#[derive(Clone, Default)]
pub struct HandlerSet {
    handlers: Arc<HandlerList>,
    next_id: Arc<AtomicU64>,
}

impl HandlerSet {
    /// Empty handler set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn subscribe(&self, handler: DataHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, handler));
        Subscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Invoke every handler with `event`.
    pub fn notify(&self, event: &TransportEvent) {
        let handlers: Vec<DataHandler> = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`Transport::subscribe_to_data`].
///
/// Dropping the handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the handler"]
pub struct Subscription {
    id: u64,
    handlers: Weak<HandlerList>,
}

impl Subscription {
    /// Remove the handler now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handlers) = self.handlers.upgrade() {
            handlers
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// A connection to a queue authority.
pub trait Transport: Send + Sync {
    /// Session or peer mode.
    fn mode(&self) -> TransportMode;

    /// This endpoint's id.
    fn peer_id(&self) -> String;

    /// Peer id of the host in peer mode; always `None` in session mode.
    fn host_id(&self) -> Option<String>;

    /// Whether frames can currently be sent.
    fn is_connected(&self) -> bool;

    /// Send a frame to the authority, or to `target` when given.
    ///
    /// # Errors
    ///
    /// Returns [`crate::QueueError::ConnectionLost`] when disconnected.
    fn send_data(&self, message: ClientMessage, target: Option<&str>) -> QueueResult<()>;

    /// Register a handler for inbound events.
    fn subscribe_to_data(&self, handler: DataHandler) -> Subscription;

    /// Ask the authority for a full snapshot.
    ///
    /// # Errors
    ///
    /// See [`Transport::send_data`].
    fn request_queue_state(&self) -> QueueResult<()> {
        self.send_data(ClientMessage::RequestQueueState, None)
    }

    /// Who owns the authoritative queue.
    fn authority(&self) -> Authority {
        match (self.mode(), self.host_id()) {
            (TransportMode::Session, _) => Authority::Server,
            (TransportMode::Peer, Some(host)) => Authority::Host(host),
            (TransportMode::Peer, None) => Authority::Unknown,
        }
    }
}

/// Whether mutating actions must be suppressed.
///
/// True exactly in peer mode when a host is known and no authoritative
/// queue data has arrived yet.
#[must_use]
pub fn view_only_mode(
    mode: TransportMode,
    host_id: Option<&str>,
    has_initial_queue_data: bool,
) -> bool {
    mode == TransportMode::Peer && host_id.is_some() && !has_initial_queue_data
}
