//! In-process peer mode.
//!
//! A [`PeerMesh`] connects peers directly. The earliest peer still present
//! is the host and serves as the authority for the whole mesh; when it
//! leaves, the next earliest peer takes over the queue it held.
//!
//! Deliveries happen while the mesh lock is held, so subscribers must only
//! forward into a channel (see [`crate::transport`]).

use std::sync::{Arc, Mutex, MutexGuard};

use crate::authority::{Origin, QueueAuthority};
use crate::error::{QueueError, QueueResult};
use crate::event::SessionEvent;
use crate::model::{QueueState, SessionUser};
use crate::protocol::{current_timestamp, ClientMessage, ServerMessage};
use crate::transport::{DataHandler, HandlerSet, Subscription, Transport, TransportEvent, TransportMode};

struct PeerSlot {
    peer_id: String,
    username: String,
    handlers: HandlerSet,
}

struct MeshInner {
    mesh_id: String,
    peers: Vec<PeerSlot>,
    authority: QueueAuthority,
}

impl MeshInner {
    fn host_id(&self) -> Option<&str> {
        self.peers.first().map(|p| p.peer_id.as_str())
    }

    fn slot(&self, peer_id: &str) -> Option<&PeerSlot> {
        self.peers.iter().find(|p| p.peer_id == peer_id)
    }

    fn users(&self) -> Vec<SessionUser> {
        self.peers
            .iter()
            .enumerate()
            .map(|(i, p)| SessionUser {
                id: p.peer_id.clone(),
                user_id: None,
                username: p.username.clone(),
                avatar_url: None,
                is_leader: i == 0,
            })
            .collect()
    }

    fn deliver(&self, peer_id: &str, message: ServerMessage) {
        if let Some(slot) = self.slot(peer_id) {
            slot.handlers.notify(&TransportEvent::Message(message));
        }
    }

    fn broadcast(&self, message: &ServerMessage) {
        let event = TransportEvent::Message(message.clone());
        for peer in &self.peers {
            peer.handlers.notify(&event);
        }
    }

    fn session_frame(&self, event: SessionEvent) -> ServerMessage {
        ServerMessage::Session {
            session_id: self.mesh_id.clone(),
            event,
        }
    }

    fn queue_frame(&self, event: crate::event::QueueEvent) -> ServerMessage {
        ServerMessage::Queue {
            session_id: self.mesh_id.clone(),
            event,
        }
    }

    /// Host-side handling of one frame from `from`.
    fn handle(&mut self, from: &str, message: ClientMessage) {
        match message {
            ClientMessage::RequestQueueState => {
                let frame = self.queue_frame(self.authority.snapshot());
                self.deliver(from, frame);
            }
            ClientMessage::JoinSession {
                initial_queue,
                initial_current_item,
                ..
            } => {
                if self.authority.is_pristine() {
                    if let Some(queue) = initial_queue {
                        match self.authority.update(queue, initial_current_item, None) {
                            Ok(_) => {
                                let frame = self.queue_frame(self.authority.snapshot());
                                self.broadcast(&frame);
                            }
                            Err(e) => {
                                tracing::warn!(peer_id = %from, "Ignoring initial queue: {}", e);
                            }
                        }
                    }
                }
                let frame = ServerMessage::SessionJoined {
                    session_id: self.mesh_id.clone(),
                    client_id: from.to_string(),
                    is_leader: self.host_id() == Some(from),
                    users: self.users(),
                    session_name: None,
                    state: self.authority.state().clone(),
                };
                self.deliver(from, frame);
            }
            ClientMessage::Delta { delta, message_id } => {
                let origin = Origin::client(from, message_id.clone());
                match self.authority.apply_delta(&delta, &origin) {
                    Ok(commit) => {
                        if let Some(event) = commit.event.clone() {
                            let frame = self.queue_frame(event);
                            self.broadcast(&frame);
                        }
                        if let Some(message_id) = message_id {
                            self.deliver(
                                from,
                                ServerMessage::Ack {
                                    message_id,
                                    applied: commit.applied(),
                                    sequence: commit.sequence,
                                    state_hash: commit.state_hash,
                                },
                            );
                        }
                    }
                    Err(e) => self.deliver(from, ServerMessage::from_error(&e, message_id)),
                }
            }
            ClientMessage::SetQueue {
                queue,
                current_item,
                expected_sequence,
                message_id,
            } => match self.authority.update(queue, current_item, expected_sequence) {
                Ok(state) => {
                    let (sequence, state_hash) = (state.sequence, state.state_hash.clone());
                    let frame = self.queue_frame(self.authority.snapshot());
                    self.broadcast(&frame);
                    if let Some(message_id) = message_id {
                        self.deliver(
                            from,
                            ServerMessage::Ack {
                                message_id,
                                applied: true,
                                sequence,
                                state_hash,
                            },
                        );
                    }
                }
                Err(e) => self.deliver(from, ServerMessage::from_error(&e, message_id)),
            },
            ClientMessage::Heartbeat { timestamp } => self.deliver(
                from,
                ServerMessage::HeartbeatResponse {
                    original_timestamp: timestamp,
                    response_timestamp: current_timestamp(),
                },
            ),
            other => {
                let err = QueueError::Rejected(format!("{} is not available in peer mode", other.kind()));
                self.deliver(from, ServerMessage::from_error(&err, None));
            }
        }
    }
}

/// A direct mesh of peers with an elected host.
#[derive(Clone)]
pub struct PeerMesh {
    inner: Arc<Mutex<MeshInner>>,
}

impl PeerMesh {
    /// Empty mesh.
    #[must_use]
    pub fn new(mesh_id: impl Into<String>) -> Self {
        Self::with_state(mesh_id, QueueState::new())
    }

    /// Mesh whose first host starts from `state`.
    #[must_use]
    pub fn with_state(mesh_id: impl Into<String>, state: QueueState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MeshInner {
                mesh_id: mesh_id.into(),
                peers: Vec::new(),
                authority: QueueAuthority::from_state(state),
            })),
        }
    }

    /// Add a peer. The first peer becomes host.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateConnection`] if `peer_id` is present.
    pub fn join(&self, peer_id: impl Into<String>) -> QueueResult<Arc<PeerTransport>> {
        let peer_id = peer_id.into();
        let mut inner = lock(&self.inner);
        if inner.slot(&peer_id).is_some() {
            return Err(QueueError::DuplicateConnection(peer_id));
        }
        let handlers = HandlerSet::new();
        inner.peers.push(PeerSlot {
            peer_id: peer_id.clone(),
            username: format!("Peer-{}", peer_id.chars().take(6).collect::<String>()),
            handlers: handlers.clone(),
        });
        if let Some(user) = inner.users().pop() {
            let frame = inner.session_frame(SessionEvent::UserJoined { user });
            inner.broadcast(&frame);
        }
        tracing::info!(
            mesh_id = %inner.mesh_id,
            peer_id = %peer_id,
            host = ?inner.host_id(),
            "Peer joined mesh"
        );
        Ok(Arc::new(PeerTransport {
            peer_id,
            mesh: Arc::clone(&self.inner),
            handlers,
        }))
    }

    /// Remove a peer, electing the earliest remaining peer as host.
    pub fn leave(&self, peer_id: &str) {
        let mut inner = lock(&self.inner);
        let Some(idx) = inner.peers.iter().position(|p| p.peer_id == peer_id) else {
            return;
        };
        let slot = inner.peers.remove(idx);
        slot.handlers.notify(&TransportEvent::Disconnected {
            reason: "left mesh".to_string(),
        });
        let left = inner.session_frame(SessionEvent::UserLeft {
            user_id: slot.peer_id,
        });
        inner.broadcast(&left);

        if idx == 0 {
            match inner.host_id().map(str::to_string) {
                Some(host) => {
                    tracing::info!(mesh_id = %inner.mesh_id, host = %host, "Host handed over");
                    let leader =
                        inner.session_frame(SessionEvent::LeaderChanged { leader_id: host });
                    inner.broadcast(&leader);
                    // New host announces the queue it now owns.
                    let frame = inner.queue_frame(inner.authority.snapshot());
                    inner.broadcast(&frame);
                }
                None => {
                    tracing::info!(mesh_id = %inner.mesh_id, "Mesh empty");
                }
            }
        }
    }

    /// Peer id of the current host.
    #[must_use]
    pub fn host_id(&self) -> Option<String> {
        lock(&self.inner).host_id().map(str::to_string)
    }

    /// Peer ids in join order.
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        lock(&self.inner)
            .peers
            .iter()
            .map(|p| p.peer_id.clone())
            .collect()
    }

    /// Authoritative state held by the host.
    #[must_use]
    pub fn state(&self) -> QueueState {
        lock(&self.inner).authority.state().clone()
    }
}

impl std::fmt::Debug for PeerMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("PeerMesh")
            .field("mesh_id", &inner.mesh_id)
            .field("peers", &inner.peers.len())
            .field("sequence", &inner.authority.sequence())
            .finish()
    }
}

/// One peer's endpoint on a [`PeerMesh`].
pub struct PeerTransport {
    peer_id: String,
    mesh: Arc<Mutex<MeshInner>>,
    handlers: HandlerSet,
}

impl PeerTransport {
    /// Announce the connection to current subscribers.
    pub fn announce(&self) {
        if self.is_connected() {
            self.handlers.notify(&TransportEvent::Connected);
        }
    }
}

impl Transport for PeerTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Peer
    }

    fn peer_id(&self) -> String {
        self.peer_id.clone()
    }

    fn host_id(&self) -> Option<String> {
        lock(&self.mesh).host_id().map(str::to_string)
    }

    fn is_connected(&self) -> bool {
        lock(&self.mesh).slot(&self.peer_id).is_some()
    }

    fn send_data(&self, message: ClientMessage, target: Option<&str>) -> QueueResult<()> {
        let mut inner = lock(&self.mesh);
        if inner.slot(&self.peer_id).is_none() {
            return Err(QueueError::ConnectionLost(format!(
                "{} is not in the mesh",
                self.peer_id
            )));
        }
        if let Some(target) = target {
            if inner.host_id() != Some(target) {
                return Err(QueueError::Rejected(format!(
                    "only the host accepts frames, not {target}"
                )));
            }
        }
        tracing::trace!(peer_id = %self.peer_id, kind = message.kind(), "Peer frame");
        inner.handle(&self.peer_id, message);
        Ok(())
    }

    fn subscribe_to_data(&self, handler: DataHandler) -> Subscription {
        self.handlers.subscribe(handler)
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

fn lock(inner: &Mutex<MeshInner>) -> MutexGuard<'_, MeshInner> {
    inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
