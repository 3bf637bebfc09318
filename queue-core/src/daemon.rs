//! Daemon bridge between a peer mesh and a session room.
//!
//! The bridge joins the mesh as an ordinary peer and the room as an
//! ordinary client. It seeds the room from the mesh when the room is new,
//! then relays changes in both directions. It never holds a queue of its
//! own: the room stays authoritative for the session and the mesh host for
//! the mesh.
//!
//! Relayed frames get fresh correlation ids, remembered in a bounded
//! history so their echoes are not relayed back.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;

use crate::delta::QueueDelta;
use crate::error::QueueResult;
use crate::event::QueueEvent;
use crate::model::QueueState;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{Subscription, Transport, TransportEvent};

/// Correlation ids remembered for echo suppression.
pub const FORWARD_HISTORY: usize = 256;

/// Bridge lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgePhase {
    /// Waiting for the mesh snapshot.
    AwaitingMesh,
    /// Join sent to the room.
    Joining,
    /// Relaying in both directions.
    Bridging,
}

/// Relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames relayed mesh to room.
    pub to_session: u64,
    /// Frames relayed room to mesh.
    pub to_peer: u64,
    /// Echoes suppressed.
    pub suppressed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Peer,
    Session,
}

struct Endpoint {
    transport: Arc<dyn Transport>,
    inbox: mpsc::Receiver<TransportEvent>,
    _subscription: Subscription,
    last_pushed_hash: Option<String>,
    state_hash: Option<String>,
    sequence: u64,
}

impl Endpoint {
    fn attach(transport: Arc<dyn Transport>) -> Self {
        let (tx, inbox) = mpsc::channel();
        let subscription = transport.subscribe_to_data(Arc::new(move |event: &TransportEvent| {
            let _ = tx.send(event.clone());
        }));
        Self {
            transport,
            inbox,
            _subscription: subscription,
            last_pushed_hash: None,
            state_hash: None,
            sequence: 0,
        }
    }
}

/// Relays queue changes between a peer mesh and a session room.
pub struct DaemonBridge {
    peer: Endpoint,
    session: Endpoint,
    session_id: String,
    board_path: String,
    username: Option<String>,
    phase: BridgePhase,
    forwarded: VecDeque<String>,
    stats: BridgeStats,
}

impl DaemonBridge {
    /// Create a bridge and ask the mesh for its snapshot.
    ///
    /// # Errors
    ///
    /// Returns the peer transport's error if the request cannot be sent.
    pub fn start(
        peer: Arc<dyn Transport>,
        session: Arc<dyn Transport>,
        session_id: impl Into<String>,
        board_path: impl Into<String>,
    ) -> QueueResult<Self> {
        let bridge = Self {
            peer: Endpoint::attach(peer),
            session: Endpoint::attach(session),
            session_id: session_id.into(),
            board_path: board_path.into(),
            username: Some("Daemon".to_string()),
            phase: BridgePhase::AwaitingMesh,
            forwarded: VecDeque::with_capacity(FORWARD_HISTORY),
            stats: BridgeStats::default(),
        };
        bridge.peer.transport.request_queue_state()?;
        tracing::info!(session_id = %bridge.session_id, "Daemon bridge started");
        Ok(bridge)
    }

    /// Process queued events from both sides until both are idle.
    pub fn poll(&mut self) -> usize {
        let mut total = 0;
        loop {
            let mut round = 0;
            while let Ok(event) = self.peer.inbox.try_recv() {
                self.handle(Side::Peer, event);
                round += 1;
            }
            while let Ok(event) = self.session.inbox.try_recv() {
                self.handle(Side::Session, event);
                round += 1;
            }
            if round == 0 {
                return total;
            }
            total += round;
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    /// Relay counters.
    #[must_use]
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    fn handle(&mut self, side: Side, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {}
            TransportEvent::Connected => {
                // Rejoin from a fresh mesh snapshot.
                self.phase = BridgePhase::AwaitingMesh;
                if let Err(e) = self.peer.transport.request_queue_state() {
                    tracing::warn!(?side, "Bridge resync failed: {}", e);
                }
            }
            TransportEvent::Disconnected { reason } => {
                tracing::warn!(?side, reason = %reason, "Bridge side disconnected");
                self.phase = BridgePhase::AwaitingMesh;
            }
            TransportEvent::Message(message) => self.on_message(side, message),
        }
    }

    fn on_message(&mut self, side: Side, message: ServerMessage) {
        match (side, message) {
            (Side::Session, ServerMessage::SessionJoined { state, .. }) => {
                tracing::info!(
                    session_id = %self.session_id,
                    sequence = state.sequence,
                    "Bridge joined session"
                );
                self.session.sequence = state.sequence;
                self.session.state_hash = Some(state.state_hash.clone());
                self.phase = BridgePhase::Bridging;
                // The room wins; the mesh adopts whatever it holds.
                self.push_snapshot(Side::Peer, &state);
            }
            (side, ServerMessage::Queue { event, .. }) => self.on_queue_event(side, event),
            (side, ServerMessage::Error { code, message, .. }) => {
                tracing::warn!(?side, code = %code, "Bridge relay error: {}", message);
            }
            _ => {}
        }
    }

    fn on_queue_event(&mut self, side: Side, event: QueueEvent) {
        match event {
            QueueEvent::FullSync { state, .. } => {
                if side == Side::Peer && self.phase == BridgePhase::AwaitingMesh {
                    self.peer.sequence = state.sequence;
                    self.peer.state_hash = Some(state.state_hash.clone());
                    self.join_session(&state);
                    return;
                }
                if self.phase != BridgePhase::Bridging {
                    return;
                }
                let endpoint = self.endpoint_mut(side);
                endpoint.state_hash = Some(state.state_hash.clone());
                if endpoint.last_pushed_hash.as_deref() == Some(state.state_hash.as_str()) {
                    endpoint.sequence = endpoint.sequence.max(state.sequence);
                    self.stats.suppressed += 1;
                    return;
                }
                if state.sequence <= endpoint.sequence {
                    return;
                }
                endpoint.sequence = state.sequence;
                self.push_snapshot(side.other(), &state);
            }
            QueueEvent::Delta {
                sequence,
                state_hash,
                delta,
                correlation_id,
                ..
            } => {
                let endpoint = self.endpoint_mut(side);
                endpoint.sequence = endpoint.sequence.max(sequence);
                endpoint.state_hash = Some(state_hash);
                if self.phase != BridgePhase::Bridging {
                    return;
                }
                if correlation_id
                    .as_deref()
                    .is_some_and(|id| self.forwarded.iter().any(|f| f == id))
                {
                    self.stats.suppressed += 1;
                    return;
                }
                self.relay_delta(side.other(), delta);
            }
        }
    }

    fn join_session(&mut self, mesh_state: &QueueState) {
        let seeded = !mesh_state.queue.is_empty() || mesh_state.current_item.is_some();
        let request = ClientMessage::JoinSession {
            session_id: self.session_id.clone(),
            board_path: self.board_path.clone(),
            username: self.username.clone(),
            avatar_url: None,
            initial_queue: seeded.then(|| mesh_state.queue.clone()),
            initial_current_item: mesh_state.current_item.clone(),
            session_name: None,
        };
        match self.session.transport.send_data(request, None) {
            Ok(()) => self.phase = BridgePhase::Joining,
            Err(e) => tracing::warn!(session_id = %self.session_id, "Bridge join failed: {}", e),
        }
    }

    fn relay_delta(&mut self, to: Side, delta: QueueDelta) {
        let message_id = self.remember();
        let message = ClientMessage::Delta {
            delta,
            message_id: Some(message_id),
        };
        if self.send(to, message) {
            match to {
                Side::Peer => self.stats.to_peer += 1,
                Side::Session => self.stats.to_session += 1,
            }
        }
    }

    fn push_snapshot(&mut self, to: Side, state: &QueueState) {
        let endpoint = self.endpoint_mut(to);
        let target = Some(state.state_hash.as_str());
        if endpoint.state_hash.as_deref() == target || endpoint.last_pushed_hash.as_deref() == target {
            return;
        }
        endpoint.last_pushed_hash = Some(state.state_hash.clone());
        let message_id = self.remember();
        let message = ClientMessage::SetQueue {
            queue: state.queue.clone(),
            current_item: state.current_item.clone(),
            expected_sequence: None,
            message_id: Some(message_id),
        };
        if self.send(to, message) {
            match to {
                Side::Peer => self.stats.to_peer += 1,
                Side::Session => self.stats.to_session += 1,
            }
        }
    }

    fn send(&mut self, to: Side, message: ClientMessage) -> bool {
        let kind = message.kind();
        match self.endpoint_mut(to).transport.send_data(message, None) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(?to, kind, "Bridge relay failed: {}", e);
                false
            }
        }
    }

    fn remember(&mut self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        if self.forwarded.len() >= FORWARD_HISTORY {
            self.forwarded.pop_front();
        }
        self.forwarded.push_back(id.clone());
        id
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Peer => &mut self.peer,
            Side::Session => &mut self.session,
        }
    }
}

impl Side {
    fn other(self) -> Self {
        match self {
            Self::Peer => Self::Session,
            Self::Session => Self::Peer,
        }
    }
}

impl std::fmt::Debug for DaemonBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonBridge")
            .field("session_id", &self.session_id)
            .field("phase", &self.phase)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
