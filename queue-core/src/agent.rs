//! # Client Synchronization Agent
//!
//! Keeps a local replica of the session queue in step with the authority.
//!
//! ```text
//! Disconnected -> Connecting -> Syncing -> Live
//!       ^                                   |
//!       +------------ send failure ---------+
//! ```
//!
//! The agent holds two states. `confirmed` is the last state the authority
//! vouched for; `view` is `confirmed` with every pending local command
//! replayed on top. Local actions are applied to `view` at once and logged;
//! they are sent only while `Live`, and resent after a reconnect.
//!
//! The agent is single threaded. Transport deliveries are queued on a
//! channel and processed by [`SyncAgent::poll`].

use std::sync::mpsc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::command_log::{CommandLog, PendingCommand};
use crate::delta::QueueDelta;
use crate::error::{QueueError, QueueResult};
use crate::event::{QueueEvent, SessionEvent};
use crate::hash::state_hash;
use crate::model::{QueueState, SessionUser};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::reducer;
use crate::transport::{self, Subscription, Transport, TransportEvent};

/// Agent connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No usable transport.
    Disconnected,
    /// Transport connecting.
    Connecting,
    /// Connected, waiting for the first full sync.
    Syncing,
    /// Applying live deltas.
    Live,
}

/// Session membership as seen by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    /// Joined session.
    pub session_id: String,
    /// This client's id in the session.
    pub client_id: String,
    /// Participants in join order.
    pub users: Vec<SessionUser>,
    /// Display name of the session.
    pub session_name: Option<String>,
    /// Current board angle, once announced.
    pub angle: Option<u16>,
}

impl SessionView {
    /// Client id of the leader.
    #[must_use]
    pub fn leader_id(&self) -> Option<&str> {
        self.users
            .iter()
            .find(|u| u.is_leader)
            .map(|u| u.id.as_str())
    }

    /// Whether this client leads the session.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.leader_id() == Some(self.client_id.as_str())
    }
}

/// Last error reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentError {
    /// Stable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
}

/// Client-side replica driver.
pub struct SyncAgent {
    transport: Arc<dyn Transport>,
    inbox: mpsc::Receiver<TransportEvent>,
    _subscription: Subscription,
    connection: ConnectionState,
    confirmed: QueueState,
    view: QueueState,
    log: CommandLog,
    initial_data_received: bool,
    resync_requested: bool,
    join_request: Option<ClientMessage>,
    seeded_hash: Option<String>,
    session: Option<SessionView>,
    last_error: Option<AgentError>,
    resync_count: u64,
}

impl SyncAgent {
    /// Attach an agent to `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_log(transport, CommandLog::new())
    }

    /// Attach an agent with a preloaded command log.
    #[must_use]
    pub fn with_log(transport: Arc<dyn Transport>, log: CommandLog) -> Self {
        let (tx, inbox) = mpsc::channel();
        let subscription = transport.subscribe_to_data(Arc::new(move |event: &TransportEvent| {
            // Receiver gone means the agent was dropped.
            let _ = tx.send(event.clone());
        }));
        let connected = transport.is_connected();
        let mut agent = Self {
            transport,
            inbox,
            _subscription: subscription,
            connection: ConnectionState::Disconnected,
            confirmed: QueueState::new(),
            view: QueueState::new(),
            log,
            initial_data_received: false,
            resync_requested: false,
            join_request: None,
            seeded_hash: None,
            session: None,
            last_error: None,
            resync_count: 0,
        };
        agent.rebuild_view();
        if connected {
            agent.on_connected();
        }
        agent
    }

    /// Process every queued transport event. Returns the number processed.
    pub fn poll(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event);
            processed += 1;
        }
        processed
    }

    /// Process one transport event.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting => {
                self.connection = ConnectionState::Connecting;
            }
            TransportEvent::Connected => self.on_connected(),
            TransportEvent::Disconnected { reason } => {
                tracing::info!(reason = %reason, pending = self.log.len(), "Transport disconnected");
                self.connection = ConnectionState::Disconnected;
                self.log.mark_all_unsent();
            }
            TransportEvent::Message(message) => self.on_message(message),
        }
    }

    /// Apply a local action optimistically and send it when live.
    ///
    /// Returns the command's correlation id, or `None` when the action was
    /// a no-op against the local view.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Rejected`] while in view-only mode or when the
    /// reducer rejects the delta, and [`QueueError::InvalidInput`] for a
    /// full sync.
    pub fn dispatch(&mut self, delta: QueueDelta) -> QueueResult<Option<String>> {
        if delta.is_full_sync() {
            return Err(QueueError::InvalidInput(
                "full sync is not a local action".to_string(),
            ));
        }
        if self.view_only_mode() {
            return Err(QueueError::Rejected(
                "view only until the host shares the queue".to_string(),
            ));
        }
        if !reducer::apply_mut(&mut self.view, &delta)? {
            return Ok(None);
        }

        let command = PendingCommand::new(delta);
        let correlation_id = command.correlation_id.clone();
        self.log.enqueue(command);
        if self.connection == ConnectionState::Live {
            self.send_command(&correlation_id);
        }
        Ok(Some(correlation_id))
    }

    /// Join a session through the transport.
    ///
    /// The current local view seeds the session if the room is new; an
    /// existing room keeps its own state.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the join frame cannot be sent. The
    /// join is retried on the next connect either way.
    pub fn join_session(
        &mut self,
        session_id: impl Into<String>,
        board_path: impl Into<String>,
        username: Option<String>,
    ) -> QueueResult<()> {
        let has_local = !self.view.queue.is_empty() || self.view.current_item.is_some();
        let request = ClientMessage::JoinSession {
            session_id: session_id.into(),
            board_path: board_path.into(),
            username,
            avatar_url: None,
            initial_queue: has_local.then(|| self.view.queue.clone()),
            initial_current_item: if has_local {
                self.view.current_item.clone()
            } else {
                None
            },
            session_name: None,
        };
        self.join_request = Some(request.clone());
        self.send_join(request)
    }

    /// Ask the authority for a fresh full sync.
    pub fn request_resync(&mut self) {
        self.resync_requested = true;
        self.resync_count += 1;
        if let Err(e) = self.transport.request_queue_state() {
            tracing::warn!("Failed to request queue state: {}", e);
            self.connection = ConnectionState::Disconnected;
        }
    }

    /// Resend commands the authority could not save.
    ///
    /// Returns the number of commands handed to the transport; zero unless
    /// the agent is live.
    pub fn retry_pending(&mut self) -> usize {
        if self.connection != ConnectionState::Live {
            return 0;
        }
        let before = self.log.unsent().count();
        self.last_error = None;
        self.flush();
        before - self.log.unsent().count()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    /// Whether live deltas are being applied.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.connection == ConnectionState::Live
    }

    /// Optimistic local view.
    #[must_use]
    pub fn view(&self) -> &QueueState {
        &self.view
    }

    /// Last state confirmed by the authority.
    #[must_use]
    pub fn confirmed(&self) -> &QueueState {
        &self.confirmed
    }

    /// Pending local commands.
    #[must_use]
    pub fn pending(&self) -> &CommandLog {
        &self.log
    }

    /// Joined session, if any.
    #[must_use]
    pub fn session(&self) -> Option<&SessionView> {
        self.session.as_ref()
    }

    /// Last error frame received.
    #[must_use]
    pub fn last_error(&self) -> Option<&AgentError> {
        self.last_error.as_ref()
    }

    /// Number of resyncs requested so far.
    #[must_use]
    pub fn resync_count(&self) -> u64 {
        self.resync_count
    }

    /// Whether initial queue data arrived on this connection.
    #[must_use]
    pub fn has_initial_queue_data(&self) -> bool {
        self.initial_data_received
    }

    /// Whether mutating actions are suppressed.
    #[must_use]
    pub fn view_only_mode(&self) -> bool {
        transport::view_only_mode(
            self.transport.mode(),
            self.transport.host_id().as_deref(),
            self.initial_data_received,
        )
    }

    fn on_connected(&mut self) {
        self.connection = ConnectionState::Syncing;
        self.initial_data_received = false;
        match self.join_request.clone() {
            Some(request) => {
                // Rejoin with whatever we hold now.
                let request = self.refresh_join_seed(request);
                if let Err(e) = self.send_join(request) {
                    tracing::warn!("Rejoin failed: {}", e);
                }
            }
            None => self.request_resync(),
        }
    }

    fn refresh_join_seed(&self, request: ClientMessage) -> ClientMessage {
        match request {
            ClientMessage::JoinSession {
                session_id,
                board_path,
                username,
                avatar_url,
                session_name,
                ..
            } => ClientMessage::JoinSession {
                session_id,
                board_path,
                username,
                avatar_url,
                initial_queue: Some(self.view.queue.clone()),
                initial_current_item: self.view.current_item.clone(),
                session_name,
            },
            other => other,
        }
    }

    fn send_join(&mut self, request: ClientMessage) -> QueueResult<()> {
        self.seeded_hash = match &request {
            ClientMessage::JoinSession {
                initial_queue: Some(queue),
                initial_current_item,
                ..
            } => Some(state_hash(queue, initial_current_item.as_ref())),
            _ => None,
        };
        self.resync_requested = true;
        self.transport.send_data(request, None).inspect_err(|_| {
            self.connection = ConnectionState::Disconnected;
        })
    }

    fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SessionJoined {
                session_id,
                client_id,
                users,
                session_name,
                state,
                ..
            } => {
                tracing::info!(session_id = %session_id, client_id = %client_id, "Joined session");
                if self.seeded_hash.take().as_deref() == Some(state.state_hash.as_str()) {
                    // The room adopted our local queue; pending commands are in it.
                    let retired = self.log.len();
                    self.log = CommandLog::new();
                    tracing::debug!(retired, "Session seeded from local queue");
                }
                self.session = Some(SessionView {
                    session_id,
                    client_id,
                    users,
                    session_name,
                    angle: None,
                });
                self.accept_full_sync(state, true);
            }
            ServerMessage::SessionLeft { session_id, .. } => {
                tracing::info!(session_id = %session_id, "Left session");
                self.session = None;
                self.join_request = None;
            }
            ServerMessage::Queue { event, .. } => self.on_queue_event(event),
            ServerMessage::Session { event, .. } => self.on_session_event(event),
            ServerMessage::Ack {
                message_id,
                applied,
                sequence,
                ..
            } => {
                if !applied || sequence <= self.confirmed.sequence {
                    self.log.retire(&message_id);
                } else {
                    self.log.mark_acked(&message_id, sequence);
                }
                self.rebuild_view();
            }
            ServerMessage::Error {
                code,
                message,
                message_id,
            } => {
                tracing::warn!(code = %code, "Authority error: {}", message);
                self.last_error = Some(AgentError {
                    code: code.clone(),
                    message,
                });
                let Some(id) = message_id else {
                    return;
                };
                if QueueError::is_terminal_code(&code) {
                    self.log.retire(&id);
                    self.rebuild_view();
                    if code == "rejected" {
                        self.request_resync();
                    }
                    return;
                }
                // Keep the edit in the view; it is resent on the next flush.
                self.log.mark_unsent(&id);
                if QueueError::is_retryable_code(&code) {
                    self.request_resync();
                }
            }
            ServerMessage::Welcome { .. }
            | ServerMessage::SessionCreated { .. }
            | ServerMessage::HeartbeatResponse { .. } => {}
        }
    }

    fn on_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::FullSync { state, .. } => {
                let solicited = self.resync_requested;
                self.accept_full_sync(state, solicited);
            }
            QueueEvent::Delta {
                sequence,
                state_hash,
                delta,
                correlation_id,
                ..
            } => {
                if let Some(id) = correlation_id.as_deref() {
                    self.log.retire(id);
                }
                if self.connection != ConnectionState::Live || self.resync_requested {
                    self.rebuild_view();
                    return;
                }
                if sequence <= self.confirmed.sequence {
                    tracing::debug!(sequence, local = self.confirmed.sequence, "Stale delta");
                    self.rebuild_view();
                    return;
                }
                if sequence != self.confirmed.sequence + 1 {
                    tracing::warn!(
                        sequence,
                        local = self.confirmed.sequence,
                        "Missed deltas, requesting full sync"
                    );
                    self.request_resync();
                    return;
                }
                match reducer::apply_mut(&mut self.confirmed, &delta) {
                    Ok(_)
                        if self.confirmed.sequence == sequence
                            && self.confirmed.state_hash == state_hash => {}
                    Ok(_) => {
                        tracing::warn!(sequence, "Replica diverged, requesting full sync");
                        self.request_resync();
                    }
                    Err(e) => {
                        tracing::warn!(sequence, "Remote delta rejected locally: {}", e);
                        self.request_resync();
                    }
                }
                self.log.retire_confirmed(self.confirmed.sequence);
                self.rebuild_view();
            }
        }
    }

    fn accept_full_sync(&mut self, state: QueueState, solicited: bool) {
        let newer = state.sequence > self.confirmed.sequence;
        if !solicited && self.initial_data_received && !newer {
            tracing::debug!(
                sequence = state.sequence,
                local = self.confirmed.sequence,
                "Ignoring replayed full sync"
            );
            return;
        }

        self.confirmed = QueueState::from_parts(state.queue, state.current_item, state.sequence);
        self.initial_data_received = true;
        self.resync_requested = false;
        self.log.retire_confirmed(self.confirmed.sequence);
        if self.connection != ConnectionState::Live {
            tracing::info!(sequence = self.confirmed.sequence, "Queue synchronized");
            self.connection = ConnectionState::Live;
        }
        self.flush();
        self.rebuild_view();
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match event {
            SessionEvent::UserJoined { user } => {
                match session.users.iter_mut().find(|u| u.id == user.id) {
                    Some(existing) => *existing = user,
                    None => session.users.push(user),
                }
            }
            SessionEvent::UserLeft { user_id } => {
                session.users.retain(|u| u.id != user_id);
            }
            SessionEvent::LeaderChanged { leader_id } => {
                for user in &mut session.users {
                    user.is_leader = user.id == leader_id;
                }
            }
            SessionEvent::AngleChanged { angle, .. } => {
                session.angle = Some(angle);
            }
            SessionEvent::SessionEnded { reason, new_path } => {
                tracing::info!(reason = %reason, new_path = ?new_path, "Session ended");
                self.session = None;
                self.join_request = None;
                self.initial_data_received = false;
                if self.connection == ConnectionState::Live {
                    self.connection = ConnectionState::Syncing;
                }
            }
        }
    }

    fn flush(&mut self) {
        let unsent: Vec<String> = self
            .log
            .unsent()
            .map(|c| c.correlation_id.clone())
            .collect();
        for id in unsent {
            if self.connection != ConnectionState::Live {
                break;
            }
            self.send_command(&id);
        }
    }

    fn send_command(&mut self, correlation_id: &str) {
        let Some(delta) = self
            .log
            .pending()
            .iter()
            .find(|c| c.correlation_id == correlation_id)
            .map(|c| c.delta.clone())
        else {
            return;
        };
        let message = ClientMessage::Delta {
            delta,
            message_id: Some(correlation_id.to_string()),
        };
        match self.transport.send_data(message, None) {
            Ok(()) => self.log.mark_sent(correlation_id),
            Err(e) => {
                tracing::warn!(
                    correlation_id = %correlation_id,
                    "Send failed, keeping command for replay: {}",
                    e
                );
                self.connection = ConnectionState::Disconnected;
                self.log.mark_all_unsent();
            }
        }
    }

    fn rebuild_view(&mut self) {
        let mut view = self.confirmed.clone();
        for command in self.log.pending() {
            if let Err(e) = reducer::apply_mut(&mut view, &command.delta) {
                tracing::debug!(
                    correlation_id = %command.correlation_id,
                    "Pending command no longer applies: {}",
                    e
                );
            }
        }
        self.view = view;
    }
}

impl std::fmt::Debug for SyncAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAgent")
            .field("peer_id", &self.transport.peer_id())
            .field("connection", &self.connection)
            .field("sequence", &self.confirmed.sequence)
            .field("pending", &self.log.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClimbRef, QueueItem};
    use crate::test_support::MockTransport;
    use crate::transport::TransportMode;

    fn item(uuid: &str) -> QueueItem {
        QueueItem::with_uuid(uuid, ClimbRef::new(format!("climb-{uuid}"), "Problem", 40))
    }

    fn add(uuid: &str) -> QueueDelta {
        QueueDelta::AddItem {
            item: item(uuid),
            position: None,
        }
    }

    fn full_sync(uuids: &[&str], sequence: u64) -> TransportEvent {
        let state =
            QueueState::from_parts(uuids.iter().map(|u| item(u)).collect(), None, sequence);
        TransportEvent::Message(ServerMessage::Queue {
            session_id: "s".into(),
            event: QueueEvent::full_sync(state),
        })
    }

    fn remote_delta(
        base: &QueueState,
        delta: QueueDelta,
        correlation: Option<&str>,
    ) -> (QueueState, TransportEvent) {
        let next = reducer::apply(base, &delta).expect("apply");
        let event = TransportEvent::Message(ServerMessage::Queue {
            session_id: "s".into(),
            event: QueueEvent::Delta {
                sequence: next.sequence,
                state_hash: next.state_hash.clone(),
                delta,
                client_id: Some("other".into()),
                correlation_id: correlation.map(str::to_string),
            },
        });
        (next, event)
    }

    fn live_agent(transport: &Arc<MockTransport>) -> SyncAgent {
        transport.set_connected(true);
        let mut agent = SyncAgent::new(transport.clone());
        agent.handle_event(full_sync(&[], 0));
        assert!(agent.is_live());
        transport.clear_sent();
        agent
    }

    #[test]
    fn test_actions_before_live_are_held() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = SyncAgent::new(transport.clone());
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);

        let id = agent.dispatch(add("a")).expect("dispatch");
        assert!(id.is_some());
        assert_eq!(agent.view().queue.len(), 1);
        assert_eq!(agent.pending().len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_connect_requests_state_then_flushes() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = SyncAgent::new(transport.clone());
        agent.dispatch(add("a")).expect("dispatch");

        transport.set_connected(true);
        transport.emit(TransportEvent::Connected);
        agent.poll();
        assert_eq!(agent.connection_state(), ConnectionState::Syncing);
        assert_eq!(transport.sent(), vec![ClientMessage::RequestQueueState]);

        agent.handle_event(full_sync(&["x"], 5));
        assert!(agent.is_live());
        assert_eq!(agent.confirmed().sequence, 5);
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[1], ClientMessage::Delta { .. }));
        let uuids: Vec<_> = agent.view().queue.iter().map(|q| q.uuid.clone()).collect();
        assert_eq!(uuids, vec!["x", "a"]);
    }

    #[test]
    fn test_replayed_full_sync_ignored() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        agent.handle_event(full_sync(&["a", "b"], 3));
        assert_eq!(agent.confirmed().queue.len(), 2);

        // A stale snapshot from a slow responder must not rewind the view.
        agent.handle_event(full_sync(&["old"], 1));
        assert_eq!(agent.confirmed().sequence, 3);
        assert_eq!(agent.confirmed().queue.len(), 2);
    }

    #[test]
    fn test_requested_full_sync_always_accepted() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        agent.handle_event(full_sync(&["a"], 8));

        agent.request_resync();
        agent.handle_event(full_sync(&["fresh"], 2));
        assert_eq!(agent.confirmed().sequence, 2);
        assert_eq!(agent.confirmed().queue[0].uuid, "fresh");
    }

    #[test]
    fn test_remote_delta_applied_in_order() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let (next, event) = remote_delta(agent.confirmed(), add("r"), None);
        agent.handle_event(event);
        assert_eq!(agent.confirmed(), &next);
        assert_eq!(agent.view().queue.len(), 1);
    }

    #[test]
    fn test_gap_requests_resync() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let (first, _) = remote_delta(agent.confirmed(), add("r1"), None);
        let (_, second) = remote_delta(&first, add("r2"), None);

        agent.handle_event(second);
        assert_eq!(agent.confirmed().sequence, 0);
        assert_eq!(agent.resync_count(), 2);
        assert_eq!(transport.sent(), vec![ClientMessage::RequestQueueState]);
    }

    #[test]
    fn test_hash_mismatch_requests_resync() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let event = TransportEvent::Message(ServerMessage::Queue {
            session_id: "s".into(),
            event: QueueEvent::Delta {
                sequence: 1,
                state_hash: "bogus".into(),
                delta: add("r"),
                client_id: None,
                correlation_id: None,
            },
        });
        agent.handle_event(event);
        assert_eq!(transport.sent(), vec![ClientMessage::RequestQueueState]);
    }

    #[test]
    fn test_own_event_retires_pending() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let id = agent.dispatch(add("mine")).expect("dispatch").expect("changed");
        assert_eq!(agent.pending().len(), 1);

        let (_, event) = remote_delta(&QueueState::new(), add("mine"), Some(&id));
        agent.handle_event(event);
        assert!(agent.pending().is_empty());
        assert_eq!(agent.view().queue.len(), 1);
        assert_eq!(agent.view(), agent.confirmed());
    }

    #[test]
    fn test_ack_before_event_keeps_view() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let id = agent.dispatch(add("mine")).expect("dispatch").expect("changed");

        agent.handle_event(TransportEvent::Message(ServerMessage::Ack {
            message_id: id.clone(),
            applied: true,
            sequence: 1,
            state_hash: String::new(),
        }));
        assert_eq!(agent.pending().len(), 1);
        assert_eq!(agent.view().queue.len(), 1);

        let (_, event) = remote_delta(&QueueState::new(), add("mine"), Some(&id));
        agent.handle_event(event);
        assert!(agent.pending().is_empty());
    }

    #[test]
    fn test_noop_ack_retires() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let id = agent.dispatch(add("a")).expect("dispatch").expect("changed");
        agent.handle_event(TransportEvent::Message(ServerMessage::Ack {
            message_id: id,
            applied: false,
            sequence: 0,
            state_hash: String::new(),
        }));
        assert!(agent.pending().is_empty());
        assert!(agent.view().queue.is_empty());
    }

    #[test]
    fn test_send_failure_keeps_command_for_replay() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        transport.set_fail_sends(true);

        agent.dispatch(add("a")).expect("dispatch");
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
        assert_eq!(agent.pending().unsent().count(), 1);
        assert_eq!(agent.view().queue.len(), 1);

        transport.set_fail_sends(false);
        agent.handle_event(TransportEvent::Connected);
        agent.handle_event(full_sync(&[], 0));
        assert!(agent.is_live());
        assert_eq!(agent.pending().unsent().count(), 0);
        assert!(transport
            .sent()
            .iter()
            .any(|m| matches!(m, ClientMessage::Delta { .. })));
    }

    #[test]
    fn test_rejected_error_retires_and_resyncs() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let id = agent.dispatch(add("a")).expect("dispatch").expect("changed");
        transport.clear_sent();

        agent.handle_event(TransportEvent::Message(ServerMessage::Error {
            code: "rejected".into(),
            message: "nope".into(),
            message_id: Some(id),
        }));
        assert!(agent.pending().is_empty());
        assert!(agent.view().queue.is_empty());
        assert_eq!(transport.sent(), vec![ClientMessage::RequestQueueState]);
        assert_eq!(agent.last_error().map(|e| e.code.as_str()), Some("rejected"));
    }

    #[test]
    fn test_exhausted_retries_keep_edit_for_retry() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let id = agent.dispatch(add("a")).expect("dispatch").expect("changed");
        transport.clear_sent();

        agent.handle_event(TransportEvent::Message(ServerMessage::Error {
            code: "retries_exhausted".into(),
            message: "Could not save change after 3 attempts, please retry".into(),
            message_id: Some(id.clone()),
        }));
        assert_eq!(agent.pending().len(), 1);
        assert_eq!(agent.pending().unsent().count(), 1);
        assert_eq!(agent.view().queue.len(), 1);
        assert_eq!(
            agent.last_error().map(|e| e.code.as_str()),
            Some("retries_exhausted")
        );
        assert!(transport.sent().is_empty());

        assert_eq!(agent.retry_pending(), 1);
        assert!(agent.last_error().is_none());
        match &transport.sent()[..] {
            [ClientMessage::Delta { message_id, .. }] => {
                assert_eq!(message_id.as_deref(), Some(id.as_str()));
            }
            other => panic!("Expected one resent delta, got {:?}", other),
        }
    }

    #[test]
    fn test_version_conflict_resyncs_then_resends() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        let id = agent.dispatch(add("a")).expect("dispatch").expect("changed");
        transport.clear_sent();

        agent.handle_event(TransportEvent::Message(ServerMessage::Error {
            code: "version_conflict".into(),
            message: "Version conflict: expected 0, current 2".into(),
            message_id: Some(id),
        }));
        assert_eq!(agent.pending().len(), 1);
        assert_eq!(transport.sent(), vec![ClientMessage::RequestQueueState]);

        agent.handle_event(full_sync(&["x", "y"], 2));
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[1], ClientMessage::Delta { .. }));
        let uuids: Vec<_> = agent.view().queue.iter().map(|q| q.uuid.clone()).collect();
        assert_eq!(uuids, vec!["x", "y", "a"]);
    }

    #[test]
    fn test_retry_pending_offline_sends_nothing() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = SyncAgent::new(transport.clone());
        agent.dispatch(add("a")).expect("dispatch");
        assert_eq!(agent.retry_pending(), 0);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_view_only_in_peer_mode_until_initial_data() {
        let transport = Arc::new(MockTransport::peer("me", Some("host")));
        transport.set_connected(true);
        let mut agent = SyncAgent::new(transport.clone());
        assert!(agent.view_only_mode());
        assert!(matches!(
            agent.dispatch(add("a")),
            Err(QueueError::Rejected(_))
        ));

        agent.handle_event(full_sync(&[], 0));
        assert!(!agent.view_only_mode());
        assert!(agent.dispatch(add("a")).is_ok());
    }

    #[test]
    fn test_peer_mode_without_host_is_editable() {
        let transport = Arc::new(MockTransport::peer("me", None));
        let agent = SyncAgent::new(transport);
        assert!(!agent.view_only_mode());
        assert_eq!(agent.transport.mode(), TransportMode::Peer);
    }

    #[test]
    fn test_join_seeds_local_queue_and_retires_pending() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = SyncAgent::new(transport.clone());
        agent.dispatch(add("solo")).expect("dispatch");
        transport.set_connected(true);
        agent
            .join_session("s1", "/kilter/1/40", Some("Ada".into()))
            .expect("join");

        match &transport.sent()[0] {
            ClientMessage::JoinSession { initial_queue, .. } => {
                assert_eq!(initial_queue.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("Expected JoinSession, got {:?}", other),
        }

        let seeded = QueueState::from_parts(agent.view().queue.clone(), None, 1);
        agent.handle_event(TransportEvent::Message(ServerMessage::SessionJoined {
            session_id: "s1".into(),
            client_id: "c1".into(),
            is_leader: true,
            users: vec![SessionUser {
                id: "c1".into(),
                user_id: None,
                username: "Ada".into(),
                avatar_url: None,
                is_leader: true,
            }],
            session_name: None,
            state: seeded,
        }));
        assert!(agent.is_live());
        assert!(agent.pending().is_empty());
        assert!(agent.session().is_some_and(SessionView::is_leader));
    }

    #[test]
    fn test_session_events_update_membership() {
        let transport = Arc::new(MockTransport::session());
        transport.set_connected(true);
        let mut agent = SyncAgent::new(transport.clone());
        agent.handle_event(TransportEvent::Message(ServerMessage::SessionJoined {
            session_id: "s1".into(),
            client_id: "c2".into(),
            is_leader: false,
            users: vec![
                SessionUser {
                    id: "c1".into(),
                    user_id: None,
                    username: "A".into(),
                    avatar_url: None,
                    is_leader: true,
                },
                SessionUser {
                    id: "c2".into(),
                    user_id: None,
                    username: "B".into(),
                    avatar_url: None,
                    is_leader: false,
                },
            ],
            session_name: None,
            state: QueueState::new(),
        }));

        let session_event = |event| {
            TransportEvent::Message(ServerMessage::Session {
                session_id: "s1".into(),
                event,
            })
        };
        agent.handle_event(session_event(SessionEvent::UserLeft {
            user_id: "c1".into(),
        }));
        agent.handle_event(session_event(SessionEvent::LeaderChanged {
            leader_id: "c2".into(),
        }));
        let session = agent.session().expect("session");
        assert_eq!(session.users.len(), 1);
        assert!(session.is_leader());

        agent.handle_event(session_event(SessionEvent::SessionEnded {
            reason: "done".into(),
            new_path: None,
        }));
        assert!(agent.session().is_none());
        assert_eq!(agent.connection_state(), ConnectionState::Syncing);
    }

    #[test]
    fn test_disconnect_marks_unsent() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = live_agent(&transport);
        agent.dispatch(add("a")).expect("dispatch");
        assert_eq!(agent.pending().unsent().count(), 0);

        agent.handle_event(TransportEvent::Disconnected {
            reason: "closed".into(),
        });
        assert_eq!(agent.connection_state(), ConnectionState::Disconnected);
        assert_eq!(agent.pending().unsent().count(), 1);
    }

    #[test]
    fn test_dispatch_full_sync_rejected() {
        let transport = Arc::new(MockTransport::session());
        let mut agent = SyncAgent::new(transport);
        let result = agent.dispatch(QueueDelta::FullSync {
            state: QueueState::new(),
        });
        assert!(matches!(result, Err(QueueError::InvalidInput(_))));
    }
}
