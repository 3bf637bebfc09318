//! WebSocket handler for queue sessions.
//!
//! Each socket is one connection: it is registered in the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry) when it opens
//! and removed when it closes. Client frames drive the room manager; events
//! of the joined session are relayed from the bus in publish order.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use queue_core::{
    current_timestamp, ClientMessage, Origin, QueueError, QueueEvent, QueueResult, ServerMessage,
};

use crate::bus::{BusEvent, BusSubscription};
use crate::identity::Identity;
use crate::metrics::{
    dec_ws_connections, inc_ws_connections, record_rate_limited, record_validation_failure,
    record_ws_message,
};
use crate::rate_limit::RateLimiter;
use crate::registry::ContextUpdate;
use crate::room::{JoinOutcome, JoinRequest};
use crate::validation::validate_message_size;
use crate::AppState;

/// `GET /ws` upgrade handler.
#[tracing::instrument(name = "queue_websocket_connect", skip(ws, headers, state))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let identity = state.identity.resolve(&headers);
    tracing::info!(
        authenticated = identity.is_authenticated,
        "Queue WebSocket upgrade requested"
    );
    ws.on_upgrade(move |socket| handle_queue_socket(socket, state, identity))
}

/// Per-connection state while a socket is open.
struct ClientSession {
    connection_id: String,
    state: AppState,
    session_id: Option<String>,
    subscription: Option<BusSubscription>,
}

impl ClientSession {
    fn new(connection_id: String, state: AppState) -> Self {
        Self {
            connection_id,
            state,
            session_id: None,
            subscription: None,
        }
    }

    fn require_session(&self) -> QueueResult<String> {
        self.session_id
            .clone()
            .ok_or_else(|| QueueError::NotFound("connection has not joined a session".to_string()))
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Vec<ServerMessage> {
        match msg {
            ClientMessage::JoinSession {
                session_id,
                board_path,
                username,
                avatar_url,
                initial_queue,
                initial_current_item,
                session_name,
            } => {
                let request = JoinRequest {
                    session_id,
                    board_path,
                    username,
                    avatar_url,
                    initial_queue,
                    initial_current_item,
                    session_name,
                };
                self.join(request).await
            }
            ClientMessage::CreateSession {
                board_path,
                session_name,
                username,
                avatar_url,
                initial_queue,
                initial_current_item,
            } => {
                let request = JoinRequest {
                    session_id: String::new(),
                    board_path,
                    username,
                    avatar_url,
                    initial_queue,
                    initial_current_item,
                    session_name,
                };
                self.create(request).await
            }
            ClientMessage::LeaveSession => self.leave().await.into_iter().collect(),
            ClientMessage::EndSession { reason, new_path } => {
                // Everyone, this socket included, learns of the end through the bus.
                match self
                    .state
                    .rooms
                    .end_session(&self.connection_id, reason, new_path)
                    .await
                {
                    Ok(_) => Vec::new(),
                    Err(err) => vec![ServerMessage::from_error(&err, None)],
                }
            }
            ClientMessage::UpdateUsername {
                username,
                avatar_url,
            } => match self
                .state
                .rooms
                .update_username(&self.connection_id, &username, avatar_url)
                .await
            {
                Ok(_) => Vec::new(),
                Err(err) => vec![ServerMessage::from_error(&err, None)],
            },
            ClientMessage::UpdateSessionAngle { angle } => {
                let result = match self.require_session() {
                    Ok(session_id) => self
                        .state
                        .rooms
                        .update_session_angle(&session_id, angle)
                        .await
                        .map(|_| ()),
                    Err(err) => Err(err),
                };
                match result {
                    Ok(()) => Vec::new(),
                    Err(err) => vec![ServerMessage::from_error(&err, None)],
                }
            }
            ClientMessage::RequestQueueState => match self.full_sync().await {
                Ok(msg) => vec![msg],
                Err(err) => vec![ServerMessage::from_error(&err, None)],
            },
            ClientMessage::Delta { delta, message_id } => {
                let result = match self.require_session() {
                    Ok(session_id) => {
                        let origin = Origin::client(self.connection_id.clone(), message_id.clone());
                        self.state
                            .rooms
                            .apply_delta(&session_id, &delta, &origin)
                            .await
                    }
                    Err(err) => Err(err),
                };
                match (result, message_id) {
                    (Ok(commit), Some(message_id)) => vec![ServerMessage::Ack {
                        message_id,
                        applied: commit.applied(),
                        sequence: commit.sequence,
                        state_hash: commit.state_hash,
                    }],
                    (Ok(_), None) => Vec::new(),
                    (Err(err), message_id) => {
                        tracing::debug!(
                            connection_id = %self.connection_id,
                            kind = delta.kind(),
                            "Delta failed: {}",
                            err
                        );
                        vec![ServerMessage::from_error(&err, message_id)]
                    }
                }
            }
            ClientMessage::SetQueue {
                queue,
                current_item,
                expected_sequence,
                message_id,
            } => {
                let result = match self.require_session() {
                    Ok(session_id) => {
                        self.state
                            .rooms
                            .update_queue_state(&session_id, queue, current_item, expected_sequence)
                            .await
                    }
                    Err(err) => Err(err),
                };
                match (result, message_id) {
                    (Ok(state), Some(message_id)) => vec![ServerMessage::Ack {
                        message_id,
                        applied: true,
                        sequence: state.sequence,
                        state_hash: state.state_hash,
                    }],
                    (Ok(_), None) => Vec::new(),
                    (Err(err), message_id) => vec![ServerMessage::from_error(&err, message_id)],
                }
            }
            ClientMessage::Heartbeat { timestamp } => vec![ServerMessage::HeartbeatResponse {
                original_timestamp: timestamp,
                response_timestamp: current_timestamp(),
            }],
        }
    }

    async fn join(&mut self, request: JoinRequest) -> Vec<ServerMessage> {
        if self.session_id.as_deref() != Some(request.session_id.as_str()) {
            self.leave().await;
        }
        // Subscribe first so nothing committed after the join snapshot is missed.
        let subscription = match self.subscription.take() {
            Some(sub) if sub.session_id() == request.session_id => sub,
            _ => self.state.rooms.bus().subscribe(&request.session_id),
        };

        match self
            .state
            .rooms
            .join_session(&self.connection_id, request)
            .await
        {
            Ok(outcome) => {
                self.subscription = Some(subscription);
                self.joined(outcome)
            }
            Err(err) => {
                tracing::debug!(connection_id = %self.connection_id, "Join failed: {}", err);
                // A failed rejoin keeps the existing membership.
                if self.session_id.as_deref() == Some(subscription.session_id()) {
                    self.subscription = Some(subscription);
                }
                vec![ServerMessage::from_error(&err, None)]
            }
        }
    }

    async fn create(&mut self, request: JoinRequest) -> Vec<ServerMessage> {
        self.leave().await;
        match self
            .state
            .rooms
            .create_session(&self.connection_id, request)
            .await
        {
            Ok(outcome) => {
                self.subscription = Some(self.state.rooms.bus().subscribe(&outcome.session_id));
                let created = ServerMessage::SessionCreated {
                    session_id: outcome.session_id.clone(),
                };
                let mut replies = vec![created];
                replies.extend(self.joined(outcome));
                replies
            }
            Err(err) => vec![ServerMessage::from_error(&err, None)],
        }
    }

    fn joined(&mut self, outcome: JoinOutcome) -> Vec<ServerMessage> {
        if let Err(err) = self.state.registry.update(
            &self.connection_id,
            ContextUpdate::joined(outcome.session_id.clone()),
        ) {
            tracing::error!(connection_id = %self.connection_id, "Registry update failed: {}", err);
            return vec![ServerMessage::from_error(&err, None)];
        }
        self.session_id = Some(outcome.session_id.clone());
        vec![ServerMessage::SessionJoined {
            session_id: outcome.session_id,
            client_id: outcome.client_id,
            is_leader: outcome.is_leader,
            users: outcome.users,
            session_name: outcome.session_name,
            state: outcome.state,
        }]
    }

    async fn leave(&mut self) -> Option<ServerMessage> {
        let session_id = self.session_id.take()?;
        // Stop delivery before the leave publishes.
        self.subscription = None;
        let outcome = self.state.rooms.leave_session(&self.connection_id).await;
        self.detach();
        Some(ServerMessage::SessionLeft {
            session_id,
            new_leader_id: outcome.and_then(|o| o.new_leader_id),
        })
    }

    fn detach(&mut self) {
        self.session_id = None;
        self.subscription = None;
        if let Err(err) = self
            .state
            .registry
            .update(&self.connection_id, ContextUpdate::left())
        {
            tracing::warn!(connection_id = %self.connection_id, "Registry update failed: {}", err);
        }
    }

    async fn full_sync(&self) -> QueueResult<ServerMessage> {
        let session_id = self.require_session()?;
        let state = self
            .state
            .rooms
            .get_queue_state(&session_id)
            .await
            .ok_or_else(|| QueueError::NotFound(format!("session {session_id}")))?;
        Ok(ServerMessage::Queue {
            session_id,
            event: QueueEvent::full_sync(state),
        })
    }

    /// Translate a bus event, detaching when the session ends.
    fn relay(&mut self, event: BusEvent) -> Option<ServerMessage> {
        let session_id = self.session_id.clone()?;
        match event {
            BusEvent::Queue(event) => Some(ServerMessage::Queue { session_id, event }),
            BusEvent::Session(event) => {
                let ended = matches!(event, queue_core::SessionEvent::SessionEnded { .. });
                if ended {
                    tracing::info!(
                        connection_id = %self.connection_id,
                        session_id = %session_id,
                        "Session ended, detaching"
                    );
                    self.detach();
                }
                Some(ServerMessage::Session { session_id, event })
            }
        }
    }

    async fn next_event(&mut self) -> Result<BusEvent, RecvError> {
        match self.subscription.as_mut() {
            Some(sub) => sub.recv().await,
            None => std::future::pending().await,
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_message(sender: &mut WsSender, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => {
            record_ws_message("outbound", message.kind());
            sender.send(Message::Text(json.into())).await.is_ok()
        }
        Err(e) => {
            tracing::error!("Failed to serialize {} message: {}", message.kind(), e);
            true
        }
    }
}

async fn send_error(sender: &mut WsSender, code: &str, message: String) -> bool {
    let error = ServerMessage::Error {
        code: code.to_string(),
        message,
        message_id: None,
    };
    send_message(sender, &error).await
}

/// Drive one queue connection until it closes.
pub async fn handle_queue_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = Uuid::new_v4().to_string();

    if let Err(err) =
        state
            .registry
            .create(&connection_id, identity.is_authenticated, identity.user_id.clone())
    {
        tracing::error!(connection_id = %connection_id, "Refusing connection: {}", err);
        let _ = send_message(&mut sender, &ServerMessage::from_error(&err, None)).await;
        return;
    }
    inc_ws_connections();

    let mut rate_limiter = RateLimiter::new(state.rate_limit);
    let mut client = ClientSession::new(connection_id.clone(), state.clone());

    let welcome = ServerMessage::Welcome {
        version: queue_core::VERSION.to_string(),
        connection_id: connection_id.clone(),
        authenticated: identity.is_authenticated,
        timestamp: current_timestamp(),
    };

    if send_message(&mut sender, &welcome).await {
        loop {
            tokio::select! {
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if !rate_limiter.try_consume() {
                                tracing::warn!(connection_id = %connection_id, "Rate limit exceeded");
                                record_rate_limited("websocket");
                                let retry_after = rate_limiter.retry_after_ms();
                                let message = format!("Rate limit exceeded. Retry after {retry_after}ms");
                                if !send_error(&mut sender, "rate_limited", message).await {
                                    break;
                                }
                                continue;
                            }

                            if let Err(e) = validate_message_size(text.len()) {
                                tracing::warn!(connection_id = %connection_id, "Message rejected: {}", e);
                                record_validation_failure("message_size");
                                if !send_error(&mut sender, "message_too_large", e.to_string()).await {
                                    break;
                                }
                                continue;
                            }

                            match serde_json::from_str::<ClientMessage>(&text) {
                                Ok(client_msg) => {
                                    record_ws_message("inbound", client_msg.kind());
                                    tracing::debug!(
                                        connection_id = %connection_id,
                                        kind = client_msg.kind(),
                                        "Received frame"
                                    );
                                    let replies = client.handle_message(client_msg).await;
                                    let mut open = true;
                                    for reply in &replies {
                                        if !send_message(&mut sender, reply).await {
                                            open = false;
                                            break;
                                        }
                                    }
                                    if !open {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    if !send_error(&mut sender, "parse_error", e.to_string()).await {
                                        break;
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::info!(connection_id = %connection_id, "Client disconnected");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!(connection_id = %connection_id, "WebSocket error: {}", e);
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }

                event = client.next_event() => {
                    match event {
                        Ok(event) => {
                            if let Some(message) = client.relay(event) {
                                if !send_message(&mut sender, &message).await {
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!(
                                connection_id = %connection_id,
                                "Client lagged behind by {} events, sending full sync",
                                n
                            );
                            match client.full_sync().await {
                                Ok(message) => {
                                    if !send_message(&mut sender, &message).await {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    tracing::debug!(connection_id = %connection_id, "No state to resync: {}", err);
                                }
                            }
                        }
                        Err(RecvError::Closed) => {
                            tracing::debug!(connection_id = %connection_id, "Session topic closed");
                            client.detach();
                        }
                    }
                }
            }
        }
    }

    // Cleanup: leave the room, then drop the context.
    client.subscription = None;
    if let Some(outcome) = state.rooms.remove_client(&connection_id).await {
        tracing::debug!(
            connection_id = %connection_id,
            session_id = %outcome.session_id,
            "Left session on disconnect"
        );
    }
    state.registry.remove(&connection_id);
    dec_ws_connections();
    tracing::info!(connection_id = %connection_id, "Queue WebSocket connection closed");
}
