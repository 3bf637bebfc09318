//! # Wire Protocol
//!
//! JSON frames exchanged between clients and the session authority. Both
//! session mode (server relayed) and peer mode (host relayed) speak the
//! same frames.
//!
//! ## Client -> Authority
//!
//! - `{"type": "join_session", "session_id": "...", "board_path": "...", ...}`
//! - `{"type": "create_session", "board_path": "...", ...}`
//! - `{"type": "leave_session"}`
//! - `{"type": "end_session", "reason": "..."}`
//! - `{"type": "update_username", "username": "..."}`
//! - `{"type": "update_session_angle", "angle": 40}`
//! - `{"type": "request_queue_state"}`
//! - `{"type": "queue_delta", "delta": {...}, "message_id": "..."}`
//! - `{"type": "set_queue", "queue": [...], "current_item": {...}, "expected_sequence": 4}`
//! - `{"type": "heartbeat", "timestamp": 0}`
//!
//! ## Authority -> Client
//!
//! - `{"type": "welcome", "version": "...", "connection_id": "..."}`
//! - `{"type": "session_joined", "client_id": "...", "is_leader": true, "state": {...}}`
//! - `{"type": "session_created", "session_id": "..."}`
//! - `{"type": "session_left", "new_leader_id": "..."}`
//! - `{"type": "queue", "session_id": "...", "event": {...}}`
//! - `{"type": "session", "session_id": "...", "event": {...}}`
//! - `{"type": "ack", "message_id": "...", "applied": true, "sequence": 5}`
//! - `{"type": "heartbeat_response", "original_timestamp": 0, "response_timestamp": 0}`
//! - `{"type": "error", "code": "...", "message": "..."}`

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::delta::QueueDelta;
use crate::error::QueueError;
use crate::event::{QueueEvent, SessionEvent};
use crate::model::{QueueItem, QueueState, SessionUser};

/// Client-to-authority message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join an existing session, creating the room if needed.
    JoinSession {
        /// Session to join.
        session_id: String,
        /// Board the session runs on.
        board_path: String,
        /// Display name; defaults to `User-xxxxxx`.
        #[serde(default)]
        username: Option<String>,
        /// Avatar image URL.
        #[serde(default)]
        avatar_url: Option<String>,
        /// Local queue to seed a brand new session with.
        #[serde(default)]
        initial_queue: Option<Vec<QueueItem>>,
        /// Local current item to seed a brand new session with.
        #[serde(default)]
        initial_current_item: Option<QueueItem>,
        /// Display name of the session.
        #[serde(default)]
        session_name: Option<String>,
    },
    /// Create a new session and join it as leader.
    CreateSession {
        /// Board the session runs on.
        board_path: String,
        /// Display name of the session.
        #[serde(default)]
        session_name: Option<String>,
        /// Display name of the creator.
        #[serde(default)]
        username: Option<String>,
        /// Avatar image URL.
        #[serde(default)]
        avatar_url: Option<String>,
        /// Local queue to carry into the new session.
        #[serde(default)]
        initial_queue: Option<Vec<QueueItem>>,
        /// Local current item to carry into the new session.
        #[serde(default)]
        initial_current_item: Option<QueueItem>,
    },
    /// Leave the current session.
    LeaveSession,
    /// End the session for everyone (leader only).
    EndSession {
        /// Reason shown to members.
        #[serde(default)]
        reason: Option<String>,
        /// Where members can continue.
        #[serde(default)]
        new_path: Option<String>,
    },
    /// Change display name and avatar.
    UpdateUsername {
        /// New display name.
        username: String,
        /// New avatar URL.
        #[serde(default)]
        avatar_url: Option<String>,
    },
    /// Change the board angle for the session.
    UpdateSessionAngle {
        /// New angle in degrees.
        angle: u16,
    },
    /// Ask for a full snapshot.
    RequestQueueState,
    /// Apply a queue delta.
    #[serde(rename = "queue_delta")]
    Delta {
        /// Delta to apply.
        delta: QueueDelta,
        /// Correlation id echoed in the resulting event and ack.
        #[serde(default)]
        message_id: Option<String>,
    },
    /// Replace the queue with optimistic concurrency.
    SetQueue {
        /// New queue.
        queue: Vec<QueueItem>,
        /// New current item.
        #[serde(default)]
        current_item: Option<QueueItem>,
        /// Sequence the client last observed; `None` skips the check.
        #[serde(default)]
        expected_sequence: Option<u64>,
        /// Correlation id echoed in the ack.
        #[serde(default)]
        message_id: Option<String>,
    },
    /// Liveness probe.
    Heartbeat {
        /// Client send time (ms since epoch).
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::JoinSession { .. } => "join_session",
            Self::CreateSession { .. } => "create_session",
            Self::LeaveSession => "leave_session",
            Self::EndSession { .. } => "end_session",
            Self::UpdateUsername { .. } => "update_username",
            Self::UpdateSessionAngle { .. } => "update_session_angle",
            Self::RequestQueueState => "request_queue_state",
            Self::Delta { .. } => "queue_delta",
            Self::SetQueue { .. } => "set_queue",
            Self::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// Authority-to-client message types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once when a connection opens.
    Welcome {
        /// Server version.
        version: String,
        /// Transport-level connection id.
        connection_id: String,
        /// Whether the identity collaborator authenticated this connection.
        authenticated: bool,
        /// Connection timestamp.
        timestamp: u64,
    },
    /// Join succeeded; `state` is the authoritative snapshot.
    SessionJoined {
        /// Joined session.
        session_id: String,
        /// Client id of this connection within the session.
        client_id: String,
        /// Whether this client leads the session.
        is_leader: bool,
        /// All participants in join order.
        users: Vec<SessionUser>,
        /// Display name of the session.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_name: Option<String>,
        /// Authoritative queue state.
        state: QueueState,
    },
    /// A new session was created.
    SessionCreated {
        /// Generated session id.
        session_id: String,
    },
    /// Leave completed.
    SessionLeft {
        /// Session that was left.
        session_id: String,
        /// New leader when leadership moved.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_leader_id: Option<String>,
    },
    /// Queue event for a joined session.
    Queue {
        /// Session the event belongs to.
        session_id: String,
        /// The event.
        event: QueueEvent,
    },
    /// Session event for a joined session.
    Session {
        /// Session the event belongs to.
        session_id: String,
        /// The event.
        event: SessionEvent,
    },
    /// Acknowledgement of a queue mutation.
    Ack {
        /// Correlation id from the request.
        message_id: String,
        /// False when the mutation was a no-op.
        applied: bool,
        /// Authoritative sequence after the mutation.
        sequence: u64,
        /// Authoritative hash after the mutation.
        state_hash: String,
    },
    /// Reply to a heartbeat.
    HeartbeatResponse {
        /// Timestamp from the heartbeat.
        original_timestamp: u64,
        /// Authority time of the reply.
        response_timestamp: u64,
    },
    /// Error response.
    Error {
        /// Stable error code.
        code: String,
        /// Human readable message.
        message: String,
        /// Correlation id of the failed request.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
}

impl ServerMessage {
    /// Build an error frame from a queue error.
    #[must_use]
    pub fn from_error(err: &QueueError, message_id: Option<String>) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            message_id,
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Welcome { .. } => "welcome",
            Self::SessionJoined { .. } => "session_joined",
            Self::SessionCreated { .. } => "session_created",
            Self::SessionLeft { .. } => "session_left",
            Self::Queue { .. } => "queue",
            Self::Session { .. } => "session",
            Self::Ack { .. } => "ack",
            Self::HeartbeatResponse { .. } => "heartbeat_response",
            Self::Error { .. } => "error",
        }
    }
}

/// Get the current Unix timestamp in milliseconds.
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
