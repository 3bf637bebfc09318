//! Event families fanned out to session subscribers.

use serde::{Deserialize, Serialize};

use crate::delta::QueueDelta;
use crate::model::{QueueState, SessionUser};

/// Queue event published after the authority applies a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Complete snapshot, sent instead of deltas.
    FullSync {
        /// Sequence of `state`.
        sequence: u64,
        /// The snapshot.
        state: QueueState,
    },
    /// A single applied delta.
    Delta {
        /// Sequence after applying `delta`.
        sequence: u64,
        /// Hash after applying `delta`.
        state_hash: String,
        /// The applied delta.
        delta: QueueDelta,
        /// Client that issued the delta.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Client-chosen id used to retire its pending command.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

impl QueueEvent {
    /// Build a full sync event from a snapshot.
    #[must_use]
    pub fn full_sync(state: QueueState) -> Self {
        Self::FullSync {
            sequence: state.sequence,
            state,
        }
    }

    /// Resulting sequence carried by the event.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        match self {
            Self::FullSync { sequence, .. } | Self::Delta { sequence, .. } => *sequence,
        }
    }

    /// Correlation id of a delta event.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Delta { correlation_id, .. } => correlation_id.as_deref(),
            Self::FullSync { .. } => None,
        }
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::FullSync { .. } => "full_sync",
            Self::Delta { delta, .. } => delta.kind(),
        }
    }
}

/// Session membership and metadata events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A participant joined or changed identity.
    UserJoined {
        /// The participant.
        user: SessionUser,
    },
    /// A participant left.
    UserLeft {
        /// Client id of the participant.
        user_id: String,
    },
    /// Leadership moved.
    LeaderChanged {
        /// Client id of the new leader.
        leader_id: String,
    },
    /// The board angle changed.
    AngleChanged {
        /// New angle in degrees.
        angle: u16,
        /// Board the session is on.
        board_path: String,
    },
    /// The leader ended the session.
    SessionEnded {
        /// Human readable reason.
        reason: String,
        /// Where members can continue, if anywhere.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_path: Option<String>,
    },
}
