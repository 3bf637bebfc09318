//! Error types for queue operations.

use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur in queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Unknown connection, session or participant.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency mismatch on a queue update.
    #[error("Version conflict: expected {expected}, current {actual}")]
    VersionConflict {
        /// Sequence the caller last observed.
        expected: u64,
        /// Sequence currently held by the authority.
        actual: u64,
    },

    /// Operation requires an authenticated identity.
    #[error("Authentication required")]
    Unauthenticated,

    /// Malformed input (bad angle, empty session id, ...).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Climb-data collaborator failed for one item.
    #[error("Climb data fetch failed for {uuid}: {reason}")]
    UpstreamFetchFailure {
        /// Climb uuid that could not be refreshed.
        uuid: String,
        /// Collaborator error description.
        reason: String,
    },

    /// A connection id was registered twice.
    #[error("Duplicate connection id: {0}")]
    DuplicateConnection(String),

    /// Version conflicts persisted through every retry.
    #[error("Could not save change after {attempts} attempts, please retry")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The transport is not connected.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The delta was rejected against the current state; a resync is required.
    #[error("Delta rejected: {0}")]
    Rejected(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Stable wire code for error frames.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::VersionConflict { .. } => "version_conflict",
            Self::Unauthenticated => "unauthenticated",
            Self::InvalidInput(_) => "invalid_input",
            Self::UpstreamFetchFailure { .. } => "upstream_fetch_failure",
            Self::DuplicateConnection(_) => "duplicate_connection",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Rejected(_) => "rejected",
            Self::Serialization(_) => "serialization_error",
        }
    }

    /// Returns true if retrying the same operation may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        Self::is_retryable_code(self.code())
    }

    /// [`is_retryable`](Self::is_retryable) for a code received on the wire.
    #[must_use]
    pub fn is_retryable_code(code: &str) -> bool {
        matches!(
            code,
            "version_conflict" | "connection_lost" | "upstream_fetch_failure"
        )
    }

    /// Whether an error code means the command can never succeed as sent.
    #[must_use]
    pub fn is_terminal_code(code: &str) -> bool {
        matches!(
            code,
            "rejected" | "invalid_input" | "not_found" | "unauthenticated"
        )
    }
}
