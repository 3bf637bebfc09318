//! Queue data model.
//!
//! A [`QueueItem`] wraps a [`ClimbRef`] with its own `uuid`. The item uuid is
//! the identity for every positional operation; the climb uuid is not, since
//! the same climb may be queued more than once.

use serde::{Deserialize, Serialize};

use crate::hash::state_hash;

/// Opaque user identity supplied by the identity collaborator.
pub type UserId = String;

/// A climbing problem as displayed in the queue.
///
/// Stats fields are angle dependent and refreshed by the room when the
/// session angle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimbRef {
    /// Climb identifier.
    pub uuid: String,
    /// Display name.
    pub name: String,
    /// Setter display name.
    #[serde(default)]
    pub setter_username: String,
    /// Encoded hold frames.
    #[serde(default)]
    pub frames: String,
    /// Board angle the stats below were computed at.
    pub angle: u16,
    /// Difficulty grade at `angle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    /// Average quality rating at `angle`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_average: Option<f64>,
    /// Number of logged ascents at `angle`.
    #[serde(default)]
    pub ascensionist_count: u32,
    /// Whether the climb is displayed mirrored.
    #[serde(default)]
    pub mirrored: bool,
}

impl ClimbRef {
    /// Create a climb reference with no stats.
    #[must_use]
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, angle: u16) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            setter_username: String::new(),
            frames: String::new(),
            angle,
            difficulty: None,
            quality_average: None,
            ascensionist_count: 0,
            mirrored: false,
        }
    }
}

/// A single entry in the shared queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item identity within a queue.
    pub uuid: String,
    /// The queued climb.
    pub climb: ClimbRef,
    /// User that added the item, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_by: Option<UserId>,
    /// Item was suggested rather than explicitly queued.
    #[serde(default)]
    pub suggested: bool,
}

impl QueueItem {
    /// Create a queue item with a fresh uuid.
    #[must_use]
    pub fn new(climb: ClimbRef, added_by: Option<UserId>) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            climb,
            added_by,
            suggested: false,
        }
    }

    /// Create a queue item with a caller-chosen uuid.
    #[must_use]
    pub fn with_uuid(uuid: impl Into<String>, climb: ClimbRef) -> Self {
        Self {
            uuid: uuid.into(),
            climb,
            added_by: None,
            suggested: false,
        }
    }
}

/// Replicated queue state.
///
/// `sequence` increases by exactly one per applied delta and `state_hash`
/// is recomputed from `queue` and `current_item` on every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    /// Ordered queue; item uuids are unique.
    pub queue: Vec<QueueItem>,
    /// The climb currently on the wall.
    pub current_item: Option<QueueItem>,
    /// Monotonic version.
    pub sequence: u64,
    /// Digest of `(queue, current_item)`.
    pub state_hash: String,
}

impl QueueState {
    /// Empty state at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(Vec::new(), None, 0)
    }

    /// Build a state from its parts, computing the hash.
    #[must_use]
    pub fn from_parts(queue: Vec<QueueItem>, current_item: Option<QueueItem>, sequence: u64) -> Self {
        let state_hash = state_hash(&queue, current_item.as_ref());
        Self {
            queue,
            current_item,
            sequence,
            state_hash,
        }
    }

    /// Index of the item with `uuid`, if queued.
    #[must_use]
    pub fn position_of(&self, uuid: &str) -> Option<usize> {
        self.queue.iter().position(|item| item.uuid == uuid)
    }

    /// Whether an item with `uuid` is queued.
    #[must_use]
    pub fn contains(&self, uuid: &str) -> bool {
        self.position_of(uuid).is_some()
    }

    /// Uuid of the current item, if any.
    #[must_use]
    pub fn current_uuid(&self) -> Option<&str> {
        self.current_item.as_ref().map(|item| item.uuid.as_str())
    }

    /// Recompute `state_hash` after mutating `queue` or `current_item`.
    pub fn rehash(&mut self) {
        self.state_hash = state_hash(&self.queue, self.current_item.as_ref());
    }

    /// Whether two replicas at the same sequence hold the same content.
    #[must_use]
    pub fn same_content(&self, other: &Self) -> bool {
        self.state_hash == other.state_hash
    }
}

impl Default for QueueState {
    fn default() -> Self {
        Self::new()
    }
}

/// A participant in a session as seen by other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    /// Connection-scoped client id.
    pub id: String,
    /// Authenticated user id, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Display name.
    pub username: String,
    /// Avatar image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Whether this participant is the session leader.
    pub is_leader: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(uuid: &str) -> QueueItem {
        QueueItem::with_uuid(uuid, ClimbRef::new(format!("climb-{uuid}"), "Problem", 40))
    }

    #[test]
    fn test_empty_state() {
        let state = QueueState::new();
        assert!(state.queue.is_empty());
        assert!(state.current_item.is_none());
        assert_eq!(state.sequence, 0);
        assert!(!state.state_hash.is_empty());
    }

    #[test]
    fn test_position_of() {
        let state = QueueState::from_parts(vec![item("a"), item("b")], None, 0);
        assert_eq!(state.position_of("b"), Some(1));
        assert_eq!(state.position_of("z"), None);
        assert!(state.contains("a"));
    }

    #[test]
    fn test_rehash_tracks_content() {
        let mut state = QueueState::from_parts(vec![item("a")], None, 0);
        let before = state.state_hash.clone();
        state.queue.push(item("b"));
        state.rehash();
        assert_ne!(before, state.state_hash);
    }

    #[test]
    fn test_queue_item_new_generates_uuid() {
        let a = QueueItem::new(ClimbRef::new("c", "n", 40), None);
        let b = QueueItem::new(ClimbRef::new("c", "n", 40), None);
        assert_ne!(a.uuid, b.uuid);
    }

    #[test]
    fn test_queue_item_serde_defaults() {
        let json = r#"{"uuid":"q1","climb":{"uuid":"c1","name":"Crimp","angle":40}}"#;
        let parsed: QueueItem = serde_json::from_str(json).expect("should parse");
        assert_eq!(parsed.uuid, "q1");
        assert!(!parsed.suggested);
        assert!(!parsed.climb.mirrored);
        assert!(parsed.added_by.is_none());
    }
}
