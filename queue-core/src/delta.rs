//! Incremental queue mutations.

use serde::{Deserialize, Serialize};

use crate::model::{QueueItem, QueueState};

/// A single mutation to queue state.
///
/// Every variant except [`QueueDelta::FullSync`] must be applied in order.
/// `FullSync` is last-write-wins by sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueDelta {
    /// Insert an item at `position`, or append.
    AddItem {
        /// Item to insert.
        item: QueueItem,
        /// Insertion index; out-of-range values append.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    /// Remove the item with `uuid`.
    RemoveItem {
        /// Item to remove.
        uuid: String,
    },
    /// Move the item at `old_index` to `new_index`.
    ReorderItem {
        /// Item expected at `old_index`.
        uuid: String,
        /// Current index of the item.
        old_index: usize,
        /// Destination index, clamped to bounds.
        new_index: usize,
    },
    /// Change the current item.
    SetCurrent {
        /// New current item, or `None` to clear.
        item: Option<QueueItem>,
        /// Insert the item after the previous current one if absent.
        #[serde(default)]
        should_add_to_queue: bool,
    },
    /// Set the mirrored flag on the current item.
    Mirror {
        /// New mirrored flag.
        mirrored: bool,
    },
    /// Substitute an item in place.
    ReplaceItem {
        /// Item to replace.
        uuid: String,
        /// Replacement.
        item: QueueItem,
    },
    /// Replace the whole state.
    FullSync {
        /// Snapshot to adopt.
        state: QueueState,
    },
}

impl QueueDelta {
    /// Short label used in logs and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AddItem { .. } => "add_item",
            Self::RemoveItem { .. } => "remove_item",
            Self::ReorderItem { .. } => "reorder_item",
            Self::SetCurrent { .. } => "set_current",
            Self::Mirror { .. } => "mirror",
            Self::ReplaceItem { .. } => "replace_item",
            Self::FullSync { .. } => "full_sync",
        }
    }

    /// Whether this delta is a full snapshot.
    #[must_use]
    pub const fn is_full_sync(&self) -> bool {
        matches!(self, Self::FullSync { .. })
    }
}
