//! Authoritative queue holder.
//!
//! [`QueueAuthority`] is the transport-agnostic half of a room: the server
//! keeps one per session and a peer-mode host keeps one for its mesh. It
//! validates versions, runs the shared reducer and produces the events to
//! fan out. Callers serialize access; the authority itself is not shared.

use std::collections::HashSet;

use crate::delta::QueueDelta;
use crate::error::{QueueError, QueueResult};
use crate::event::QueueEvent;
use crate::model::{QueueItem, QueueState};
use crate::reducer;

/// Who issued a mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Origin {
    /// Client id of the issuer.
    pub client_id: Option<String>,
    /// Issuer's correlation id.
    pub correlation_id: Option<String>,
}

impl Origin {
    /// Origin for a client mutation.
    #[must_use]
    pub fn client(client_id: impl Into<String>, correlation_id: Option<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            correlation_id,
        }
    }
}

/// Result of committing a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Event to publish; `None` when the delta was a no-op.
    pub event: Option<QueueEvent>,
    /// Sequence after the commit.
    pub sequence: u64,
    /// Hash after the commit.
    pub state_hash: String,
}

impl Commit {
    /// Whether the delta changed state.
    #[must_use]
    pub fn applied(&self) -> bool {
        self.event.is_some()
    }
}

/// Versioned owner of one queue.
#[derive(Debug, Clone, Default)]
pub struct QueueAuthority {
    state: QueueState,
}

impl QueueAuthority {
    /// Empty authority at sequence zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Authority that adopts an existing snapshot.
    #[must_use]
    pub fn from_state(state: QueueState) -> Self {
        Self {
            state: QueueState::from_parts(state.queue, state.current_item, state.sequence),
        }
    }

    /// Current authoritative state.
    #[must_use]
    pub fn state(&self) -> &QueueState {
        &self.state
    }

    /// Current sequence.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.state.sequence
    }

    /// Full sync event for the current state.
    #[must_use]
    pub fn snapshot(&self) -> QueueEvent {
        QueueEvent::full_sync(self.state.clone())
    }

    /// Whether nothing has been written yet.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        self.state.sequence == 0 && self.state.queue.is_empty() && self.state.current_item.is_none()
    }

    /// Replace queue and current item if `expected` matches.
    ///
    /// Always bumps the sequence by one.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::VersionConflict`] when `expected` is stale and
    /// [`QueueError::InvalidInput`] when `queue` repeats an item uuid.
    pub fn update(
        &mut self,
        queue: Vec<QueueItem>,
        current_item: Option<QueueItem>,
        expected: Option<u64>,
    ) -> QueueResult<&QueueState> {
        self.check_version(expected)?;
        check_unique(&queue)?;
        self.state = QueueState::from_parts(queue, current_item, self.state.sequence + 1);
        Ok(&self.state)
    }

    /// Replace the queue, keeping the current item.
    ///
    /// # Errors
    ///
    /// See [`QueueAuthority::update`].
    pub fn update_queue_only(
        &mut self,
        queue: Vec<QueueItem>,
        expected: Option<u64>,
    ) -> QueueResult<&QueueState> {
        let current = self.state.current_item.clone();
        self.update(queue, current, expected)
    }

    /// Apply `delta` if `expected` matches the current sequence.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::VersionConflict`] on a stale `expected`,
    /// [`QueueError::InvalidInput`] for a client-issued full sync and
    /// [`QueueError::Rejected`] when the reducer rejects the delta.
    pub fn commit_delta(
        &mut self,
        delta: &QueueDelta,
        expected: u64,
        origin: &Origin,
    ) -> QueueResult<Commit> {
        if delta.is_full_sync() {
            return Err(QueueError::InvalidInput(
                "full sync cannot be submitted as a delta".to_string(),
            ));
        }
        self.check_version(Some(expected))?;

        let changed = reducer::apply_mut(&mut self.state, delta)?;
        let event = changed.then(|| QueueEvent::Delta {
            sequence: self.state.sequence,
            state_hash: self.state.state_hash.clone(),
            delta: delta.clone(),
            client_id: origin.client_id.clone(),
            correlation_id: origin.correlation_id.clone(),
        });
        Ok(Commit {
            event,
            sequence: self.state.sequence,
            state_hash: self.state.state_hash.clone(),
        })
    }

    /// Apply `delta` against whatever the current sequence is.
    ///
    /// # Errors
    ///
    /// See [`QueueAuthority::commit_delta`].
    pub fn apply_delta(&mut self, delta: &QueueDelta, origin: &Origin) -> QueueResult<Commit> {
        let expected = self.state.sequence;
        self.commit_delta(delta, expected, origin)
    }

    fn check_version(&self, expected: Option<u64>) -> QueueResult<()> {
        match expected {
            Some(expected) if expected != self.state.sequence => Err(QueueError::VersionConflict {
                expected,
                actual: self.state.sequence,
            }),
            _ => Ok(()),
        }
    }
}

fn check_unique(queue: &[QueueItem]) -> QueueResult<()> {
    let mut seen = HashSet::with_capacity(queue.len());
    for item in queue {
        if !seen.insert(item.uuid.as_str()) {
            return Err(QueueError::InvalidInput(format!(
                "duplicate queue item {}",
                item.uuid
            )));
        }
    }
    Ok(())
}
