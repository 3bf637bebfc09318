//! Queue state transition function.
//!
//! [`apply`] is the single reducer shared by the authority and by every
//! client replica, so local and remote mutations have identical semantics.
//!
//! A delta that leaves `queue` and `current_item` unchanged is a no-op and
//! does not bump `sequence`. A delta that changes content bumps `sequence`
//! by exactly one and recomputes `state_hash`.

use crate::delta::QueueDelta;
use crate::error::{QueueError, QueueResult};
use crate::model::{QueueItem, QueueState};

/// Apply `delta` to `state`, returning the next state.
///
/// # Errors
///
/// Returns [`QueueError::Rejected`] when a reorder does not find `uuid` at
/// `old_index`. The caller must resync.
pub fn apply(state: &QueueState, delta: &QueueDelta) -> QueueResult<QueueState> {
    let mut next = state.clone();
    apply_mut(&mut next, delta)?;
    Ok(next)
}

/// Apply `delta` in place. Returns `true` if the state changed.
///
/// On error `state` is left untouched.
///
/// # Errors
///
/// See [`apply`].
pub fn apply_mut(state: &mut QueueState, delta: &QueueDelta) -> QueueResult<bool> {
    if let QueueDelta::FullSync { state: incoming } = delta {
        if incoming.sequence < state.sequence {
            tracing::debug!(
                incoming = incoming.sequence,
                local = state.sequence,
                "Ignoring stale full sync"
            );
            return Ok(false);
        }
        let replacement = QueueState::from_parts(
            incoming.queue.clone(),
            incoming.current_item.clone(),
            incoming.sequence,
        );
        let changed = *state != replacement;
        *state = replacement;
        return Ok(changed);
    }

    let mut queue = state.queue.clone();
    let mut current = state.current_item.clone();
    mutate(&mut queue, &mut current, delta)?;

    if queue == state.queue && current == state.current_item {
        return Ok(false);
    }

    state.queue = queue;
    state.current_item = current;
    state.sequence += 1;
    state.rehash();
    Ok(true)
}

fn mutate(
    queue: &mut Vec<QueueItem>,
    current: &mut Option<QueueItem>,
    delta: &QueueDelta,
) -> QueueResult<()> {
    match delta {
        QueueDelta::AddItem { item, position } => {
            if queue.iter().any(|q| q.uuid == item.uuid) {
                return Ok(());
            }
            match position {
                Some(pos) if *pos <= queue.len() => queue.insert(*pos, item.clone()),
                _ => queue.push(item.clone()),
            }
        }
        QueueDelta::RemoveItem { uuid } => {
            queue.retain(|q| q.uuid != *uuid);
            if current.as_ref().is_some_and(|c| c.uuid == *uuid) {
                *current = None;
            }
        }
        QueueDelta::ReorderItem {
            uuid,
            old_index,
            new_index,
        } => {
            match queue.get(*old_index) {
                Some(found) if found.uuid == *uuid => {}
                Some(found) => {
                    return Err(QueueError::Rejected(format!(
                        "expected {uuid} at index {old_index}, found {}",
                        found.uuid
                    )))
                }
                None => {
                    return Err(QueueError::Rejected(format!(
                        "index {old_index} out of range for queue of {}",
                        queue.len()
                    )))
                }
            }
            let moved = queue.remove(*old_index);
            let target = (*new_index).min(queue.len());
            queue.insert(target, moved);
        }
        QueueDelta::SetCurrent {
            item,
            should_add_to_queue,
        } => {
            if let Some(next) = item {
                let absent = !queue.iter().any(|q| q.uuid == next.uuid);
                // Non-suggested current items must be queued.
                if absent && (*should_add_to_queue || !next.suggested) {
                    let after_current = current
                        .as_ref()
                        .and_then(|c| queue.iter().position(|q| q.uuid == c.uuid));
                    match after_current {
                        Some(idx) => queue.insert(idx + 1, next.clone()),
                        None => queue.push(next.clone()),
                    }
                }
            }
            current.clone_from(item);
        }
        QueueDelta::Mirror { mirrored } => {
            if let Some(cur) = current.as_mut() {
                cur.climb.mirrored = *mirrored;
                if let Some(queued) = queue.iter_mut().find(|q| q.uuid == cur.uuid) {
                    queued.climb.mirrored = *mirrored;
                }
            }
        }
        QueueDelta::ReplaceItem { uuid, item } => {
            let Some(slot) = queue.iter_mut().find(|q| q.uuid == *uuid) else {
                return Ok(());
            };
            *slot = item.clone();
            if current.as_ref().is_some_and(|c| c.uuid == *uuid) {
                *current = Some(item.clone());
            }
        }
        QueueDelta::FullSync { .. } => {}
    }
    Ok(())
}
