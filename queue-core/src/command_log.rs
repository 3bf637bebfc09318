//! # Local Command Log
//!
//! Optimistic local actions waiting for the authority.
//!
//! ```text
//! 1. A local action is applied to the view and logged
//! 2. When live: the command is sent and marked in flight
//! 3. When offline or a send fails: the command stays unsent
//! 4. On reconnect: unsent commands are replayed in order
//! 5. The matching event, ack or error retires the command
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::delta::QueueDelta;

/// Default maximum number of logged commands.
pub const DEFAULT_MAX_COMMANDS: usize = 1000;

/// A local action awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Correlation id sent as `message_id`.
    pub correlation_id: String,
    /// The delta applied optimistically.
    pub delta: QueueDelta,
    /// Whether the command has been handed to the transport.
    pub sent: bool,
    /// Sequence acknowledged by the authority, if acked before its event.
    pub acked_sequence: Option<u64>,
}

impl PendingCommand {
    /// New unsent command with a fresh correlation id.
    #[must_use]
    pub fn new(delta: QueueDelta) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            delta,
            sent: false,
            acked_sequence: None,
        }
    }
}

/// Ordered log of pending commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandLog {
    /// Commands in issue order.
    pending: VecDeque<PendingCommand>,
    /// Maximum log size (oldest commands dropped when exceeded).
    max_size: usize,
}

impl CommandLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_COMMANDS)
    }

    /// Create a log with a custom max size.
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// Append a command, dropping the oldest at capacity.
    pub fn enqueue(&mut self, command: PendingCommand) {
        if self.pending.len() >= self.max_size {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(
                    correlation_id = %dropped.correlation_id,
                    kind = dropped.delta.kind(),
                    "Command log full, dropping oldest command"
                );
            }
        }
        self.pending.push_back(command);
    }

    /// Number of pending commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Peek at pending commands in order.
    #[must_use]
    pub fn pending(&self) -> &VecDeque<PendingCommand> {
        &self.pending
    }

    /// Commands not yet handed to the transport.
    pub fn unsent(&self) -> impl Iterator<Item = &PendingCommand> {
        self.pending.iter().filter(|c| !c.sent)
    }

    /// Mark a command as sent.
    pub fn mark_sent(&mut self, correlation_id: &str) {
        if let Some(command) = self.find_mut(correlation_id) {
            command.sent = true;
        }
    }

    /// Record an ack that arrived before the command's event.
    pub fn mark_acked(&mut self, correlation_id: &str, sequence: u64) {
        if let Some(command) = self.find_mut(correlation_id) {
            command.acked_sequence = Some(sequence);
        }
    }

    /// Mark one command unsent so the next flush sends it again.
    pub fn mark_unsent(&mut self, correlation_id: &str) {
        if let Some(command) = self.find_mut(correlation_id) {
            command.sent = false;
            command.acked_sequence = None;
        }
    }

    /// Mark every command unsent so it is replayed after a reconnect.
    pub fn mark_all_unsent(&mut self) {
        for command in &mut self.pending {
            command.sent = false;
            command.acked_sequence = None;
        }
    }

    /// Remove a command. Returns it if it was pending.
    pub fn retire(&mut self, correlation_id: &str) -> Option<PendingCommand> {
        let idx = self
            .pending
            .iter()
            .position(|c| c.correlation_id == correlation_id)?;
        self.pending.remove(idx)
    }

    /// Remove acked commands whose sequence is already confirmed.
    pub fn retire_confirmed(&mut self, confirmed_sequence: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|c| c.acked_sequence.map_or(true, |seq| seq > confirmed_sequence));
        before - self.pending.len()
    }

    fn find_mut(&mut self, correlation_id: &str) -> Option<&mut PendingCommand> {
        self.pending
            .iter_mut()
            .find(|c| c.correlation_id == correlation_id)
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new()
    }
}
