//! Events emitted by the core engine to the UI.
//!
//! These events flow from the engine to the front end via a channel,
//! enabling non-blocking, real-time updates.

use crate::models::{ConversationEntry, EntryLog, EntryStatus, Usage};

/// Final status for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcomeStatus {
    Completed,
    Interrupted,
    Failed,
}

/// Events emitted by the engine to update the UI.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // === Entry Events ===
    /// A transcript entry was created
    EntryAdded { entry: ConversationEntry },

    /// An existing entry changed status
    EntryStatus { id: String, status: EntryStatus },

    // === Streaming Events ===
    /// Completion tokens observed so far for the in-flight response
    TokenProgress {
        model: String,
        completion_tokens: u64,
    },

    // === Approval Events ===
    /// A tool call needs an operator decision
    ApprovalRequired {
        id: String,
        tool_name: String,
        description: String,
    },

    // === Turn Lifecycle ===
    /// A new turn has started (user sent a message)
    TurnStarted { turn_id: String },

    /// The turn is complete (no more tool calls)
    TurnComplete {
        usage: Usage,
        status: TurnOutcomeStatus,
        error: Option<String>,
    },

    // === System Events ===
    /// An error occurred
    Error { message: String, recoverable: bool },

    /// Status message for UI display
    Status { message: String },
}

impl Event {
    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Error {
            message: message.into(),
            recoverable,
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn entry(entry: ConversationEntry) -> Self {
        Self::EntryAdded { entry }
    }
}

impl EntryLog {
    /// Fold an engine event into the entry list. Non-entry events are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::EntryAdded { entry } => self.push(entry.clone()),
            Event::EntryStatus { id, status } => {
                self.patch_status(id, *status);
            }
            _ => {}
        }
    }
}
