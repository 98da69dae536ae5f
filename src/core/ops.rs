//! Operations submitted to a running session.

/// Requests the front end sends to the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Run a turn for this user message
    SendMessage { content: String },
    /// Use a different model from the next turn on
    SetModel { model: String },
    /// Stop the session task
    Shutdown,
}

impl Op {
    pub fn send(content: impl Into<String>) -> Self {
        Self::SendMessage {
            content: content.into(),
        }
    }
}
