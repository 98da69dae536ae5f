//! Chat backend abstraction used by the engine.
//!
//! A backend turns a transcript plus tool schemas into a stream of
//! [`PartialUpdate`]s. Everything above this trait is provider-agnostic.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::models::{Message, ToolSchema, Usage};

// === Stream Updates ===

/// One incremental update from the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialUpdate {
    pub choices: Vec<ChoiceDelta>,
    pub usage: Option<Usage>,
    /// Error payload delivered in-band; terminal like `finish_reason == "error"`.
    pub error: Option<String>,
}

/// Delta for a single choice index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChoiceDelta {
    pub index: u32,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallDelta>,
    pub finish_reason: Option<String>,
}

/// Fragment of a tool call, merged by `index`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

impl PartialUpdate {
    /// Text delta for `choice`.
    pub fn text(choice: u32, text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChoiceDelta {
                index: choice,
                content: Some(text.into()),
                ..ChoiceDelta::default()
            }],
            ..Self::default()
        }
    }

    /// Tool-call fragment for `choice`.
    pub fn tool_call(choice: u32, delta: ToolCallDelta) -> Self {
        Self {
            choices: vec![ChoiceDelta {
                index: choice,
                tool_calls: vec![delta],
                ..ChoiceDelta::default()
            }],
            ..Self::default()
        }
    }

    pub fn finish(choice: u32, reason: impl Into<String>) -> Self {
        Self {
            choices: vec![ChoiceDelta {
                index: choice,
                finish_reason: Some(reason.into()),
                ..ChoiceDelta::default()
            }],
            ..Self::default()
        }
    }

    /// Usage-only update.
    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }
}

// === Errors ===

/// Failure raised by a backend before or during streaming.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// Connection, timeout, or retryable HTTP status.
    #[error("transport error: {0}")]
    Transport(String),
    /// The backend deliberately refused the request.
    #[error("backend rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("request cancelled")]
    Cancelled,
}

impl BackendError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// === Backend Trait ===

pub type UpdateStream = Pin<Box<dyn Stream<Item = Result<PartialUpdate, BackendError>> + Send>>;

/// A chat backend capable of streaming responses.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Short provider identifier for logs.
    fn provider_name(&self) -> &'static str;

    /// Default model for new sessions.
    fn model(&self) -> &str;

    /// Open a streaming request for `transcript` against `model`.
    async fn send(
        &self,
        model: &str,
        transcript: &[Message],
        tools: &[ToolSchema],
        cancel: CancellationToken,
    ) -> Result<UpdateStream, BackendError>;
}
