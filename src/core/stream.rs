//! Reassembles assistant messages from a stream of partial updates.
//!
//! One buffer is kept per choice index. Text is concatenated in arrival
//! order; tool-call fragments are merged by their own index, with ids and
//! names only ever overwritten by non-empty values and argument text only
//! ever appended.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm_client::{BackendError, ChoiceDelta, PartialUpdate, UpdateStream};
use crate::models::{Content, Message, ToolArguments, ToolCall, Usage};

/// Finish reason that terminates the stream as a backend error.
pub const FINISH_REASON_ERROR: &str = "error";

/// Token-progress callback, invoked with each new completion-token high-water mark.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

// === Errors ===

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The stream ended without yielding a single choice.
    #[error("no response from backend")]
    NoResponse,
    /// Choices arrived but none carried text or tool calls.
    #[error("unexpected response format from backend")]
    UnexpectedFormat,
    /// The backend signalled an error in-band.
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Transport(BackendError),
    #[error("request cancelled")]
    Cancelled,
}

impl From<BackendError> for StreamError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Cancelled => Self::Cancelled,
            other => Self::Transport(other),
        }
    }
}

// === Types ===

/// Completed output of one streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledResponse {
    pub messages: Vec<Message>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    content: String,
    tool_calls: BTreeMap<u32, ToolCall>,
}

impl StreamBuffer {
    fn is_empty(&self) -> bool {
        self.content.is_empty() && self.tool_calls.is_empty()
    }

    fn into_message(self) -> Message {
        Message::Assistant {
            content: Content::Text(self.content),
            tool_calls: self.tool_calls.into_values().collect(),
        }
    }
}

/// Incremental assembler for one backend response.
#[derive(Default)]
pub struct StreamAssembler {
    buffers: BTreeMap<u32, StreamBuffer>,
    usage: Option<Usage>,
    completion_high_water: u64,
    error: Option<String>,
    on_progress: Option<ProgressFn>,
}

impl StreamAssembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Feed one update. Returns `false` once the stream has errored and
    /// nothing further should be consumed.
    pub fn push(&mut self, update: PartialUpdate) -> bool {
        if self.error.is_some() {
            return false;
        }

        if let Some(message) = update.error {
            self.error = Some(message);
            return false;
        }
        if let Some(choice) = update
            .choices
            .iter()
            .find(|choice| choice.finish_reason.as_deref() == Some(FINISH_REASON_ERROR))
        {
            self.error = Some(error_message_for(choice));
            return false;
        }

        if let Some(usage) = update.usage {
            self.observe_usage(usage);
        }

        for choice in update.choices {
            let buffer = self.buffers.entry(choice.index).or_default();

            if let Some(text) = choice.content {
                buffer.content.push_str(&text);
            }

            for delta in choice.tool_calls {
                let call = buffer
                    .tool_calls
                    .entry(delta.index)
                    .or_insert_with(|| ToolCall {
                        index: Some(delta.index),
                        ..ToolCall::default()
                    });
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
                if let Some(name) = delta.name.filter(|name| !name.is_empty()) {
                    call.name = name;
                }
                if let Some(fragment) = delta.arguments
                    && let ToolArguments::Raw(raw) = &mut call.arguments
                {
                    raw.push_str(&fragment);
                }
            }
        }

        true
    }

    fn observe_usage(&mut self, usage: Usage) {
        if usage.completion_tokens < self.completion_high_water {
            return;
        }
        if usage.completion_tokens > self.completion_high_water {
            self.completion_high_water = usage.completion_tokens;
            if let Some(on_progress) = &self.on_progress {
                on_progress(usage.completion_tokens);
            }
        }
        self.usage = Some(usage);
    }

    /// Resolve the buffered state into messages or one of the terminal errors.
    pub fn finish(self) -> Result<AssembledResponse, StreamError> {
        if let Some(message) = self.error {
            return Err(StreamError::Backend(message));
        }
        if self.buffers.is_empty() {
            return Err(StreamError::NoResponse);
        }

        let messages: Vec<Message> = self
            .buffers
            .into_values()
            .filter(|buffer| !buffer.is_empty())
            .map(StreamBuffer::into_message)
            .collect();
        if messages.is_empty() {
            return Err(StreamError::UnexpectedFormat);
        }

        Ok(AssembledResponse {
            messages,
            usage: self.usage,
        })
    }

    /// Drain `stream` until it ends, errors, or `cancel` fires.
    pub async fn assemble(
        mut self,
        mut stream: UpdateStream,
        cancel: &CancellationToken,
    ) -> Result<AssembledResponse, StreamError> {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StreamError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Ok(update)) => {
                    if !self.push(update) {
                        break;
                    }
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
        self.finish()
    }
}

fn error_message_for(choice: &ChoiceDelta) -> String {
    match choice.content.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => format!("choice {} finished with an error", choice.index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::ToolCallDelta;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn assemble_all(updates: Vec<PartialUpdate>) -> Result<AssembledResponse, StreamError> {
        let mut assembler = StreamAssembler::new();
        for update in updates {
            if !assembler.push(update) {
                break;
            }
        }
        assembler.finish()
    }

    fn first_text(response: &AssembledResponse) -> String {
        response.messages[0].content().text()
    }

    fn args_fragment(index: u32, fragment: &str) -> ToolCallDelta {
        ToolCallDelta {
            index,
            arguments: Some(fragment.to_string()),
            ..ToolCallDelta::default()
        }
    }

    #[test]
    fn text_is_concatenated_in_event_order() {
        let forward = assemble_all(vec![
            PartialUpdate::text(0, "Hello, "),
            PartialUpdate::text(0, "world"),
        ])
        .unwrap();
        let reversed = assemble_all(vec![
            PartialUpdate::text(0, "world"),
            PartialUpdate::text(0, "Hello, "),
        ])
        .unwrap();

        assert_eq!(first_text(&forward), "Hello, world");
        assert_eq!(first_text(&reversed), "worldHello, ");
        assert_ne!(forward, reversed);
    }

    #[test]
    fn tool_call_arguments_are_appended() {
        let response = assemble_all(vec![
            PartialUpdate::tool_call(
                0,
                ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("read_file".to_string()),
                    arguments: Some("{\"a\":".to_string()),
                },
            ),
            PartialUpdate::tool_call(0, args_fragment(0, "1}")),
        ])
        .unwrap();

        let calls = response.messages[0].tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].name, "read_file");
        assert_eq!(
            calls[0].arguments,
            ToolArguments::Raw("{\"a\":1}".to_string())
        );
        assert_eq!(calls[0].index, Some(0));
    }

    #[test]
    fn empty_id_and_name_never_blank_out_earlier_values() {
        let response = assemble_all(vec![
            PartialUpdate::tool_call(
                0,
                ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("exec_shell".to_string()),
                    arguments: None,
                },
            ),
            PartialUpdate::tool_call(
                0,
                ToolCallDelta {
                    index: 0,
                    id: Some(String::new()),
                    name: Some(String::new()),
                    arguments: Some("{}".to_string()),
                },
            ),
        ])
        .unwrap();

        let call = &response.messages[0].tool_calls()[0];
        assert_eq!(call.id, "call_1");
        assert_eq!(call.name, "exec_shell");
    }

    #[test]
    fn interleaved_tool_calls_merge_by_index() {
        let start = |index: u32, id: &str| ToolCallDelta {
            index,
            id: Some(id.to_string()),
            name: Some("list_dir".to_string()),
            arguments: None,
        };
        let response = assemble_all(vec![
            PartialUpdate::tool_call(0, start(0, "a")),
            PartialUpdate::tool_call(0, start(1, "b")),
            PartialUpdate::tool_call(0, args_fragment(1, "{\"path\":\"src\"}")),
            PartialUpdate::tool_call(0, args_fragment(0, "{\"path\":\".\"}")),
        ])
        .unwrap();

        let calls = response.messages[0].tool_calls();
        assert_eq!(calls[0].id, "a");
        assert_eq!(
            calls[0].arguments,
            ToolArguments::Raw("{\"path\":\".\"}".to_string())
        );
        assert_eq!(calls[1].id, "b");
        assert_eq!(
            calls[1].arguments,
            ToolArguments::Raw("{\"path\":\"src\"}".to_string())
        );
    }

    #[test]
    fn separate_choices_produce_separate_messages() {
        let response = assemble_all(vec![
            PartialUpdate::text(1, "second"),
            PartialUpdate::text(0, "first"),
        ])
        .unwrap();
        assert_eq!(response.messages.len(), 2);
        assert_eq!(response.messages[0].content().text(), "first");
        assert_eq!(response.messages[1].content().text(), "second");
    }

    #[test]
    fn error_finish_reason_stops_consumption() {
        let mut assembler = StreamAssembler::new();
        assert!(assembler.push(PartialUpdate::text(0, "partial")));

        let mut failing = PartialUpdate::finish(0, FINISH_REASON_ERROR);
        failing.usage = Some(Usage::new(1, 1, 2));
        assert!(!assembler.push(failing));
        assert!(!assembler.push(PartialUpdate::text(0, " more")));

        match assembler.finish() {
            Err(StreamError::Backend(message)) => assert!(message.contains("choice 0")),
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[test]
    fn in_band_error_payload_is_terminal() {
        let result = assemble_all(vec![
            PartialUpdate::text(0, "hi"),
            PartialUpdate {
                error: Some("overloaded".to_string()),
                ..PartialUpdate::default()
            },
        ]);
        assert_eq!(result, Err(StreamError::Backend("overloaded".to_string())));
    }

    #[test]
    fn zero_choices_is_no_response() {
        let result = assemble_all(vec![PartialUpdate::usage(Usage::new(3, 0, 3))]);
        assert_eq!(result, Err(StreamError::NoResponse));
        assert_eq!(assemble_all(Vec::new()), Err(StreamError::NoResponse));
    }

    #[test]
    fn empty_choices_are_unexpected_format() {
        let result = assemble_all(vec![
            PartialUpdate::text(0, ""),
            PartialUpdate::finish(0, "stop"),
        ]);
        assert_eq!(result, Err(StreamError::UnexpectedFormat));
    }

    #[test]
    fn token_progress_is_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut assembler = StreamAssembler::new().with_progress(Arc::new(move |tokens| {
            sink.lock().unwrap().push(tokens);
        }));

        assembler.push(PartialUpdate::text(0, "a"));
        for completion in [2, 2, 5, 4, 9] {
            assembler.push(PartialUpdate::usage(Usage::new(10, completion, 10 + completion)));
        }

        assert_eq!(*seen.lock().unwrap(), vec![2, 5, 9]);
        let response = assembler.finish().unwrap();
        assert_eq!(response.usage, Some(Usage::new(10, 9, 19)));
    }

    #[tokio::test]
    async fn assemble_returns_cancelled_when_token_fires() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stream: UpdateStream = Box::pin(futures_util::stream::pending::<Result<PartialUpdate, BackendError>>());
        let result = StreamAssembler::new().assemble(stream, &cancel).await;
        assert_eq!(result, Err(StreamError::Cancelled));
    }

    #[tokio::test]
    async fn assemble_surfaces_mid_stream_transport_errors() {
        let cancel = CancellationToken::new();
        let stream: UpdateStream = Box::pin(futures_util::stream::iter(vec![
            Ok(PartialUpdate::text(0, "partial")),
            Err(BackendError::Transport("connection reset".to_string())),
        ]));
        let result = StreamAssembler::new().assemble(stream, &cancel).await;
        assert_eq!(
            result,
            Err(StreamError::Transport(BackendError::Transport(
                "connection reset".to_string()
            )))
        );
    }
}
