//! The conversation loop.
//!
//! One call to [`ConversationOrchestrator::run_turn`] handles a user message:
//! - request the backend (with the todo reminder on the last user message)
//! - extract text and tool calls, failing closed on a malformed call
//! - gate and execute the batch, append results, repeat
//! - on cancellation, pair every open call with a synthetic result.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error_taxonomy::{ErrorCategory, ErrorEnvelope, ErrorSeverity};
use crate::logging;
use crate::models::{
    ConversationEntry, EntryKind, EntryStatus, Message, ToolCall, Usage, UsageCounters,
};

use super::capabilities::Capabilities;
use super::events::{Event, TurnOutcomeStatus};
use super::executor::{BatchError, ToolExecutor};
use super::request::{RequestError, RequestExecutor};
use super::stream::ProgressFn;

pub const INTERRUPTED_TOOL_RESULT: &str = "Interrupted by user";
pub const INTERRUPTED_ASSISTANT_MESSAGE: &str = "Process interrupted by user.";

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnOutcomeStatus,
    /// Operator-facing error text, set only for session-visible failures.
    pub error: Option<String>,
    /// Why a failed turn failed, visible or not.
    pub failure: Option<ErrorEnvelope>,
    pub usage: Usage,
}

impl TurnOutcome {
    fn new(status: TurnOutcomeStatus) -> Self {
        Self {
            status,
            error: None,
            failure: None,
            usage: Usage::default(),
        }
    }

    fn failed(envelope: ErrorEnvelope) -> Self {
        Self {
            error: envelope.session_visible.then(|| envelope.message.clone()),
            failure: Some(envelope),
            ..Self::new(TurnOutcomeStatus::Failed)
        }
    }

    /// Error code of a failed turn.
    #[must_use]
    pub fn failure_code(&self) -> Option<&str> {
        self.failure.as_ref().map(|failure| failure.code.as_str())
    }
}

/// Result of one request-turn: keep looping or stop with an outcome.
enum Step {
    Continue,
    Stop(TurnOutcome),
}

/// Text and calls pulled from an assembled response.
#[derive(Debug, Default, PartialEq)]
struct Extracted {
    display: String,
    tool_calls: Vec<ToolCall>,
}

/// Collect display text and tool calls. A single malformed call rejects the response.
fn extract(messages: &[Message]) -> Result<Extracted, String> {
    let mut extracted = Extracted::default();
    for message in messages {
        extracted.display.push_str(&message.content().text());
        for call in message.tool_calls() {
            if !call.is_well_formed() {
                return Err(format!(
                    "Malformed tool call in response (index {}): missing id or name",
                    call.index
                        .map_or_else(|| "?".to_string(), |index| index.to_string())
                ));
            }
            extracted.tool_calls.push(call.clone());
        }
    }
    Ok(extracted)
}

/// Copy of `transcript` with `block` appended to the last user message only.
fn augment_last_user(transcript: &[Message], block: &str) -> Vec<Message> {
    let mut request = transcript.to_vec();
    if let Some(Message::User { content }) = request
        .iter_mut()
        .rev()
        .find(|message| matches!(message, Message::User { .. }))
    {
        *content = content.with_appended_text(block);
    }
    request
}

// === ConversationOrchestrator ===

pub struct ConversationOrchestrator {
    requests: RequestExecutor,
    tools: ToolExecutor,
    capabilities: Arc<dyn Capabilities>,
    tx_event: mpsc::Sender<Event>,
    transcript: Vec<Message>,
    usage: UsageCounters,
    cancel_token: CancellationToken,
    shared_cancel_token: Arc<StdMutex<CancellationToken>>,
    max_steps: u32,
}

impl ConversationOrchestrator {
    pub fn new(
        requests: RequestExecutor,
        tools: ToolExecutor,
        capabilities: Arc<dyn Capabilities>,
        tx_event: mpsc::Sender<Event>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        Self {
            requests,
            tools,
            capabilities,
            tx_event,
            transcript: Vec::new(),
            usage: UsageCounters::default(),
            shared_cancel_token: Arc::new(StdMutex::new(cancel_token.clone())),
            cancel_token,
            max_steps: crate::config::DEFAULT_MAX_STEPS,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.transcript.insert(0, Message::system(prompt));
        self
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Model used for the next request.
    #[must_use]
    pub fn model(&self) -> &str {
        self.requests.model()
    }

    /// Switch models for subsequent requests. Usage already recorded stays
    /// under the model that produced it.
    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        logging::info(format!("Switching model to {model}"));
        self.requests.set_model(model);
    }

    #[must_use]
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    #[must_use]
    pub fn usage(&self) -> &UsageCounters {
        &self.usage
    }

    #[must_use]
    pub fn tools(&self) -> &ToolExecutor {
        &self.tools
    }

    /// Handle for cancelling whichever request-turn is in flight.
    #[must_use]
    pub fn shared_cancel_token(&self) -> Arc<StdMutex<CancellationToken>> {
        self.shared_cancel_token.clone()
    }

    /// Cancel the in-flight request-turn, if any.
    pub fn cancel(&self) {
        match self.shared_cancel_token.lock() {
            Ok(token) => token.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    fn reset_cancel_token(&mut self) {
        let token = CancellationToken::new();
        self.cancel_token = token.clone();
        match self.shared_cancel_token.lock() {
            Ok(mut shared) => *shared = token,
            Err(poisoned) => *poisoned.into_inner() = token,
        }
    }

    async fn emit(&self, event: Event) {
        let _ = self.tx_event.send(event).await;
    }

    /// Run one user turn to completion, interruption, or failure.
    pub async fn run_turn(&mut self, input: impl Into<String>) -> TurnOutcome {
        let input = input.into();
        // An interruption requested while idle does not carry into this turn.
        self.capabilities.clear_interruption();
        let turn_id = uuid::Uuid::new_v4().to_string();
        self.emit(Event::TurnStarted {
            turn_id: turn_id.clone(),
        })
        .await;
        self.emit(Event::entry(ConversationEntry::new(EntryKind::User, &input)))
            .await;
        self.transcript.push(Message::user(input));

        let mut turn_usage = Usage::default();
        let mut outcome = None;
        for step in 1..=self.max_steps {
            logging::debug(format!("Turn {turn_id}: step {step}"));
            match self.step(&mut turn_usage).await {
                Step::Continue => {}
                Step::Stop(done) => {
                    outcome = Some(done);
                    break;
                }
            }
        }

        let mut outcome = outcome.unwrap_or_else(|| {
            self.fail(ErrorEnvelope::new(
                ErrorCategory::Limit,
                ErrorSeverity::Warning,
                "turn_step_limit",
                format!("Stopped after reaching the limit of {} steps", self.max_steps),
            ))
        });
        if let Some(failure) = &outcome.failure
            && let Some(message) = &outcome.error
        {
            self.emit(Event::error(message.clone(), failure.recoverable))
                .await;
        }
        outcome.usage = turn_usage;

        self.emit(Event::TurnComplete {
            usage: turn_usage,
            status: outcome.status,
            error: outcome.error.clone(),
        })
        .await;
        outcome
    }

    async fn step(&mut self, turn_usage: &mut Usage) -> Step {
        self.reset_cancel_token();
        let cancel = self.cancel_token.clone();

        let request = match self.capabilities.outstanding_tasks().await {
            Some(block) => augment_last_user(&self.transcript, &block),
            None => self.transcript.clone(),
        };
        let tool_schemas = self.tools.registry().to_api_tools();

        let model = self.requests.model().to_string();
        let progress_tx = self.tx_event.clone();
        let progress_model = model.clone();
        let on_progress: ProgressFn = Arc::new(move |completion_tokens| {
            let _ = progress_tx.try_send(Event::TokenProgress {
                model: progress_model.clone(),
                completion_tokens,
            });
        });

        let response = match self
            .requests
            .execute(&request, &tool_schemas, &cancel, Some(on_progress))
            .await
        {
            Ok(response) => response,
            Err(RequestError::Cancelled) => return Step::Stop(self.repair_interrupted(&[]).await),
            Err(err) => return Step::Stop(self.fail(ErrorEnvelope::from(err))),
        };

        if let Some(usage) = response.usage {
            self.usage.record(&model, usage);
            *turn_usage += usage;
        }

        let extracted = match extract(&response.messages) {
            Ok(extracted) => extracted,
            Err(reason) => {
                self.emit(Event::status(reason.clone())).await;
                return Step::Stop(self.fail(ErrorEnvelope::new(
                    ErrorCategory::Validation,
                    ErrorSeverity::Error,
                    "response_malformed_tool_call",
                    reason,
                )));
            }
        };

        if !extracted.display.is_empty() {
            self.emit(Event::entry(ConversationEntry::new(
                EntryKind::Assistant,
                &extracted.display,
            )))
            .await;
        }
        self.transcript.extend(response.messages);

        if self.interrupted(&cancel) {
            return Step::Stop(self.repair_interrupted(&extracted.tool_calls).await);
        }
        if extracted.tool_calls.is_empty() {
            return Step::Stop(TurnOutcome::new(TurnOutcomeStatus::Completed));
        }

        match self.tools.run_batch(&extracted.tool_calls, &cancel).await {
            Ok(results) => {
                self.transcript.extend(results);
                if self.interrupted(&cancel) {
                    return Step::Stop(self.repair_interrupted(&[]).await);
                }
                Step::Continue
            }
            Err(BatchError::Cancelled) => {
                Step::Stop(self.repair_interrupted(&extracted.tool_calls).await)
            }
            Err(err) => {
                let envelope = ErrorEnvelope::from(err.clone());
                match err {
                    BatchError::Denied {
                        tool_name,
                        rejections,
                    } => {
                        self.transcript.extend(rejections);
                        self.emit(Event::status(format!("Tool calls rejected at {tool_name}")))
                            .await;
                    }
                    BatchError::AllFailed { results, .. } => {
                        self.transcript.extend(results);
                        self.emit(Event::status(envelope.message.clone())).await;
                    }
                    BatchError::InvalidToolCall { .. } | BatchError::Cancelled => {}
                }
                Step::Stop(self.fail(envelope))
            }
        }
    }

    fn interrupted(&self, cancel: &CancellationToken) -> bool {
        cancel.is_cancelled() || self.capabilities.interruption_requested()
    }

    fn fail(&self, envelope: ErrorEnvelope) -> TurnOutcome {
        let line = format!("Turn failed [{}]: {}", envelope.code, envelope.message);
        match envelope.severity {
            ErrorSeverity::Info | ErrorSeverity::Warning => logging::warn(line),
            ErrorSeverity::Error | ErrorSeverity::Critical => logging::error(line),
        }
        TurnOutcome::failed(envelope)
    }

    /// Pair each open call with an interruption result, then close the turn.
    async fn repair_interrupted(&mut self, open_calls: &[ToolCall]) -> TurnOutcome {
        for call in open_calls {
            self.transcript
                .push(Message::tool_result(&call.id, INTERRUPTED_TOOL_RESULT));
        }
        self.transcript
            .push(Message::assistant(INTERRUPTED_ASSISTANT_MESSAGE));
        self.capabilities.clear_interruption();

        logging::info(format!(
            "Turn interrupted with {} open tool call(s)",
            open_calls.len()
        ));
        self.emit(Event::entry(
            ConversationEntry::new(EntryKind::Assistant, INTERRUPTED_ASSISTANT_MESSAGE)
                .with_status(EntryStatus::Error),
        ))
        .await;
        TurnOutcome::new(TurnOutcomeStatus::Interrupted)
    }
}
