//! Shared fixtures for the integration tests: a scripted backend, recording
//! tools, a scripted permission prompt and an orchestrator harness.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use deepseek_agent::config::RetryPolicy;
use deepseek_agent::core::capabilities::SessionCapabilities;
use deepseek_agent::core::permission::{FingerprintPolicy, PermissionDecision};
use deepseek_agent::core::{
    ConversationOrchestrator, Event, PermissionGate, PermissionPrompt, RequestExecutor,
    ToolExecutor,
};
use deepseek_agent::llm_client::{
    BackendError, ChatBackend, PartialUpdate, ToolCallDelta, UpdateStream,
};
use deepseek_agent::models::{Message, ToolCall, ToolSchema, Usage};
use deepseek_agent::tools::{
    SharedTodoList, ToolContext, ToolError, ToolRegistryBuilder, ToolResult, ToolSpec,
    new_shared_todo_list,
};

// === Backend ===

/// One scripted backend outcome.
pub enum Reply {
    Updates(Vec<PartialUpdate>),
    Fail(BackendError),
    /// A stream that never yields; only cancellation ends it.
    Hang,
}

/// Backend that replays `Reply`s in order and records every request.
pub struct ScriptedBackend {
    model: String,
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<Vec<Message>>>,
    models: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub fn new(model: &str, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Model named by each request, in order.
    pub fn models(&self) -> Vec<String> {
        self.models.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        model: &str,
        transcript: &[Message],
        _tools: &[ToolSchema],
        _cancel: CancellationToken,
    ) -> Result<UpdateStream, BackendError> {
        self.requests.lock().unwrap().push(transcript.to_vec());
        self.models.lock().unwrap().push(model.to_string());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Updates(updates)) => Ok(Box::pin(futures_util::stream::iter(
                updates.into_iter().map(Ok::<_, BackendError>),
            ))),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Hang) => Ok(Box::pin(futures_util::stream::pending::<
                Result<PartialUpdate, BackendError>,
            >())),
            None => Err(BackendError::Rejected {
                status: 400,
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// A plain text response.
pub fn text_reply(text: &str) -> Reply {
    Reply::Updates(vec![
        PartialUpdate::text(0, text),
        PartialUpdate::finish(0, "stop"),
    ])
}

/// A text response carrying a usage report.
pub fn text_reply_with_usage(text: &str, usage: Usage) -> Reply {
    Reply::Updates(vec![
        PartialUpdate::text(0, text),
        PartialUpdate::finish(0, "stop"),
        PartialUpdate::usage(usage),
    ])
}

/// Tool-call deltas for `(id, name, arguments)` triples, one fragment each.
pub fn tool_call_updates(calls: &[(&str, &str, Value)]) -> Vec<PartialUpdate> {
    let mut updates: Vec<PartialUpdate> = calls
        .iter()
        .enumerate()
        .map(|(index, (id, name, args))| {
            PartialUpdate::tool_call(
                0,
                ToolCallDelta {
                    index: index as u32,
                    id: Some((*id).to_string()),
                    name: Some((*name).to_string()),
                    arguments: Some(args.to_string()),
                },
            )
        })
        .collect();
    updates.push(PartialUpdate::finish(0, "tool_calls"));
    updates
}

pub fn tool_reply(calls: &[(&str, &str, Value)]) -> Reply {
    Reply::Updates(tool_call_updates(calls))
}

pub fn transport(message: &str) -> Reply {
    Reply::Fail(BackendError::Transport(message.to_string()))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        backoff_secs: 0.001,
        ..RetryPolicy::default()
    }
}

// === Tools ===

/// Tool that records its inputs. Fails every call when built with `failing`.
pub struct RecordingTool {
    name: String,
    fail: bool,
    inputs: Mutex<Vec<Value>>,
    on_call: Option<Arc<AtomicBool>>,
}

impl RecordingTool {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            inputs: Mutex::new(Vec::new()),
            on_call: None,
        })
    }

    pub fn failing(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: true,
            inputs: Mutex::new(Vec::new()),
            on_call: None,
        })
    }

    /// Raises `flag` whenever the tool runs.
    pub fn raising(name: &str, flag: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail: false,
            inputs: Mutex::new(Vec::new()),
            on_call: Some(flag),
        })
    }

    pub fn invocations(&self) -> usize {
        self.inputs.lock().unwrap().len()
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolSpec for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Records its input"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        self.inputs.lock().unwrap().push(input);
        if let Some(flag) = &self.on_call {
            flag.store(true, Ordering::SeqCst);
        }
        if self.fail {
            return Err(ToolError::execution_failed(format!("{} exploded", self.name)));
        }
        Ok(ToolResult::success(format!("{} ok", self.name)))
    }
}

/// Tool whose handler panics.
pub struct PanickingTool {
    name: String,
}

impl PanickingTool {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl ToolSpec for PanickingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Panics when called"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        panic!("handler blew up");
    }
}

// === Permission prompt ===

/// Prompt that replays decisions (denying once they run out), or blocks
/// forever when built with `blocking`.
pub struct ScriptedPrompt {
    decisions: Mutex<VecDeque<PermissionDecision>>,
    asked: Mutex<Vec<String>>,
    block: bool,
    pub asked_notify: Notify,
}

impl ScriptedPrompt {
    pub fn new(decisions: Vec<PermissionDecision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            asked: Mutex::new(Vec::new()),
            block: false,
            asked_notify: Notify::new(),
        })
    }

    pub fn blocking() -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(VecDeque::new()),
            asked: Mutex::new(Vec::new()),
            block: true,
            asked_notify: Notify::new(),
        })
    }

    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PermissionPrompt for ScriptedPrompt {
    async fn request(
        &self,
        _tool_name: &str,
        call: &ToolCall,
        _description: &str,
    ) -> anyhow::Result<PermissionDecision> {
        self.asked.lock().unwrap().push(call.id.clone());
        self.asked_notify.notify_one();
        if self.block {
            std::future::pending::<()>().await;
        }
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(PermissionDecision::Deny))
    }
}

// === Harness ===

pub struct Harness {
    pub orchestrator: ConversationOrchestrator,
    pub events: mpsc::Receiver<Event>,
    pub todos: SharedTodoList,
    pub interrupt: Arc<AtomicBool>,
}

impl Harness {
    /// Events emitted so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Orchestrator over `backend` with the todo tool plus `tools`. A `None`
/// prompt approves everything.
pub fn harness(
    backend: Arc<ScriptedBackend>,
    tools: Vec<Arc<dyn ToolSpec>>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
) -> Harness {
    harness_with_interrupt(backend, tools, prompt, Arc::new(AtomicBool::new(false)))
}

/// Like `harness`, with the interruption flag supplied by the caller.
pub fn harness_with_interrupt(
    backend: Arc<ScriptedBackend>,
    tools: Vec<Arc<dyn ToolSpec>>,
    prompt: Option<Arc<dyn PermissionPrompt>>,
    interrupt: Arc<AtomicBool>,
) -> Harness {
    let (tx_event, events) = mpsc::channel(1024);
    let todos = new_shared_todo_list();
    let registry = ToolRegistryBuilder::new()
        .with_todo_tool(todos.clone())
        .with_tools(tools)
        .build(ToolContext::new("."));
    let gate = Arc::new(PermissionGate::new(prompt, FingerprintPolicy::default()));
    let executor = ToolExecutor::new(Arc::new(registry), gate, tx_event.clone());
    let requests = RequestExecutor::new(backend, fast_retry());
    let capabilities = SessionCapabilities::with_interrupt_flag(Some(todos.clone()), interrupt.clone());
    let orchestrator =
        ConversationOrchestrator::new(requests, executor, Arc::new(capabilities), tx_event);

    Harness {
        orchestrator,
        events,
        todos,
        interrupt,
    }
}

/// Tool results in `transcript`, as `(call id, rendered content)`.
pub fn tool_results(transcript: &[Message]) -> Vec<(String, String)> {
    transcript
        .iter()
        .filter_map(|message| {
            message
                .tool_call_id()
                .map(|id| (id.to_string(), message.content().render()))
        })
        .collect()
}
