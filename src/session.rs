//! Session lifecycle: wiring, the background op loop and teardown.
//!
//! A `Session` owns everything a conversation needs (orchestrator, permission
//! cache, tool servers); the front end talks to it through a `SessionHandle`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, RetryPolicy};
use crate::core::capabilities::SessionCapabilities;
use crate::core::events::Event;
use crate::core::executor::ToolExecutor;
use crate::core::ops::Op;
use crate::core::orchestrator::{ConversationOrchestrator, TurnOutcome};
use crate::core::permission::{
    ApprovalDecision, ApprovalMode, ChannelPrompt, FingerprintPolicy, PermissionGate,
    PermissionPrompt,
};
use crate::core::request::RequestExecutor;
use crate::llm_client::ChatBackend;
use crate::logging;
use crate::mcp::McpPool;
use crate::models::{Message, UsageCounters};
use crate::tools::{ToolContext, ToolRegistryBuilder, ToolSpec, new_shared_todo_list};

const SYSTEM_PROMPT: &str = "You are a coding assistant working inside the user's workspace. \
Use the available tools to inspect files, keep your todo list current with todo_write, \
and explain what you changed.";

/// Everything needed to build a session besides the backend.
pub struct SessionOptions {
    pub workspace: PathBuf,
    pub retry: RetryPolicy,
    pub approval_mode: ApprovalMode,
    pub fingerprints: FingerprintPolicy,
    pub max_steps: u32,
    pub system_prompt: Option<String>,
    /// Connected tool servers; their tools join the registry
    pub mcp_pool: Option<McpPool>,
    /// Extra in-process tools
    pub tools: Vec<Arc<dyn ToolSpec>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            retry: RetryPolicy::default(),
            approval_mode: ApprovalMode::default(),
            fingerprints: FingerprintPolicy::default(),
            max_steps: crate::config::DEFAULT_MAX_STEPS,
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            mcp_pool: None,
            tools: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace: config.workspace(),
            retry: config.retry_policy(),
            approval_mode: config.approval_mode(),
            fingerprints: config.fingerprint_policy(),
            max_steps: config.max_steps(),
            ..Self::default()
        }
    }
}

/// Start every enabled tool server listed in `path`.
///
/// Returns `None` when nothing is configured. Servers that fail to start are
/// logged and skipped.
pub async fn connect_tool_servers(path: &std::path::Path) -> Result<Option<McpPool>> {
    let mut pool = McpPool::from_config_path(path)?;
    if pool.server_names().is_empty() {
        return Ok(None);
    }
    for (name, err) in pool.connect_all().await {
        logging::warn(format!("Skipping MCP server '{name}': {err:#}"));
    }
    Ok(Some(pool))
}

// === SessionHandle ===

/// Front-end side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    tx_op: mpsc::Sender<Op>,
    rx_event: Arc<RwLock<mpsc::Receiver<Event>>>,
    cancel_token: Arc<StdMutex<CancellationToken>>,
    interrupt: Arc<AtomicBool>,
    tx_approval: mpsc::Sender<ApprovalDecision>,
}

impl SessionHandle {
    /// Queue a user message for the next turn
    pub async fn send(&self, content: impl Into<String>) -> Result<()> {
        self.tx_op.send(Op::send(content)).await?;
        Ok(())
    }

    /// Switch models starting with the next queued turn
    pub async fn set_model(&self, model: impl Into<String>) -> Result<()> {
        self.tx_op
            .send(Op::SetModel {
                model: model.into(),
            })
            .await?;
        Ok(())
    }

    /// Stop the session after the current turn; it tears itself down
    pub async fn shutdown(&self) -> Result<()> {
        self.tx_op.send(Op::Shutdown).await?;
        Ok(())
    }

    /// Cancel the in-flight request-turn
    pub fn cancel(&self) {
        match self.cancel_token.lock() {
            Ok(token) => token.cancel(),
            Err(poisoned) => poisoned.into_inner().cancel(),
        }
    }

    /// Ask the orchestrator to stop at the next step boundary.
    ///
    /// Unlike `cancel`, the in-flight request or tool batch is allowed to
    /// finish first. A request made while no turn is running is dropped.
    pub fn request_interruption(&self) {
        self.interrupt.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self.cancel_token.lock() {
            Ok(token) => token.is_cancelled(),
            Err(poisoned) => poisoned.into_inner().is_cancelled(),
        }
    }

    pub async fn approve_once(&self, id: impl Into<String>) -> Result<()> {
        self.tx_approval
            .send(ApprovalDecision::Once { id: id.into() })
            .await?;
        Ok(())
    }

    pub async fn approve_for_session(&self, id: impl Into<String>) -> Result<()> {
        self.tx_approval
            .send(ApprovalDecision::Session { id: id.into() })
            .await?;
        Ok(())
    }

    pub async fn deny(&self, id: impl Into<String>) -> Result<()> {
        self.tx_approval
            .send(ApprovalDecision::Deny { id: id.into() })
            .await?;
        Ok(())
    }

    /// Next engine event, or `None` once the session is gone
    pub async fn recv_event(&self) -> Option<Event> {
        self.rx_event.write().await.recv().await
    }
}

// === Session ===

pub struct Session {
    id: String,
    orchestrator: ConversationOrchestrator,
    gate: Arc<PermissionGate>,
    mcp_pool: Option<McpPool>,
    rx_op: mpsc::Receiver<Op>,
}

impl Session {
    /// Wire the components together. Tool servers in `options` must already be connected.
    pub async fn new(
        backend: Arc<dyn ChatBackend>,
        options: SessionOptions,
    ) -> (Self, SessionHandle) {
        let (tx_op, rx_op) = mpsc::channel(32);
        let (tx_event, rx_event) = mpsc::channel(256);
        let (tx_approval, rx_approval) = mpsc::channel(64);
        let id = uuid::Uuid::new_v4().to_string();

        let todos = new_shared_todo_list();
        let mut builder = ToolRegistryBuilder::new()
            .with_file_tools()
            .with_todo_tool(todos.clone())
            .with_tools(options.tools);
        if let Some(pool) = &options.mcp_pool {
            builder = builder.with_tools(pool.tool_handlers().await);
        }
        let registry = Arc::new(builder.build(ToolContext::new(options.workspace)));
        logging::info(format!(
            "Session {id}: {} tool(s) registered, model {}",
            registry.len(),
            backend.model()
        ));

        let prompt: Option<Arc<dyn PermissionPrompt>> = match options.approval_mode {
            ApprovalMode::Ask => Some(Arc::new(ChannelPrompt::new(tx_event.clone(), rx_approval))),
            ApprovalMode::Auto => None,
        };
        let gate = Arc::new(PermissionGate::new(prompt, options.fingerprints));

        let tools = ToolExecutor::new(registry, gate.clone(), tx_event.clone());
        let requests = RequestExecutor::new(backend, options.retry);
        let capabilities = Arc::new(SessionCapabilities::new(Some(todos)));
        let interrupt = capabilities.interrupt_flag();
        let mut orchestrator =
            ConversationOrchestrator::new(requests, tools, capabilities, tx_event)
                .with_max_steps(options.max_steps);
        if let Some(system_prompt) = options.system_prompt {
            orchestrator = orchestrator.with_system_prompt(system_prompt);
        }

        let handle = SessionHandle {
            session_id: id.clone(),
            tx_op,
            rx_event: Arc::new(RwLock::new(rx_event)),
            cancel_token: orchestrator.shared_cancel_token(),
            interrupt,
            tx_approval,
        };
        let session = Self {
            id,
            orchestrator,
            gate,
            mcp_pool: options.mcp_pool,
            rx_op,
        };
        (session, handle)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn transcript(&self) -> &[Message] {
        self.orchestrator.transcript()
    }

    #[must_use]
    pub fn usage(&self) -> &UsageCounters {
        self.orchestrator.usage()
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.orchestrator.set_model(model);
    }

    /// Run a single turn directly, bypassing the op channel.
    pub async fn run_turn(&mut self, content: impl Into<String>) -> TurnOutcome {
        self.orchestrator.run_turn(content).await
    }

    /// Process ops until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(op) = self.rx_op.recv().await {
            match op {
                Op::SendMessage { content } => {
                    self.orchestrator.run_turn(content).await;
                }
                Op::SetModel { model } => self.orchestrator.set_model(model),
                Op::Shutdown => break,
            }
        }
        self.teardown().await;
    }

    /// Run on a background task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Forget session approvals and stop tool servers.
    pub async fn teardown(&mut self) {
        self.gate.clear().await;
        if let Some(pool) = self.mcp_pool.as_mut() {
            pool.disconnect_all().await;
        }
        logging::info(format!("Session {} torn down", self.id));
    }
}

/// Build a session and run it on a background task.
pub async fn spawn_session(
    backend: Arc<dyn ChatBackend>,
    options: SessionOptions,
) -> SessionHandle {
    let (session, handle) = Session::new(backend, options).await;
    session.spawn();
    handle
}
