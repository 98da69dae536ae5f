//! Permission gate for tool-call batches.
//!
//! Calls are checked one at a time, in order. A `session` decision is cached
//! under a resource fingerprint so later calls touching the same resource
//! skip the prompt; a single denial rejects the whole batch.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::audit::emit_tool_audit;
use crate::logging;
use crate::models::{Message, ToolCall};

use super::events::Event;

/// Assistant acknowledgement appended after a rejected batch.
pub const REJECTION_ACK: &str = "The requested tool calls were rejected by the user.";

const DESCRIPTION_ARG_CHARS: usize = 120;

// === Types ===

/// Whether tool calls are put to the operator at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApprovalMode {
    /// Prompt before running tools
    #[default]
    Ask,
    /// Auto-approve all tools (unattended runs, --yolo)
    Auto,
}

impl ApprovalMode {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ask" | "suggest" | "on-request" => Some(Self::Ask),
            "auto" | "never" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Operator decision for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Run this call only
    Once,
    /// Run and don't ask again for this resource this session
    Session,
    /// Reject the call (and with it the batch)
    Deny,
}

/// Coarse tool grouping that selects a fingerprint rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    File,
    Shell,
    Network,
    Mcp,
    Other,
}

/// How a tool call's arguments collapse into a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintRule {
    /// Any call to the tool matches
    ToolName,
    /// Directory the call touches: the target itself for directory tools,
    /// otherwise the directory containing the target path
    Directory,
    /// Hostname of the target URL
    Hostname,
    /// First N tokens of the shell command
    CommandPrefix(usize),
    /// The full argument object
    Arguments,
}

/// Outcome of checking a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Approved,
    Denied { call_id: String, tool_name: String },
    Cancelled,
}

/// Source of operator decisions.
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn request(
        &self,
        tool_name: &str,
        call: &ToolCall,
        description: &str,
    ) -> anyhow::Result<PermissionDecision>;
}

// === Fingerprinting ===

/// Per-family fingerprint rules plus tool-to-family assignments.
#[derive(Debug, Clone)]
pub struct FingerprintPolicy {
    rules: HashMap<ToolFamily, FingerprintRule>,
    tools: HashMap<String, ToolFamily>,
}

impl Default for FingerprintPolicy {
    fn default() -> Self {
        let rules = HashMap::from([
            (ToolFamily::File, FingerprintRule::Directory),
            (ToolFamily::Shell, FingerprintRule::CommandPrefix(2)),
            (ToolFamily::Network, FingerprintRule::Hostname),
            (ToolFamily::Mcp, FingerprintRule::ToolName),
            (ToolFamily::Other, FingerprintRule::Arguments),
        ]);
        Self {
            rules,
            tools: HashMap::new(),
        }
    }
}

impl FingerprintPolicy {
    pub fn set_rule(&mut self, family: ToolFamily, rule: FingerprintRule) {
        self.rules.insert(family, rule);
    }

    pub fn assign_tool(&mut self, tool: impl Into<String>, family: ToolFamily) {
        self.tools.insert(tool.into(), family);
    }

    #[must_use]
    pub fn family_of(&self, tool_name: &str) -> ToolFamily {
        self.tools
            .get(tool_name)
            .copied()
            .unwrap_or_else(|| default_family(tool_name))
    }

    #[must_use]
    pub fn rule_for(&self, family: ToolFamily) -> &FingerprintRule {
        self.rules
            .get(&family)
            .unwrap_or(&FingerprintRule::Arguments)
    }

    /// Cache key for `call`. Falls back to the full arguments whenever the
    /// family's rule can't find the argument it normalizes.
    #[must_use]
    pub fn fingerprint(&self, call: &ToolCall) -> String {
        let args = call.arguments.decode().unwrap_or_default();
        let tool = call.name.as_str();
        let key = match self.rule_for(self.family_of(tool)) {
            FingerprintRule::ToolName => Some("*".to_string()),
            FingerprintRule::Directory => directory_key(tool, &args),
            FingerprintRule::Hostname => string_arg(&args, URL_KEYS).and_then(|u| hostname_of(&u)),
            FingerprintRule::CommandPrefix(tokens) => {
                command_arg(&args).and_then(|cmd| command_prefix(&cmd, *tokens))
            }
            FingerprintRule::Arguments => None,
        };
        let key = key.unwrap_or_else(|| Value::Object(args).to_string());
        format!("{tool}:{key}")
    }
}

const PATH_KEYS: &[&str] = &["path", "file_path", "filename", "directory", "dir"];
const DIRECTORY_KEYS: &[&str] = &["directory", "dir"];
const DIRECTORY_TOOLS: &[&str] = &["list_dir"];
const URL_KEYS: &[&str] = &["url", "uri", "endpoint"];
const COMMAND_KEYS: &[&str] = &["command", "cmd"];

fn default_family(name: &str) -> ToolFamily {
    match name {
        "read_file" | "write_file" | "edit_file" | "apply_patch" | "list_dir" | "grep_files"
        | "file_search" => ToolFamily::File,
        "exec_shell" | "shell" | "bash" | "run_tests" => ToolFamily::Shell,
        "web_fetch" | "fetch_url" | "web_search" | "http_request" => ToolFamily::Network,
        other if other.starts_with("mcp_") => ToolFamily::Mcp,
        _ => ToolFamily::Other,
    }
}

fn string_arg(args: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| args.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn command_arg(args: &Map<String, Value>) -> Option<String> {
    for key in COMMAND_KEYS {
        match args.get(*key) {
            Some(Value::String(command)) => return Some(command.clone()),
            Some(Value::Array(parts)) => {
                let parts: Vec<String> = parts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|part| {
                        shlex::try_quote(part).map_or_else(|_| part.to_string(), |q| q.into_owned())
                    })
                    .collect();
                return Some(parts.join(" "));
            }
            _ => {}
        }
    }
    None
}

fn directory_key(tool: &str, args: &Map<String, Value>) -> Option<String> {
    let path = string_arg(args, PATH_KEYS)?;
    let targets_directory =
        DIRECTORY_TOOLS.contains(&tool) || DIRECTORY_KEYS.iter().any(|key| args.contains_key(*key));
    if targets_directory {
        Some(normalize_directory(&path))
    } else {
        Some(directory_of(&path))
    }
}

fn normalize_directory(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed {
        "" if path.starts_with('/') => "/".to_string(),
        "" => ".".to_string(),
        dir => dir.strip_prefix("./").unwrap_or(dir).to_string(),
    }
}

fn directory_of(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.display().to_string(),
        _ => ".".to_string(),
    }
}

fn hostname_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed.host_str().map(str::to_ascii_lowercase)
}

fn env_assignment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").expect("env assignment regex should compile")
    })
}

fn command_prefix(command: &str, tokens: usize) -> Option<String> {
    let words = shlex::split(command)
        .unwrap_or_else(|| command.split_whitespace().map(str::to_string).collect());
    let prefix: Vec<String> = words
        .into_iter()
        .skip_while(|word| env_assignment_regex().is_match(word))
        .take(tokens.max(1))
        .collect();
    if prefix.is_empty() {
        return None;
    }
    Some(prefix.join(" "))
}

/// One-line description of what a call will do, for the prompt.
#[must_use]
pub fn describe_call(call: &ToolCall, family: ToolFamily) -> String {
    let args = call.arguments.decode().unwrap_or_default();
    let name = &call.name;
    match family {
        ToolFamily::File => match string_arg(&args, PATH_KEYS) {
            Some(path) => format!("Tool '{name}' will access {path}"),
            None => format!("Tool '{name}' will access the workspace"),
        },
        ToolFamily::Shell => match command_arg(&args) {
            Some(command) => format!(
                "Run shell command: {}",
                summarize_text(&command, DESCRIPTION_ARG_CHARS)
            ),
            None => format!("Tool '{name}' will run a shell command"),
        },
        ToolFamily::Network => match string_arg(&args, URL_KEYS) {
            Some(url) => format!("Tool '{name}' will contact {url}"),
            None => format!("Tool '{name}' will make a network request"),
        },
        ToolFamily::Mcp => format!("MCP tool '{name}' may have side effects"),
        ToolFamily::Other => format!(
            "Run tool '{name}' with {}",
            summarize_text(&Value::Object(args).to_string(), DESCRIPTION_ARG_CHARS)
        ),
    }
}

fn summarize_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let take = limit.saturating_sub(3);
    let mut out: String = text.chars().take(take).collect();
    out.push_str("...");
    out
}

/// Tool results for a rejected batch: one per call, then the acknowledgement.
#[must_use]
pub fn rejection_messages(calls: &[ToolCall]) -> Vec<Message> {
    calls
        .iter()
        .map(|call| Message::tool_result(&call.id, format!("User rejected {}", call.name)))
        .chain(std::iter::once(Message::assistant(REJECTION_ACK)))
        .collect()
}

// === PermissionGate ===

/// Sequential, fail-fast permission checks with a session-scoped cache.
pub struct PermissionGate {
    prompt: Option<Arc<dyn PermissionPrompt>>,
    policy: FingerprintPolicy,
    session_approvals: Arc<RwLock<HashSet<String>>>,
}

impl PermissionGate {
    pub fn new(prompt: Option<Arc<dyn PermissionPrompt>>, policy: FingerprintPolicy) -> Self {
        Self {
            prompt,
            policy,
            session_approvals: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Gate without a prompt: every batch is approved.
    pub fn auto_approve() -> Self {
        Self::new(None, FingerprintPolicy::default())
    }

    #[must_use]
    pub fn policy(&self) -> &FingerprintPolicy {
        &self.policy
    }

    #[must_use]
    pub fn has_prompt(&self) -> bool {
        self.prompt.is_some()
    }

    pub async fn is_session_approved(&self, fingerprint: &str) -> bool {
        self.session_approvals.read().await.contains(fingerprint)
    }

    /// Forget every session decision.
    pub async fn clear(&self) {
        self.session_approvals.write().await.clear();
    }

    /// Check `calls` in order, stopping at the first denial.
    pub async fn check_batch(&self, calls: &[ToolCall], cancel: &CancellationToken) -> GateOutcome {
        let Some(prompt) = &self.prompt else {
            return GateOutcome::Approved;
        };

        for call in calls {
            let family = self.policy.family_of(&call.name);
            let fingerprint = self.policy.fingerprint(call);
            if self.is_session_approved(&fingerprint).await {
                logging::debug(format!(
                    "Reusing session approval for {} ({fingerprint})",
                    call.name
                ));
                continue;
            }

            let description = describe_call(call, family);
            emit_tool_audit(
                "tool.approval_required",
                json!({
                    "tool_id": call.id,
                    "tool_name": call.name,
                    "fingerprint": fingerprint,
                }),
            );

            let decision = tokio::select! {
                biased;
                () = cancel.cancelled() => return GateOutcome::Cancelled,
                decision = prompt.request(&call.name, call, &description) => decision,
            };
            let decision = decision.unwrap_or_else(|err| {
                logging::warn(format!(
                    "Permission prompt failed for {}: {err}; treating as denied",
                    call.name
                ));
                PermissionDecision::Deny
            });

            logging::debug(format!("Permission for {}: {decision:?}", call.name));
            match decision {
                PermissionDecision::Once => {
                    emit_tool_audit(
                        "tool.approved",
                        json!({"tool_id": call.id, "tool_name": call.name, "scope": "once"}),
                    );
                }
                PermissionDecision::Session => {
                    self.session_approvals
                        .write()
                        .await
                        .insert(fingerprint.clone());
                    emit_tool_audit(
                        "tool.approved",
                        json!({
                            "tool_id": call.id,
                            "tool_name": call.name,
                            "scope": "session",
                            "fingerprint": fingerprint,
                        }),
                    );
                }
                PermissionDecision::Deny => {
                    emit_tool_audit(
                        "tool.denied",
                        json!({"tool_id": call.id, "tool_name": call.name}),
                    );
                    return GateOutcome::Denied {
                        call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                    };
                }
            }
        }

        GateOutcome::Approved
    }
}

// === ChannelPrompt ===

/// Decision sent back to the engine for a pending approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Once { id: String },
    Session { id: String },
    Deny { id: String },
}

/// Prompt that asks the front end through the event channel.
pub struct ChannelPrompt {
    tx_event: mpsc::Sender<Event>,
    rx_approval: AsyncMutex<mpsc::Receiver<ApprovalDecision>>,
}

impl ChannelPrompt {
    pub fn new(tx_event: mpsc::Sender<Event>, rx_approval: mpsc::Receiver<ApprovalDecision>) -> Self {
        Self {
            tx_event,
            rx_approval: AsyncMutex::new(rx_approval),
        }
    }
}

#[async_trait]
impl PermissionPrompt for ChannelPrompt {
    async fn request(
        &self,
        tool_name: &str,
        call: &ToolCall,
        description: &str,
    ) -> anyhow::Result<PermissionDecision> {
        self.tx_event
            .send(Event::ApprovalRequired {
                id: call.id.clone(),
                tool_name: tool_name.to_string(),
                description: description.to_string(),
            })
            .await
            .map_err(|_| anyhow::anyhow!("Event channel closed"))?;

        let mut rx = self.rx_approval.lock().await;
        loop {
            let Some(decision) = rx.recv().await else {
                anyhow::bail!("Approval channel closed");
            };
            match decision {
                ApprovalDecision::Once { id } if id == call.id => {
                    return Ok(PermissionDecision::Once);
                }
                ApprovalDecision::Session { id } if id == call.id => {
                    return Ok(PermissionDecision::Session);
                }
                ApprovalDecision::Deny { id } if id == call.id => {
                    return Ok(PermissionDecision::Deny);
                }
                _ => continue,
            }
        }
    }
}
