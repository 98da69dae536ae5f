//! Tool-call batch protocol: validate, gate, fan out, join.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use futures_util::stream::FuturesUnordered;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audit::emit_tool_audit;
use crate::logging;
use crate::models::{ConversationEntry, EntryStatus, Message, ToolCall};
use crate::tools::{ToolError, ToolRegistry, ToolResult};

use super::events::Event;
use super::permission::{GateOutcome, PermissionGate, rejection_messages};

// === Errors ===

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BatchError {
    /// A call is missing its id or name; nothing was prompted or run.
    #[error("invalid tool call: {reason}")]
    InvalidToolCall { reason: String },
    /// The operator denied a call. `rejections` pairs every call in the batch.
    #[error("User rejected {tool_name}")]
    Denied {
        tool_name: String,
        rejections: Vec<Message>,
    },
    /// Every call failed. `results` holds the per-call error results.
    #[error("all tool calls failed ({count} errors)")]
    AllFailed { count: usize, results: Vec<Message> },
    /// Cancelled while waiting on a permission decision.
    #[error("tool batch cancelled")]
    Cancelled,
}

/// Reject the batch if any call lacks an id or a name.
pub fn validate_batch(calls: &[ToolCall]) -> Result<(), BatchError> {
    for (position, call) in calls.iter().enumerate() {
        if call.id.trim().is_empty() {
            return Err(BatchError::InvalidToolCall {
                reason: format!("tool call #{position} has an empty id"),
            });
        }
        if call.name.trim().is_empty() {
            return Err(BatchError::InvalidToolCall {
                reason: format!("tool call '{}' has an empty name", call.id),
            });
        }
    }
    Ok(())
}

/// Render a handler failure as an actionable message for the model.
fn format_tool_error(err: &ToolError, tool_name: &str) -> String {
    match err {
        ToolError::InvalidInput { message } => {
            format!("Invalid input for tool '{tool_name}': {message}")
        }
        ToolError::MissingField { field } => {
            format!("Tool '{tool_name}' is missing required field '{field}'")
        }
        ToolError::PathEscape { path } => format!(
            "Path escapes workspace: {}. Use a workspace-relative path.",
            path.display()
        ),
        ToolError::ExecutionFailed { message } => message.clone(),
        ToolError::Timeout { seconds } => format!(
            "Tool '{tool_name}' timed out after {seconds}s. Try a narrower scope or a longer timeout."
        ),
        ToolError::NotAvailable { message } => format!(
            "Tool '{tool_name}' is not available: {message}. Check the tool name."
        ),
    }
}

fn panic_payload_to_string(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct CallOutcome {
    index: usize,
    message: Message,
    succeeded: bool,
}

// === ToolExecutor ===

/// Runs approved batches against the registry, concurrently.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    tx_event: mpsc::Sender<Event>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        tx_event: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            registry,
            gate,
            tx_event,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    /// Validate, gate and execute one batch.
    ///
    /// Returns one tool result per call, in call order.
    pub async fn run_batch(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, BatchError> {
        validate_batch(calls)?;

        match self.gate.check_batch(calls, cancel).await {
            GateOutcome::Approved => {}
            GateOutcome::Denied { tool_name, .. } => {
                logging::info(format!("Tool batch rejected at {tool_name}"));
                return Err(BatchError::Denied {
                    tool_name,
                    rejections: rejection_messages(calls),
                });
            }
            GateOutcome::Cancelled => return Err(BatchError::Cancelled),
        }

        self.execute_batch(calls).await
    }

    /// Execute every call concurrently. Only fails when no call succeeded.
    pub async fn execute_batch(&self, calls: &[ToolCall]) -> Result<Vec<Message>, BatchError> {
        let mut tasks = FuturesUnordered::new();
        for (index, call) in calls.iter().enumerate() {
            tasks.push(self.execute_call(index, call));
        }

        let mut outcomes: Vec<Option<CallOutcome>> = Vec::with_capacity(calls.len());
        outcomes.resize_with(calls.len(), || None);
        while let Some(outcome) = tasks.next().await {
            let index = outcome.index;
            outcomes[index] = Some(outcome);
        }

        let mut succeeded = 0usize;
        let mut results = Vec::with_capacity(calls.len());
        for outcome in outcomes.into_iter().flatten() {
            if outcome.succeeded {
                succeeded += 1;
            }
            results.push(outcome.message);
        }

        logging::info(format!(
            "Tool batch finished: {succeeded}/{} succeeded",
            calls.len()
        ));
        if !calls.is_empty() && succeeded == 0 {
            return Err(BatchError::AllFailed {
                count: calls.len(),
                results,
            });
        }
        Ok(results)
    }

    async fn execute_call(&self, index: usize, call: &ToolCall) -> CallOutcome {
        let entry = ConversationEntry::tool(&call.id, &call.name);
        let entry_id = entry.id.clone();
        let _ = self.tx_event.send(Event::entry(entry)).await;

        let result = match call.arguments.decode() {
            Ok(args) => {
                let execution = self.registry.execute(&call.name, Value::Object(args));
                match AssertUnwindSafe(execution).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(ToolError::execution_failed(format!(
                        "Tool panicked: {}",
                        panic_payload_to_string(&payload)
                    ))),
                }
            }
            Err(err) => Err(ToolError::invalid_input(format!(
                "arguments are not a JSON object: {err}"
            ))),
        };

        let (message, succeeded) = match result {
            Ok(ToolResult {
                content,
                success: true,
                ..
            }) => (Message::tool_result(&call.id, content), true),
            Ok(ToolResult { content, .. }) => {
                let error = content.render();
                self.report_failure(&call.name, &error).await;
                (
                    Message::tool_result(&call.id, format!("Error: {error}")),
                    false,
                )
            }
            Err(err) => {
                let error = format_tool_error(&err, &call.name);
                self.report_failure(&call.name, &error).await;
                (
                    Message::tool_result(&call.id, format!("Error: {error}")),
                    false,
                )
            }
        };

        emit_tool_audit(
            "tool.executed",
            json!({"tool_id": call.id, "tool_name": call.name, "success": succeeded}),
        );
        let status = if succeeded {
            EntryStatus::Success
        } else {
            EntryStatus::Error
        };
        let _ = self
            .tx_event
            .send(Event::EntryStatus {
                id: entry_id,
                status,
            })
            .await;

        CallOutcome {
            index,
            message,
            succeeded,
        }
    }

    async fn report_failure(&self, tool_name: &str, error: &str) {
        logging::warn(format!("Tool '{tool_name}' failed: {error}"));
        let _ = self
            .tx_event
            .send(Event::error(format!("{tool_name}: {error}"), true))
            .await;
    }
}
