//! Tool trait, results, errors and the execution context tools receive.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Content, ContentChunk, ToolSchema};

// === Errors ===

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("missing required field: {field}")]
    MissingField { field: String },
    #[error("path escapes workspace: {}", path.display())]
    PathEscape { path: PathBuf },
    #[error("{message}")]
    ExecutionFailed { message: String },
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("not available: {message}")]
    NotAvailable { message: String },
}

impl ToolError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: message.into(),
        }
    }
}

// === Results ===

/// What a tool hands back. `success == false` marks a tool-reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub content: Content,
    pub success: bool,
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: Content::Text(content.into()),
            success: true,
            metadata: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: Content::Text(content.into()),
            success: false,
            metadata: None,
        }
    }

    pub fn chunks(chunks: Vec<ContentChunk>, success: bool) -> Self {
        Self {
            content: Content::Chunks(chunks),
            success,
            metadata: None,
        }
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::success(serde_json::to_string_pretty(value)?))
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// === Context ===

/// Per-call environment: tools only see paths under `workspace`.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace: PathBuf,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    /// Resolve a workspace-relative (or absolute, in-workspace) path.
    ///
    /// Resolution is lexical so it works for files that don't exist yet.
    pub fn resolve_path(&self, raw: &str) -> Result<PathBuf, ToolError> {
        let escape = || ToolError::PathEscape {
            path: PathBuf::from(raw),
        };
        let root = std::path::absolute(&self.workspace).unwrap_or_else(|_| self.workspace.clone());
        let root = normalize(&root).ok_or_else(escape)?;

        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };
        let resolved = normalize(&joined).ok_or_else(escape)?;

        if !resolved.starts_with(&root) {
            return Err(escape());
        }
        Ok(resolved)
    }
}

/// Drop `.` and fold `..`; `None` if `..` climbs past the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut resolved = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !resolved.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => resolved.push(other.as_os_str()),
        }
    }
    Some(resolved)
}

// === Trait ===

#[async_trait]
pub trait ToolSpec: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> Value;

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

// === Input helpers ===

pub fn required_str<'a>(input: &'a Value, field: &str) -> Result<&'a str, ToolError> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::missing_field(field))
}

pub fn optional_str<'a>(input: &'a Value, field: &str) -> Option<&'a str> {
    input.get(field).and_then(Value::as_str)
}

pub fn optional_u64(input: &Value, field: &str, default: u64) -> u64 {
    input.get(field).and_then(Value::as_u64).unwrap_or(default)
}
