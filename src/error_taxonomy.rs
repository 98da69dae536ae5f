//! Shared error taxonomy across backend, orchestration and tools.
//!
//! Every typed error maps onto one [`ErrorCategory`]; the envelope decides
//! whether the message is shown to the operator and whether the session
//! can continue.

use crate::core::executor::BatchError;
use crate::core::request::RequestError;
use crate::llm_client::BackendError;
use crate::tools::spec::ToolError;

/// Broad category for typed error handling and policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network or connection failure; retried with backoff.
    Transport,
    /// The backend refused or failed the request; never retried.
    Backend,
    /// Operator cancellation. Control flow, repaired with synthetic messages.
    Cancellation,
    /// Malformed model output; fails the whole response closed.
    Validation,
    /// A tool handler failed; isolated to its call.
    Tool,
    /// The operator denied a tool call.
    Permission,
    /// A turn hit a configured bound such as `max_steps`.
    Limit,
    Config,
}

/// Severity hint for UI and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Unified envelope used when crossing subsystem boundaries.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEnvelope {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// The session can keep going after this error.
    pub recoverable: bool,
    /// The message is surfaced to the operator as session error text.
    pub session_visible: bool,
    pub code: String,
    pub message: String,
}

impl ErrorEnvelope {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let (recoverable, session_visible) = match category {
            ErrorCategory::Transport | ErrorCategory::Backend | ErrorCategory::Limit => {
                (true, true)
            }
            ErrorCategory::Config => (false, true),
            ErrorCategory::Cancellation
            | ErrorCategory::Validation
            | ErrorCategory::Tool
            | ErrorCategory::Permission => (true, false),
        };
        Self {
            category,
            severity,
            recoverable,
            session_visible,
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<BackendError> for ErrorEnvelope {
    fn from(value: BackendError) -> Self {
        let message = value.to_string();
        match value {
            BackendError::Transport(_) => Self::new(
                ErrorCategory::Transport,
                ErrorSeverity::Warning,
                "backend_transport",
                message,
            ),
            BackendError::Rejected { status, .. } => Self::new(
                ErrorCategory::Backend,
                ErrorSeverity::Error,
                format!("backend_rejected_{status}"),
                message,
            ),
            BackendError::Cancelled => Self::new(
                ErrorCategory::Cancellation,
                ErrorSeverity::Info,
                "backend_cancelled",
                message,
            ),
        }
    }
}

impl From<RequestError> for ErrorEnvelope {
    fn from(value: RequestError) -> Self {
        let message = value.to_string();
        match value {
            RequestError::Exhausted { .. } => Self::new(
                ErrorCategory::Transport,
                ErrorSeverity::Error,
                "request_exhausted",
                message,
            ),
            RequestError::Backend(_) => Self::new(
                ErrorCategory::Backend,
                ErrorSeverity::Error,
                "request_backend_error",
                message,
            ),
            RequestError::UnexpectedFormat => Self::new(
                ErrorCategory::Validation,
                ErrorSeverity::Error,
                "request_unexpected_format",
                message,
            ),
            RequestError::Cancelled => Self::new(
                ErrorCategory::Cancellation,
                ErrorSeverity::Info,
                "request_cancelled",
                message,
            ),
        }
    }
}

impl From<BatchError> for ErrorEnvelope {
    fn from(value: BatchError) -> Self {
        let message = value.to_string();
        match value {
            BatchError::InvalidToolCall { .. } => Self::new(
                ErrorCategory::Validation,
                ErrorSeverity::Error,
                "batch_invalid_tool_call",
                message,
            ),
            BatchError::Denied { .. } => Self::new(
                ErrorCategory::Permission,
                ErrorSeverity::Warning,
                "batch_denied",
                message,
            ),
            BatchError::AllFailed { .. } => Self::new(
                ErrorCategory::Tool,
                ErrorSeverity::Error,
                "batch_all_failed",
                message,
            ),
            BatchError::Cancelled => Self::new(
                ErrorCategory::Cancellation,
                ErrorSeverity::Info,
                "batch_cancelled",
                message,
            ),
        }
    }
}

impl From<ToolError> for ErrorEnvelope {
    fn from(value: ToolError) -> Self {
        let code = match &value {
            ToolError::InvalidInput { .. } => "tool_invalid_input",
            ToolError::MissingField { .. } => "tool_missing_field",
            ToolError::PathEscape { .. } => "tool_path_escape",
            ToolError::ExecutionFailed { .. } => "tool_execution_failed",
            ToolError::Timeout { .. } => "tool_timeout",
            ToolError::NotAvailable { .. } => "tool_not_available",
        };
        Self::new(
            ErrorCategory::Tool,
            ErrorSeverity::Warning,
            code,
            value.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_and_exhausted_transport_are_session_visible() {
        let exhausted = ErrorEnvelope::from(RequestError::Exhausted {
            attempts: 3,
            cause: "reset".to_string(),
        });
        assert_eq!(exhausted.category, ErrorCategory::Transport);
        assert!(exhausted.session_visible);
        assert!(exhausted.message.contains("3 attempts"));

        let backend = ErrorEnvelope::from(RequestError::Backend("quota".to_string()));
        assert!(backend.session_visible);

        let cancelled = ErrorEnvelope::from(RequestError::Cancelled);
        assert_eq!(cancelled.category, ErrorCategory::Cancellation);
        assert!(!cancelled.session_visible);

        let denied = ErrorEnvelope::from(BatchError::Denied {
            tool_name: "exec_shell".to_string(),
            rejections: Vec::new(),
        });
        assert_eq!(denied.category, ErrorCategory::Permission);
        assert!(denied.recoverable);
        assert!(!denied.session_visible);
    }

    #[test]
    fn rejected_status_lands_in_code() {
        let envelope = ErrorEnvelope::from(BackendError::Rejected {
            status: 401,
            message: "bad key".to_string(),
        });
        assert_eq!(envelope.code, "backend_rejected_401");
        assert_eq!(envelope.category, ErrorCategory::Backend);
    }

    #[test]
    fn tool_errors_are_isolated() {
        let envelope = ErrorEnvelope::from(ToolError::execution_failed("boom"));
        assert_eq!(envelope.category, ErrorCategory::Tool);
        assert!(envelope.recoverable);
        assert_eq!(envelope.code, "tool_execution_failed");
    }
}
