//! Retry wrapper around a single backend call and its stream assembly.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::RetryPolicy;
use crate::llm_client::{BackendError, ChatBackend};
use crate::logging;
use crate::models::{Message, ToolSchema};

use super::stream::{AssembledResponse, ProgressFn, StreamAssembler, StreamError};

// === Errors ===

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Every attempt hit a transport failure.
    #[error("Request failed after {attempts} attempts: {cause}")]
    Exhausted { attempts: u32, cause: String },
    /// The backend chose to fail the request; never retried.
    #[error("{0}")]
    Backend(String),
    /// The response was complete but carried nothing usable.
    #[error("unexpected response format from backend")]
    UnexpectedFormat,
    #[error("request cancelled")]
    Cancelled,
}

impl RequestError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// How a single attempt ended.
enum AttemptFailure {
    Retryable(String),
    Fatal(RequestError),
}

impl From<StreamError> for AttemptFailure {
    fn from(value: StreamError) -> Self {
        match value {
            StreamError::Cancelled => Self::Fatal(RequestError::Cancelled),
            StreamError::Transport(err @ BackendError::Transport(_)) => {
                Self::Retryable(err.to_string())
            }
            // An empty stream is indistinguishable from a dropped connection.
            StreamError::NoResponse => Self::Retryable(StreamError::NoResponse.to_string()),
            StreamError::Transport(BackendError::Cancelled) => {
                Self::Fatal(RequestError::Cancelled)
            }
            StreamError::Transport(rejected @ BackendError::Rejected { .. }) => {
                Self::Fatal(RequestError::Backend(rejected.to_string()))
            }
            StreamError::Backend(message) => Self::Fatal(RequestError::Backend(message)),
            StreamError::UnexpectedFormat => Self::Fatal(RequestError::UnexpectedFormat),
        }
    }
}

// === RequestExecutor ===

/// Sends one request with bounded retries on transport failure.
#[derive(Clone)]
pub struct RequestExecutor {
    backend: Arc<dyn ChatBackend>,
    policy: RetryPolicy,
    model: String,
}

impl RequestExecutor {
    /// Starts on the backend's default model.
    pub fn new(backend: Arc<dyn ChatBackend>, policy: RetryPolicy) -> Self {
        let model = backend.model().to_string();
        Self {
            backend,
            policy,
            model,
        }
    }

    /// Model sent with every following request.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.model = model.into();
    }

    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the request, retrying transport failures with linear backoff.
    pub async fn execute(
        &self,
        transcript: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<AssembledResponse, RequestError> {
        let attempts = self.policy.attempts();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RequestError::Cancelled);
            }
            attempt += 1;

            let cause = match self
                .attempt(transcript, tools, cancel, on_progress.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(AttemptFailure::Fatal(err)) => return Err(err),
                Err(AttemptFailure::Retryable(cause)) => cause,
            };

            if attempt >= attempts {
                logging::warn(format!(
                    "{} request failed after {attempt} attempts: {cause}",
                    self.backend.provider_name()
                ));
                return Err(RequestError::Exhausted {
                    attempts: attempt,
                    cause,
                });
            }

            logging::warn(format!(
                "Request error: {cause} (attempt {attempt} of {attempts})"
            ));
            let delay = self.policy.delay_for_attempt(attempt);
            logging::info(format!("Retrying after {:.2}s", delay.as_secs_f64()));
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(RequestError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        transcript: &[Message],
        tools: &[ToolSchema],
        cancel: &CancellationToken,
        on_progress: Option<ProgressFn>,
    ) -> Result<AssembledResponse, AttemptFailure> {
        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AttemptFailure::Fatal(RequestError::Cancelled)),
            stream = self.backend.send(&self.model, transcript, tools, cancel.clone()) => {
                stream.map_err(StreamError::from)?
            }
        };

        let mut assembler = StreamAssembler::new();
        if let Some(on_progress) = on_progress {
            assembler = assembler.with_progress(on_progress);
        }
        Ok(assembler.assemble(stream, cancel).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{PartialUpdate, UpdateStream};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend that replays one scripted outcome per call.
    struct ScriptedBackend {
        calls: AtomicU32,
        models: Mutex<Vec<String>>,
        script: Mutex<Vec<Result<Vec<PartialUpdate>, BackendError>>>,
        fallback: Result<Vec<PartialUpdate>, BackendError>,
    }

    impl ScriptedBackend {
        fn new(
            script: Vec<Result<Vec<PartialUpdate>, BackendError>>,
            fallback: Result<Vec<PartialUpdate>, BackendError>,
        ) -> Arc<Self> {
            let mut script = script;
            script.reverse();
            Arc::new(Self {
                calls: AtomicU32::new(0),
                models: Mutex::new(Vec::new()),
                script: Mutex::new(script),
                fallback,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn provider_name(&self) -> &'static str {
            "scripted"
        }

        fn model(&self) -> &str {
            "m1"
        }

        async fn send(
            &self,
            model: &str,
            _transcript: &[Message],
            _tools: &[ToolSchema],
            _cancel: CancellationToken,
        ) -> Result<UpdateStream, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.models.lock().unwrap().push(model.to_string());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| self.fallback.clone());
            let updates = next?;
            Ok(Box::pin(futures_util::stream::iter(
                updates.into_iter().map(Ok::<_, BackendError>),
            )))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_secs: 0.001,
            ..RetryPolicy::default()
        }
    }

    fn transport(message: &str) -> BackendError {
        BackendError::Transport(message.to_string())
    }

    #[tokio::test]
    async fn always_failing_transport_is_attempted_exactly_three_times() {
        let backend = ScriptedBackend::new(Vec::new(), Err(transport("connection refused")));
        let executor = RequestExecutor::new(backend.clone(), fast_policy());

        let result = executor
            .execute(&[Message::user("hi")], &[], &CancellationToken::new(), None)
            .await;

        assert_eq!(backend.calls(), 3);
        let err = result.unwrap_err();
        assert_eq!(
            err,
            RequestError::Exhausted {
                attempts: 3,
                cause: "transport error: connection refused".to_string()
            }
        );
        assert!(err.to_string().contains("after 3 attempts"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let backend = ScriptedBackend::new(
            vec![Err(transport("reset")), Ok(vec![PartialUpdate::text(0, "ok")])],
            Err(transport("unused")),
        );
        let executor = RequestExecutor::new(backend.clone(), fast_policy());

        let response = executor
            .execute(&[Message::user("hi")], &[], &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(response.messages[0].content().text(), "ok");
    }

    #[tokio::test]
    async fn backend_signalled_errors_are_not_retried() {
        let backend = ScriptedBackend::new(
            Vec::new(),
            Ok(vec![PartialUpdate::finish(0, "error")]),
        );
        let executor = RequestExecutor::new(backend.clone(), fast_policy());

        let result = executor
            .execute(&[Message::user("hi")], &[], &CancellationToken::new(), None)
            .await;

        assert_eq!(backend.calls(), 1);
        assert!(matches!(result, Err(RequestError::Backend(_))));
    }

    #[tokio::test]
    async fn rejected_requests_are_not_retried() {
        let backend = ScriptedBackend::new(
            Vec::new(),
            Err(BackendError::Rejected {
                status: 401,
                message: "bad key".to_string(),
            }),
        );
        let executor = RequestExecutor::new(backend.clone(), fast_policy());

        let result = executor
            .execute(&[Message::user("hi")], &[], &CancellationToken::new(), None)
            .await;

        assert_eq!(backend.calls(), 1);
        assert!(matches!(result, Err(RequestError::Backend(message)) if message.contains("401")));
    }

    #[tokio::test]
    async fn cancellation_during_backoff_is_reported_distinctly() {
        let backend = ScriptedBackend::new(Vec::new(), Err(transport("down")));
        let policy = RetryPolicy {
            backoff_secs: 30.0,
            ..RetryPolicy::default()
        };
        let executor = RequestExecutor::new(backend.clone(), policy);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = executor
            .execute(&[Message::user("hi")], &[], &cancel, None)
            .await;

        assert_eq!(result, Err(RequestError::Cancelled));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_the_backend() {
        let backend = ScriptedBackend::new(Vec::new(), Ok(vec![PartialUpdate::text(0, "x")]));
        let executor = RequestExecutor::new(backend.clone(), fast_policy());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.execute(&[], &[], &cancel, None).await;
        assert_eq!(result, Err(RequestError::Cancelled));
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn switched_model_is_sent_with_later_requests() {
        let backend = ScriptedBackend::new(Vec::new(), Ok(vec![PartialUpdate::text(0, "x")]));
        let mut executor = RequestExecutor::new(backend.clone(), fast_policy());
        let cancel = CancellationToken::new();

        executor.execute(&[], &[], &cancel, None).await.unwrap();
        executor.set_model("m2");
        executor.execute(&[], &[], &cancel, None).await.unwrap();

        assert_eq!(executor.model(), "m2");
        assert_eq!(*backend.models.lock().unwrap(), vec!["m1", "m2"]);
    }
}
