//! HTTP client for DeepSeek's OpenAI-compatible Chat Completions API.
//!
//! Requests are always streamed; the SSE body is decoded into
//! [`PartialUpdate`]s for the stream assembler.

use anyhow::Result;
use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::llm_client::{
    BackendError, ChatBackend, ChoiceDelta, PartialUpdate, ToolCallDelta, UpdateStream,
};
use crate::logging;
use crate::models::{Content, ContentChunk, Message, ToolSchema, Usage};

/// Function names on the wire allow only `[A-Za-z0-9_-]`; everything else is escaped.
fn to_api_tool_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            out.push(ch);
        } else if ch == '-' {
            out.push_str("--");
        } else {
            out.push_str(&format!("-x{:06X}-", ch as u32));
        }
    }
    out
}

fn from_api_tool_name(name: &str) -> String {
    let mut out = String::new();
    let mut iter = name.chars().peekable();
    while let Some(ch) = iter.next() {
        if ch != '-' {
            out.push(ch);
            continue;
        }
        match iter.peek().copied() {
            Some('-') => {
                iter.next();
                out.push('-');
            }
            Some('x') => {
                iter.next();
                let hex: String = iter.by_ref().take(6).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => {
                        if iter.peek() == Some(&'-') {
                            iter.next();
                        }
                        out.push(decoded);
                    }
                    None => {
                        out.push_str("-x");
                        out.push_str(&hex);
                    }
                }
            }
            _ => out.push('-'),
        }
    }
    out
}

// === DeepSeekClient ===

/// Streaming chat backend for DeepSeek (or any OpenAI-compatible server).
#[derive(Clone)]
pub struct DeepSeekClient {
    http_client: reqwest::Client,
    base_url: String,
    model: String,
}

impl DeepSeekClient {
    /// Create a client from loaded configuration.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_settings(&config.api_key()?, config.base_url(), config.model())
    }

    pub fn with_settings(
        api_key: &str,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let model = model.into();
        logging::info(format!("DeepSeek base URL: {base_url}, model: {model}"));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))?,
        );
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http_client,
            base_url,
            model,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ChatBackend for DeepSeekClient {
    fn provider_name(&self) -> &'static str {
        "deepseek"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn send(
        &self,
        model: &str,
        transcript: &[Message],
        tools: &[ToolSchema],
        cancel: CancellationToken,
    ) -> Result<UpdateStream, BackendError> {
        let body = build_request_body(model, transcript, tools);
        let request = self.http_client.post(self.chat_url()).json(&body);

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BackendError::Cancelled),
            response = request.send() => response
                .map_err(|e| BackendError::Transport(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, error_text));
        }

        let byte_stream = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut byte_stream = std::pin::pin!(byte_stream);
            let mut buffer = BytesMut::new();
            let mut data = String::new();

            'read: while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        yield Err(BackendError::Transport(format!("stream read error: {e}")));
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let raw = buffer.split_to(newline + 1);
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches(['\r', '\n']);

                    if !line.is_empty() {
                        if let Some(payload) = line.strip_prefix("data:") {
                            data.push_str(payload.trim_start());
                        }
                        // Other SSE fields (event:, id:, retry:) are ignored
                        continue;
                    }

                    // Blank line ends the event
                    let event = std::mem::take(&mut data);
                    if event.is_empty() {
                        continue;
                    }
                    if event.trim() == "[DONE]" {
                        break 'read;
                    }
                    match serde_json::from_str::<Value>(&event) {
                        Ok(chunk) => yield Ok(parse_sse_chunk(&chunk)),
                        Err(e) => logging::warn(format!("Skipping malformed SSE event: {e}")),
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn classify_status(status: StatusCode, body: String) -> BackendError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::Transport(format!("HTTP {status}: {body}"))
    } else {
        BackendError::Rejected {
            status: status.as_u16(),
            message: body,
        }
    }
}

// === Request Encoding ===

fn build_request_body(model: &str, transcript: &[Message], tools: &[ToolSchema]) -> Value {
    let mut body = json!({
        "model": model,
        "messages": transcript.iter().map(message_to_chat).collect::<Vec<_>>(),
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    if !tools.is_empty() {
        body["tools"] = json!(tools.iter().map(tool_to_chat).collect::<Vec<_>>());
    }
    body
}

fn message_to_chat(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({
            "role": "system",
            "content": content_to_chat(content),
        }),
        Message::User { content } => json!({
            "role": "user",
            "content": content_to_chat(content),
        }),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut msg = json!({
                "role": "assistant",
                "content": content.render(),
            });
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(
                    tool_calls
                        .iter()
                        .map(|call| json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": to_api_tool_name(&call.name),
                                "arguments": call.arguments.to_json_string(),
                            }
                        }))
                        .collect::<Vec<_>>()
                );
            }
            msg
        }
        Message::Tool {
            content,
            tool_call_id,
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "content": content.render(),
        }),
    }
}

fn content_to_chat(content: &Content) -> Value {
    match content {
        Content::Text(text) => json!(text),
        Content::Chunks(chunks) => json!(chunks.iter().map(chunk_to_chat).collect::<Vec<_>>()),
    }
}

fn chunk_to_chat(chunk: &ContentChunk) -> Value {
    match chunk {
        ContentChunk::Text { text } => json!({"type": "text", "text": text}),
        ContentChunk::Image { data, mime_type } => json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{mime_type};base64,{data}") },
        }),
        ContentChunk::Audio { data, mime_type } => json!({
            "type": "input_audio",
            "input_audio": {
                "data": data,
                "format": mime_type.rsplit('/').next().unwrap_or(mime_type.as_str()),
            },
        }),
        ContentChunk::Resource { text: Some(text), .. } => json!({"type": "text", "text": text}),
        ContentChunk::Resource { .. } => json!({"type": "text", "text": chunk.render()}),
    }
}

fn tool_to_chat(tool: &ToolSchema) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": to_api_tool_name(&tool.name),
            "description": tool.description,
            "parameters": tool.input_schema,
        }
    })
}

// === Stream Decoding ===

fn parse_usage(usage: &Value) -> Usage {
    let field = |primary: &str, fallback: &str| {
        usage
            .get(primary)
            .or_else(|| usage.get(fallback))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    let prompt = field("prompt_tokens", "input_tokens");
    let completion = field("completion_tokens", "output_tokens");
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Usage::new(prompt, completion, total)
}

fn parse_sse_chunk(chunk: &Value) -> PartialUpdate {
    let error = chunk.get("error").filter(|e| !e.is_null()).map(|e| {
        e.get("message")
            .and_then(Value::as_str)
            .map_or_else(|| e.to_string(), str::to_string)
    });
    let usage = chunk
        .get("usage")
        .filter(|u| u.is_object())
        .map(parse_usage);

    let choices = chunk
        .get("choices")
        .and_then(Value::as_array)
        .map(|choices| choices.iter().map(parse_choice).collect())
        .unwrap_or_default();

    PartialUpdate {
        choices,
        usage,
        error,
    }
}

fn parse_choice(choice: &Value) -> ChoiceDelta {
    let index = choice
        .get("index")
        .and_then(Value::as_u64)
        .and_then(|i| u32::try_from(i).ok())
        .unwrap_or(0);
    let delta = choice.get("delta");
    let content = delta
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let tool_calls = delta
        .and_then(|d| d.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| calls.iter().map(parse_tool_call_delta).collect())
        .unwrap_or_default();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);

    ChoiceDelta {
        index,
        content,
        tool_calls,
        finish_reason,
    }
}

fn parse_tool_call_delta(call: &Value) -> ToolCallDelta {
    let function = call.get("function");
    let str_at = |value: Option<&Value>, key: &str| {
        value
            .and_then(|v| v.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    ToolCallDelta {
        index: call
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok())
            .unwrap_or(0),
        id: str_at(Some(call), "id"),
        name: str_at(function, "name").map(|name| from_api_tool_name(&name)),
        arguments: str_at(function, "arguments"),
    }
}
