//! Conversation models shared by the backend client, tools, and the engine.

use std::collections::HashMap;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// === Content ===

/// A single content chunk inside a message or tool output.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentChunk {
    Text {
        text: String,
    },
    Image {
        data: String,
        mime_type: String,
    },
    Audio {
        data: String,
        mime_type: String,
    },
    Resource {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
}

impl ContentChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text rendering for display and for text-only backends.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Image { .. } => "[image content]".to_string(),
            Self::Audio { .. } => "[audio content]".to_string(),
            Self::Resource { uri, text, .. } => match text {
                Some(text) => text.clone(),
                None => format!("[resource {uri}]"),
            },
        }
    }
}

/// Message content: a plain string or an ordered list of chunks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Chunks(Vec<ContentChunk>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl Content {
    /// Concatenation of the text chunks only.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Chunks(chunks) => chunks
                .iter()
                .filter_map(|chunk| match chunk {
                    ContentChunk::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Full rendering, with placeholders for non-text chunks.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Chunks(chunks) => chunks
                .iter()
                .map(ContentChunk::render)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Chunks(chunks) => chunks.is_empty(),
        }
    }

    /// Copy of this content with an extra text block at the end.
    #[must_use]
    pub fn with_appended_text(&self, block: &str) -> Self {
        match self {
            Self::Text(text) if text.is_empty() => Self::Text(block.to_string()),
            Self::Text(text) => Self::Text(format!("{text}\n\n{block}")),
            Self::Chunks(chunks) => {
                let mut chunks = chunks.clone();
                chunks.push(ContentChunk::text(block));
                Self::Chunks(chunks)
            }
        }
    }
}

// === Messages ===

/// A transcript message, tagged by role.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        content: Content,
    },
    User {
        content: Content,
    },
    Assistant {
        content: Content,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        content: Content,
        tool_call_id: String,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: Content::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: Content::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: Content::Text(text.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self::Tool {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
        }
    }

    #[must_use]
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    #[must_use]
    pub fn content(&self) -> &Content {
        match self {
            Self::System { content }
            | Self::User { content }
            | Self::Assistant { content, .. }
            | Self::Tool { content, .. } => content,
        }
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    #[must_use]
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Self::Tool { tool_call_id, .. } => Some(tool_call_id),
            _ => None,
        }
    }
}

// === Tool Calls ===

/// Tool-call arguments, either still as streamed JSON text or decoded.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ToolArguments {
    Raw(String),
    Decoded(Map<String, Value>),
}

impl Default for ToolArguments {
    fn default() -> Self {
        Self::Raw(String::new())
    }
}

impl ToolArguments {
    /// Decode into a JSON object. Blank raw text decodes to an empty object.
    pub fn decode(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match self {
            Self::Decoded(map) => Ok(map.clone()),
            Self::Raw(raw) if raw.trim().is_empty() => Ok(Map::new()),
            Self::Raw(raw) => serde_json::from_str(raw),
        }
    }

    /// JSON text form, as the chat-completions wire format expects.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        match self {
            Self::Raw(raw) if raw.trim().is_empty() => "{}".to_string(),
            Self::Raw(raw) => raw.clone(),
            Self::Decoded(map) => Value::Object(map.clone()).to_string(),
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: ToolArguments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => ToolArguments::Decoded(map),
            other => ToolArguments::Raw(other.to_string()),
        };
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            index: None,
        }
    }

    /// Both id and function name are present.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.id.trim().is_empty() && !self.name.trim().is_empty()
    }

    /// Replace raw arguments with their decoded form when they parse.
    #[must_use]
    pub fn into_decoded(mut self) -> Self {
        if let ToolArguments::Raw(_) = self.arguments
            && let Ok(map) = self.arguments.decode()
        {
            self.arguments = ToolArguments::Decoded(map);
        }
        self
    }
}

/// Tool definition exposed to the model.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// === Usage ===

/// Token usage for one response, or a running sum.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(rhs.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(rhs.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(rhs.total_tokens);
    }
}

/// Per-model usage totals for a session.
#[derive(Debug, Clone, Default)]
pub struct UsageCounters {
    by_model: HashMap<String, Usage>,
}

impl UsageCounters {
    pub fn record(&mut self, model: &str, usage: Usage) {
        *self.by_model.entry(model.to_string()).or_default() += usage;
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Usage {
        self.by_model.get(model).copied().unwrap_or_default()
    }

    pub fn models(&self) -> impl Iterator<Item = (&str, &Usage)> {
        self.by_model.iter().map(|(model, usage)| (model.as_str(), usage))
    }
}

// === Conversation Entries ===

/// Kind of a UI-facing transcript entry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    User,
    Assistant,
    Command,
    Tool,
}

/// Lifecycle status of an entry.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Running,
    Success,
    Error,
}

/// A UI-facing transcript item. Only `status` changes after creation.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConversationEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntryStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ConversationEntry {
    pub fn new(kind: EntryKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            status: None,
            tool_call_id: None,
            created_at: Utc::now(),
        }
    }

    /// A tool entry in the `running` state.
    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            status: Some(EntryStatus::Running),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(EntryKind::Tool, content)
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Ordered entry list with status patching by id.
#[derive(Debug, Clone, Default)]
pub struct EntryLog {
    entries: Vec<ConversationEntry>,
}

impl EntryLog {
    pub fn push(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    /// Patch the status of the entry with `id`. Returns false if no entry matched.
    pub fn patch_status(&mut self, id: &str, status: EntryStatus) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.status = Some(status);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ConversationEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    #[must_use]
    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn message_serializes_with_role_tag() {
        let message = Message::tool_result("call_1", "done");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"role": "tool", "content": "done", "tool_call_id": "call_1"})
        );
    }

    #[test]
    fn chunked_content_roundtrips_through_serde() {
        let message = Message::User {
            content: Content::Chunks(vec![
                ContentChunk::text("look at this"),
                ContentChunk::Image {
                    data: "aGVsbG8=".to_string(),
                    mime_type: "image/png".to_string(),
                },
            ]),
        };
        let text = serde_json::to_string(&message).unwrap();
        let parsed: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(parsed.content().text(), "look at this");
        assert_eq!(parsed.content().render(), "look at this\n[image content]");
    }

    #[test]
    fn appended_text_leaves_original_untouched() {
        let original = Content::Text("fix the build".to_string());
        let augmented = original.with_appended_text("<todos>\n- [ ] run tests\n</todos>");
        assert_eq!(original.text(), "fix the build");
        assert!(augmented.text().starts_with("fix the build\n\n<todos>"));

        let chunks = Content::Chunks(vec![ContentChunk::text("a")]);
        let augmented = chunks.with_appended_text("b");
        assert_eq!(augmented.text(), "ab");
    }

    #[test]
    fn tool_arguments_decode_blank_as_empty_object() {
        assert!(ToolArguments::Raw("  ".to_string()).decode().unwrap().is_empty());
        let decoded = ToolArguments::Raw("{\"a\":1}".to_string()).decode().unwrap();
        assert_eq!(decoded.get("a"), Some(&json!(1)));
        assert!(ToolArguments::Raw("{\"a\":".to_string()).decode().is_err());
        assert!(ToolArguments::Raw("[1]".to_string()).decode().is_err());
    }

    #[test]
    fn tool_call_well_formedness() {
        assert!(ToolCall::new("call_1", "read_file", json!({})).is_well_formed());
        assert!(!ToolCall::new("", "read_file", json!({})).is_well_formed());
        assert!(!ToolCall::new("call_1", " ", json!({})).is_well_formed());
    }

    #[test]
    fn usage_counters_accumulate_per_model() {
        let mut counters = UsageCounters::default();
        counters.record("m1", Usage::new(10, 5, 15));
        counters.record("m2", Usage::new(1, 1, 2));
        counters.record("m1", Usage::new(20, 10, 30));
        assert_eq!(counters.get("m1"), Usage::new(30, 15, 45));
        assert_eq!(counters.get("m2"), Usage::new(1, 1, 2));
        assert_eq!(counters.get("m3"), Usage::default());
    }

    #[test]
    fn entry_log_patches_status_by_id() {
        let mut log = EntryLog::default();
        let entry = ConversationEntry::tool("call_1", "read_file");
        let id = entry.id.clone();
        log.push(ConversationEntry::new(EntryKind::User, "hi"));
        log.push(entry);

        assert!(log.patch_status(&id, EntryStatus::Success));
        assert_eq!(log.get(&id).unwrap().status, Some(EntryStatus::Success));
        assert!(!log.patch_status("missing", EntryStatus::Error));
        assert_eq!(log.len(), 2);
    }
}
