//! `todo_write`: the model's working task list.
//!
//! The list is shared with the orchestrator, which summarizes outstanding
//! items into the outgoing request (see `core::capabilities`).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    #[serde(alias = "inprogress")]
    InProgress,
    #[serde(alias = "done")]
    Completed,
}

impl TodoStatus {
    fn label(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Default)]
pub struct TodoList {
    items: Vec<TodoItem>,
}

impl TodoList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, items: Vec<TodoItem>) {
        self.items = items;
    }

    #[must_use]
    pub fn items(&self) -> &[TodoItem] {
        &self.items
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Items not yet completed, in list order.
    pub fn outstanding(&self) -> impl Iterator<Item = &TodoItem> {
        self.items
            .iter()
            .filter(|item| item.status != TodoStatus::Completed)
    }

    /// Reminder block listing outstanding items, or `None` when nothing is left.
    #[must_use]
    pub fn outstanding_summary(&self) -> Option<String> {
        let lines: Vec<String> = self
            .outstanding()
            .map(|item| format!("- [{}] {}", item.status.label(), item.content))
            .collect();
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "<system-reminder>\nOutstanding tasks from your todo list:\n{}\n</system-reminder>",
            lines.join("\n")
        ))
    }
}

pub type SharedTodoList = Arc<Mutex<TodoList>>;

#[must_use]
pub fn new_shared_todo_list() -> SharedTodoList {
    Arc::new(Mutex::new(TodoList::new()))
}

#[derive(Deserialize)]
struct TodoWriteParams {
    todos: Vec<TodoItem>,
}

pub struct TodoWriteTool {
    todos: SharedTodoList,
}

impl TodoWriteTool {
    pub fn new(todos: SharedTodoList) -> Self {
        Self { todos }
    }
}

#[async_trait]
impl ToolSpec for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> &str {
        "Replace the task list. Each item has content and a status of pending, in_progress or completed."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        },
                        "required": ["content"]
                    }
                }
            },
            "required": ["todos"]
        })
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        if input.get("todos").is_none() {
            return Err(ToolError::missing_field("todos"));
        }
        let params: TodoWriteParams = serde_json::from_value(input)
            .map_err(|e| ToolError::invalid_input(format!("Invalid todo list: {e}")))?;
        if params.todos.iter().any(|item| item.content.trim().is_empty()) {
            return Err(ToolError::invalid_input("todo content cannot be empty"));
        }

        let mut todos = self.todos.lock().await;
        todos.replace(params.todos);
        let completed = todos
            .items()
            .iter()
            .filter(|item| item.status == TodoStatus::Completed)
            .count();
        Ok(ToolResult::success(format!(
            "Todo list updated: {completed}/{} completed",
            todos.items().len()
        )))
    }
}
