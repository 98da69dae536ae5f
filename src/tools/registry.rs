//! Name-indexed tool table shared by built-in and tool-server tools.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::logging;
use crate::models::ToolSchema;

use super::file::{ListDirTool, ReadFileTool};
use super::spec::{ToolContext, ToolError, ToolResult, ToolSpec};
use super::todo::{SharedTodoList, TodoWriteTool};

pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolSpec>>,
    context: ToolContext,
}

impl ToolRegistry {
    pub fn new(context: ToolContext) -> Self {
        Self {
            tools: BTreeMap::new(),
            context,
        }
    }

    /// Register a tool. A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn ToolSpec>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            logging::warn(format!("Tool '{name}' registered twice; keeping the latest"));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolSpec>> {
        self.tools.get(name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    #[must_use]
    pub fn context(&self) -> &ToolContext {
        &self.context
    }

    /// Schemas advertised to the backend, sorted by name.
    #[must_use]
    pub fn to_api_tools(&self) -> Vec<ToolSchema> {
        self.tools.values().map(|tool| tool.schema()).collect()
    }

    pub async fn execute(&self, name: &str, input: Value) -> Result<ToolResult, ToolError> {
        let Some(tool) = self.get(name) else {
            return Err(ToolError::not_available(format!(
                "tool '{name}' is not registered"
            )));
        };
        tool.execute(input, &self.context).await
    }
}

/// Builder for assembling a registry from tool groups.
pub struct ToolRegistryBuilder {
    tools: Vec<Arc<dyn ToolSpec>>,
}

impl Default for ToolRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    #[must_use]
    pub fn with_tool(mut self, tool: Arc<dyn ToolSpec>) -> Self {
        self.tools.push(tool);
        self
    }

    #[must_use]
    pub fn with_tools(mut self, tools: impl IntoIterator<Item = Arc<dyn ToolSpec>>) -> Self {
        self.tools.extend(tools);
        self
    }

    /// `read_file` and `list_dir`.
    #[must_use]
    pub fn with_file_tools(self) -> Self {
        self.with_tool(Arc::new(ReadFileTool))
            .with_tool(Arc::new(ListDirTool))
    }

    #[must_use]
    pub fn with_todo_tool(self, todos: SharedTodoList) -> Self {
        self.with_tool(Arc::new(TodoWriteTool::new(todos)))
    }

    pub fn build(self, context: ToolContext) -> ToolRegistry {
        let mut registry = ToolRegistry::new(context);
        for tool in self.tools {
            registry.register(tool);
        }
        registry
    }
}
