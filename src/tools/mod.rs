//! Tool system modules and re-exports.

// === Modules ===

pub mod file;
pub mod registry;
pub mod spec;
pub mod todo;

// === Re-exports ===

pub use spec::{ToolContext, ToolError, ToolResult, ToolSpec};

pub use registry::{ToolRegistry, ToolRegistryBuilder};

pub use file::{ListDirTool, ReadFileTool};

pub use todo::{SharedTodoList, TodoWriteTool, new_shared_todo_list};
