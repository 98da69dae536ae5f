//! Workspace-confined file readers: `read_file` and `list_dir`.

use std::io::ErrorKind;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::fs;

use super::spec::{
    ToolContext, ToolError, ToolResult, ToolSpec, optional_str, optional_u64, required_str,
};

const DEFAULT_READ_LIMIT: u64 = 2000;
const MAX_DIR_ENTRIES: usize = 500;

pub struct ReadFileTool;

#[async_trait]
impl ToolSpec for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 file from the workspace. Lines are numbered; use offset and limit for large files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative path" },
                "offset": { "type": "integer", "description": "First line to read (1-indexed)" },
                "limit": { "type": "integer", "description": "Maximum number of lines" }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw_path = required_str(&input, "path")?;
        let path = context.resolve_path(raw_path)?;
        let offset = optional_u64(&input, "offset", 1).max(1);
        let limit = optional_u64(&input, "limit", DEFAULT_READ_LIMIT);

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(ToolResult::error(format!("File not found: {raw_path}")));
            }
            Err(err) => {
                return Err(ToolError::execution_failed(format!(
                    "Failed to read {raw_path}: {err}"
                )));
            }
        };

        let total = contents.lines().count();
        let start = usize::try_from(offset - 1).unwrap_or(usize::MAX);
        let take = usize::try_from(limit).unwrap_or(usize::MAX);
        let selected: Vec<String> = contents
            .lines()
            .enumerate()
            .skip(start)
            .take(take)
            .map(|(i, line)| format!("{:>5} | {line}", i + 1))
            .collect();

        Ok(ToolResult::success(selected.join("\n")).with_metadata(json!({
            "path": raw_path,
            "total_lines": total,
            "read_lines": selected.len(),
        })))
    }
}

pub struct ListDirTool;

#[async_trait]
impl ToolSpec for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a workspace directory. Directories are suffixed with '/'."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative directory (default '.')" }
            }
        })
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError> {
        let raw_path = optional_str(&input, "path").unwrap_or(".");
        let path = context.resolve_path(raw_path)?;

        let mut reader = match fs::read_dir(&path).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(ToolResult::error(format!("Directory not found: {raw_path}")));
            }
            Err(err) => {
                return Err(ToolError::execution_failed(format!(
                    "Failed to list {raw_path}: {err}"
                )));
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::execution_failed(format!("Failed to list {raw_path}: {e}")))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.is_ok_and(|kind| kind.is_dir()) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        let truncated = entries.len() > MAX_DIR_ENTRIES;
        entries.truncate(MAX_DIR_ENTRIES);
        let mut listing = entries.join("\n");
        if truncated {
            listing.push_str(&format!("\n... (truncated at {MAX_DIR_ENTRIES} entries)"));
        }
        if listing.is_empty() {
            listing = "(empty directory)".to_string();
        }
        Ok(ToolResult::success(listing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn workspace() -> (tempfile::TempDir, ToolContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "one\ntwo\nthree\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# readme\n").unwrap();
        let ctx = ToolContext::new(dir.path());
        (dir, ctx)
    }

    #[tokio::test]
    async fn reads_numbered_line_window() {
        let (_dir, ctx) = workspace();
        let result = ReadFileTool
            .execute(json!({"path": "src/lib.rs", "offset": 2, "limit": 1}), &ctx)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.content.text(), "    2 | two");
        assert_eq!(result.metadata.unwrap()["total_lines"], 3);
    }

    #[tokio::test]
    async fn missing_file_is_a_tool_reported_error() {
        let (_dir, ctx) = workspace();
        let result = ReadFileTool
            .execute(json!({"path": "nope.rs"}), &ctx)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.content.text(), "File not found: nope.rs");
    }

    #[tokio::test]
    async fn escaping_the_workspace_is_refused() {
        let (_dir, ctx) = workspace();
        let err = ReadFileTool
            .execute(json!({"path": "../../etc/passwd"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::PathEscape { .. }));
    }

    #[tokio::test]
    async fn lists_sorted_entries_with_dir_suffix() {
        let (_dir, ctx) = workspace();
        let result = ListDirTool.execute(json!({}), &ctx).await.unwrap();
        assert_eq!(result.content.text(), "README.md\nsrc/");
    }
}
