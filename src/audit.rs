//! JSON-lines audit trail for tool approvals and executions.
//!
//! Enabled only when `DEEPSEEK_TOOL_AUDIT_LOG` names a file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{Value, json};

pub const AUDIT_LOG_ENV: &str = "DEEPSEEK_TOOL_AUDIT_LOG";

/// Append a tool lifecycle event to the audit log, if one is configured.
///
/// Write failures are logged and otherwise ignored.
pub fn emit_tool_audit(event: &str, details: Value) {
    let Some(path) = std::env::var_os(AUDIT_LOG_ENV) else {
        return;
    };
    if let Err(err) = append_event(&PathBuf::from(path), event, details) {
        crate::logging::warn(format!("audit log write failed: {err}"));
    }
}

fn append_event(path: &Path, event: &str, details: Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let record = json!({
        "ts": Utc::now().to_rfc3339(),
        "event": event,
        "details": details,
    });
    writeln!(file, "{}", serde_json::to_string(&record)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_record_per_line() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("audit.jsonl");

        append_event(&path, "tool.approved", json!({"tool_name": "read_file"}))?;
        append_event(&path, "tool.denied", json!({"tool_name": "exec_shell"}))?;

        let contents = fs::read_to_string(&path)?;
        let records: Vec<Value> = contents
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["event"], "tool.approved");
        assert_eq!(records[1]["details"]["tool_name"], "exec_shell");
        assert!(records[0]["ts"].is_string());
        Ok(())
    }
}
