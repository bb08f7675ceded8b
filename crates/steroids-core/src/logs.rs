//! On-disk run logs.
//!
//! Two surfaces: an append-only JSONL activity log per invocation at
//! `<project>/.steroids/invocations/<invocation_id>.log`, and daily run
//! log directories under `<project>/.steroids/logs/YYYY-MM-DD/`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use steroids_db::pool::project_state_dir;

/// Directory holding per-invocation activity logs.
pub fn invocations_dir(project_root: &Path) -> PathBuf {
    project_state_dir(project_root).join("invocations")
}

/// Path of one invocation's activity log.
pub fn invocation_log_path(project_root: &Path, invocation_id: Uuid) -> PathBuf {
    invocations_dir(project_root).join(format!("{invocation_id}.log"))
}

/// Daily run-log directory for a date, created on demand.
pub fn daily_log_dir(project_root: &Path, date: DateTime<Utc>) -> Result<PathBuf> {
    let dir = project_state_dir(project_root)
        .join("logs")
        .join(date.format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    Ok(dir)
}

/// Append-only JSONL activity log for one invocation.
pub struct ActivityLog {
    path: PathBuf,
    file: File,
}

impl ActivityLog {
    /// Open (creating) the activity log for an invocation.
    pub fn create(project_root: &Path, invocation_id: Uuid) -> Result<Self> {
        let dir = invocations_dir(project_root);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let path = invocation_log_path(project_root, invocation_id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open activity log {}", path.display()))?;

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one structured event as a JSON line. Write failures are
    /// returned, not panicked; callers treat them as best-effort.
    pub fn append(&mut self, event: &serde_json::Value) -> Result<()> {
        let line = serde_json::to_string(event).context("failed to serialize activity event")?;
        writeln!(self.file, "{line}")
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_writes_one_line_per_event() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();

        let mut log = ActivityLog::create(tmp.path(), id).unwrap();
        log.append(&json!({"type": "stdout", "chunk": "hello"})).unwrap();
        log.append(&json!({"type": "exit", "code": 0})).unwrap();

        let contents = std::fs::read_to_string(invocation_log_path(tmp.path(), id)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "stdout");
    }

    #[test]
    fn reopen_appends_rather_than_truncates() {
        let tmp = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();

        {
            let mut log = ActivityLog::create(tmp.path(), id).unwrap();
            log.append(&json!({"n": 1})).unwrap();
        }
        {
            let mut log = ActivityLog::create(tmp.path(), id).unwrap();
            log.append(&json!({"n": 2})).unwrap();
        }

        let contents = std::fs::read_to_string(invocation_log_path(tmp.path(), id)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn daily_dir_uses_date_format() {
        let tmp = tempfile::tempdir().unwrap();
        let date = "2025-03-04T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let dir = daily_log_dir(tmp.path(), date).unwrap();
        assert!(dir.ends_with(".steroids/logs/2025-03-04"));
        assert!(dir.exists());
    }
}
