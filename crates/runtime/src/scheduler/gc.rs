//! Workspace garbage collection: agent workspaces are retained for a window
//! after their run ends, then removed.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Persona statuses that mark a workspace as finished.
const TERMINAL_STATUSES: &[&str] = &["completed", "failed", "cancelled"];

/// Remove terminal workspaces older than `retention_hours`. Returns how many
/// were removed. A workspace whose persona file is unreadable is left alone —
/// recovery may still want it.
pub fn sweep_workspaces(
    workspaces_dir: &Path,
    retention_hours: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    if !workspaces_dir.exists() {
        return Ok(0);
    }

    let retention = Duration::hours(retention_hours);
    let mut removed = 0usize;

    for entry in fs::read_dir(workspaces_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let persona_path = path.join("agent_persona.json");
        let Ok(raw) = fs::read_to_string(&persona_path) else {
            continue;
        };
        let Ok(persona) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let status = persona.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if !TERMINAL_STATUSES.contains(&status) {
            continue;
        }

        // Age by the newest file anywhere in the workspace, so a run that
        // kept writing output counts from its last activity.
        let newest = newest_mtime(&path);
        let Some(newest) = newest else { continue };
        let age = now.signed_duration_since(DateTime::<Utc>::from(newest));
        if age > retention {
            match fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(workspace = %path.display(), "garbage-collected agent workspace");
                    removed += 1;
                }
                Err(err) => warn!(%err, workspace = %path.display(), "workspace GC failed"),
            }
        }
    }
    Ok(removed)
}

fn newest_mtime(dir: &Path) -> Option<SystemTime> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace(root: &Path, id: &str, status: &str) -> std::path::PathBuf {
        let dir = root.join(id);
        fs::create_dir_all(dir.join("workspace/output")).unwrap();
        fs::write(
            dir.join("agent_persona.json"),
            format!(r#"{{"status":"{status}"}}"#),
        )
        .unwrap();
        dir
    }

    #[test]
    fn old_terminal_workspaces_are_removed() {
        let root = tempfile::tempdir().unwrap();
        let done = workspace(root.path(), "ag-done", "completed");
        let running = workspace(root.path(), "ag-running", "running");

        // Files were written just now, so with the clock pushed two days
        // ahead the completed one is past retention.
        let future = Utc::now() + Duration::hours(48);
        let removed = sweep_workspaces(root.path(), 24, future).unwrap();
        assert_eq!(removed, 1);
        assert!(!done.exists());
        assert!(running.exists());
    }

    #[test]
    fn fresh_terminal_workspaces_survive() {
        let root = tempfile::tempdir().unwrap();
        let done = workspace(root.path(), "ag-done", "completed");
        let removed = sweep_workspaces(root.path(), 24, Utc::now()).unwrap();
        assert_eq!(removed, 0);
        assert!(done.exists());
    }

    #[test]
    fn unreadable_persona_is_left_alone() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("ag-mystery");
        fs::create_dir_all(&dir).unwrap();
        let removed = sweep_workspaces(root.path(), 24, Utc::now() + Duration::days(30)).unwrap();
        assert_eq!(removed, 0);
        assert!(dir.exists());
    }

    #[test]
    fn missing_root_is_a_no_op() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert_eq!(sweep_workspaces(&missing, 24, Utc::now()).unwrap(), 0);
    }
}
