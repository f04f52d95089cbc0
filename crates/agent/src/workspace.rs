//! Per-task workspace directories under `agent-workspaces/<agent_id>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::warn;

use crate::persona::AgentPersona;
use crate::plan::{StepPlan, empty_plan_json};

/// Layout:
/// ```text
/// <agent_id>/
/// ├── agent_persona.json
/// ├── plan.json
/// ├── intake_knowledge.md
/// └── workspace/
///     ├── research/
///     └── output/
/// ```
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the directory tree for a new agent task. `plan.json` starts as
    /// an empty placeholder so crash recovery always finds a readable file.
    pub fn create(base: &Path, agent_id: &str) -> Result<Workspace> {
        let root = base.join(agent_id);
        fs::create_dir_all(root.join("workspace/research"))?;
        fs::create_dir_all(root.join("workspace/output"))?;
        fs::write(
            root.join("plan.json"),
            serde_json::to_string_pretty(&empty_plan_json())?,
        )?;
        Ok(Workspace { root })
    }

    /// Open an existing workspace (recovery path).
    pub fn open(base: &Path, agent_id: &str) -> Workspace {
        Workspace { root: base.join(agent_id) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_path(&self) -> PathBuf {
        self.root.join("plan.json")
    }

    pub fn persona_path(&self) -> PathBuf {
        self.root.join("agent_persona.json")
    }

    /// The sandbox directory tools operate in.
    pub fn sandbox(&self) -> PathBuf {
        self.root.join("workspace")
    }

    pub fn save_persona(&self, persona: &AgentPersona) -> Result<()> {
        let tmp = self.persona_path().with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(persona)?)?;
        if let Err(err) = fs::rename(&tmp, self.persona_path()) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn load_persona(&self) -> Option<AgentPersona> {
        let raw = fs::read_to_string(self.persona_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save_intake(&self, knowledge: &str) -> Result<()> {
        fs::write(self.root.join("intake_knowledge.md"), knowledge)?;
        Ok(())
    }

    pub fn load_plan(&self) -> Option<StepPlan> {
        StepPlan::load(&self.plan_path())
    }

    /// The briefing block for a step: the sandbox listing plus the plan's
    /// completed/remaining summary.
    pub fn briefing(&self, plan_summary: &str) -> String {
        format!(
            "WORKSPACE FILES:\n{}\n\n{plan_summary}",
            self.listing().unwrap_or_else(|_| "(empty)".to_string())
        )
    }

    /// Relative listing of the sandbox, two levels deep, sorted.
    pub fn listing(&self) -> Result<String> {
        let sandbox = self.sandbox();
        let mut lines = Vec::new();
        collect_listing(&sandbox, &sandbox, 0, &mut lines)?;
        if lines.is_empty() {
            return Ok("(empty)".to_string());
        }
        lines.sort();
        Ok(lines.join("\n"))
    }
}

fn collect_listing(root: &Path, dir: &Path, depth: usize, lines: &mut Vec<String>) -> Result<()> {
    if depth > 2 || !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "unreadable workspace entry");
                continue;
            }
        };
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap_or(&path).display().to_string();
        if path.is_dir() {
            lines.push(format!("{rel}/"));
            collect_listing(root, &path, depth + 1, lines)?;
        } else {
            lines.push(rel);
        }
    }
    Ok(())
}
