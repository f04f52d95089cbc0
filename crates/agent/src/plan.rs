//! Step plans and their on-disk form.
//!
//! `plan.json` is the single source of truth for pipeline progress. It is
//! rewritten after every tool result and at every step boundary, so recovery
//! can resume at the last completed step. Readers tolerate an empty or
//! half-written file and simply try again.

use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use dotbot_llm::{ChatMessage, ChatOptions, LlmError, ResilientClient, Role, extract_json};

/// Planner bounds.
pub const MAX_STEPS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub title: String,
    pub description: String,
    pub expected_output: String,
    #[serde(default)]
    pub tool_ids: Vec<String>,
    #[serde(default)]
    pub needs_external_data: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlanProgress {
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub remaining: Vec<String>,
    /// Step currently executing; `None` between steps.
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub failed_at: Option<String>,
    #[serde(default)]
    pub stopped_at: Option<String>,
    /// Tool-call log flushed after every result, for recovery forensics.
    #[serde(default)]
    pub tool_log: Vec<ToolLogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolLogEntry {
    pub step_id: String,
    pub tool: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPlan {
    pub approach: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub progress: PlanProgress,
}

impl StepPlan {
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Mark a step as the one executing.
    pub fn begin_step(&mut self, id: &str) {
        self.progress.current = Some(id.to_string());
    }

    /// Move a finished step from remaining to completed; clears `current`.
    pub fn complete_step(&mut self, id: &str) {
        self.progress.remaining.retain(|s| s != id);
        if !self.progress.completed.iter().any(|s| s == id) {
            self.progress.completed.push(id.to_string());
        }
        self.progress.current = None;
    }

    pub fn fail_step(&mut self, id: &str) {
        self.progress.failed_at = Some(id.to_string());
        self.progress.current = None;
    }

    pub fn stop_at_step(&mut self, id: &str) {
        self.progress.stopped_at = Some(id.to_string());
        self.progress.current = None;
    }

    /// Save to `plan.json` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Load from `plan.json`. `None` for missing, empty, or partially
    /// written files — the caller retries or treats the plan as absent.
    pub fn load(path: &Path) -> Option<StepPlan> {
        let raw = fs::read_to_string(path).ok()?;
        if raw.trim().is_empty() {
            return None;
        }
        match serde_json::from_str(&raw) {
            Ok(plan) => Some(plan),
            Err(err) => {
                warn!(%err, path = %path.display(), "unreadable plan.json — treating as absent");
                None
            }
        }
    }
}

// ── Planner ──────────────────────────────────────────────────────────────────

/// Shape the planner model replies with.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PlannerReply {
    approach: String,
    is_simple_task: bool,
    steps: Vec<PlannerStep>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct PlannerStep {
    title: String,
    description: String,
    expected_output: String,
    tool_ids: Vec<String>,
    needs_external_data: bool,
}

/// Produce a plan for the restated request. `available_tools` is the
/// manifest's id list; the model picks a per-step subset.
pub async fn build_plan(
    llm: &ResilientClient,
    restated_request: &str,
    system_prompt: &str,
    available_tools: &[String],
    max_steps: usize,
) -> Result<StepPlan, LlmError> {
    let max_steps = max_steps.clamp(1, MAX_STEPS);
    let system = format!(
        "{system_prompt}\n\nPlan the task as JSON: {{\"approach\": str, \
         \"is_simple_task\": bool, \"steps\": [{{\"title\", \"description\", \
         \"expected_output\", \"tool_ids\": [str], \"needs_external_data\": bool}}]}}. \
         Use 1-{max_steps} steps; a simple task gets exactly one. Only use tool ids \
         from the list."
    );
    let user = format!(
        "TASK:\n{restated_request}\n\nAVAILABLE TOOLS:\n{}",
        available_tools.join(", ")
    );
    let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];

    let response = llm
        .chat(Role::Workhorse, &messages, &ChatOptions::default())
        .await?;
    let reply = extract_json::<PlannerReply>(&response.content).unwrap_or_else(|| {
        warn!("planner returned no parseable JSON — falling back to a single step");
        PlannerReply {
            approach: "Complete the task directly.".to_string(),
            is_simple_task: true,
            steps: vec![],
        }
    });

    Ok(materialize(reply, restated_request, available_tools, max_steps))
}

fn materialize(
    reply: PlannerReply,
    restated_request: &str,
    available_tools: &[String],
    max_steps: usize,
) -> StepPlan {
    let mut planner_steps = reply.steps;
    if reply.is_simple_task || planner_steps.is_empty() {
        planner_steps.truncate(1);
    }
    planner_steps.truncate(max_steps);
    if planner_steps.is_empty() {
        planner_steps.push(PlannerStep {
            title: "Complete the task".to_string(),
            description: restated_request.to_string(),
            expected_output: "The task's result".to_string(),
            tool_ids: available_tools.to_vec(),
            needs_external_data: false,
        });
    }

    let steps: Vec<PlanStep> = planner_steps
        .into_iter()
        .map(|s| PlanStep {
            id: format!("step-{}", Uuid::new_v4().simple()),
            title: s.title,
            description: s.description,
            expected_output: s.expected_output,
            // Unknown tool ids are dropped here; the step runner intersects
            // again against the live manifest.
            tool_ids: s
                .tool_ids
                .into_iter()
                .filter(|id| available_tools.contains(id))
                .collect(),
            needs_external_data: s.needs_external_data,
        })
        .collect();

    let remaining = steps.iter().map(|s| s.id.clone()).collect();
    StepPlan {
        approach: if reply.approach.is_empty() {
            "Work through the steps in order.".to_string()
        } else {
            reply.approach
        },
        steps,
        progress: PlanProgress {
            remaining,
            ..Default::default()
        },
    }
}

/// Record one tool result into the plan file. Called from the step runner's
/// observer after every tool call.
pub fn flush_tool_result(path: &Path, plan: &mut StepPlan, step_id: &str, tool: &str, success: bool) {
    plan.progress.tool_log.push(ToolLogEntry {
        step_id: step_id.to_string(),
        tool: tool.to_string(),
        success,
        at: Utc::now(),
    });
    if let Err(err) = plan.save(path) {
        warn!(%err, "failed to flush plan.json after tool result");
    }
}

/// A plan summary block for step briefings.
pub fn progress_summary(plan: &StepPlan) -> String {
    let completed = plan
        .progress
        .completed
        .iter()
        .filter_map(|id| plan.step(id))
        .map(|s| format!("- [done] {}", s.title))
        .collect::<Vec<_>>()
        .join("\n");
    let remaining = plan
        .progress
        .remaining
        .iter()
        .filter_map(|id| plan.step(id))
        .map(|s| format!("- [todo] {}", s.title))
        .collect::<Vec<_>>()
        .join("\n");
    let mut out = String::new();
    if !completed.is_empty() {
        out.push_str(&format!("COMPLETED STEPS:\n{completed}\n"));
    }
    if !remaining.is_empty() {
        out.push_str(&format!("REMAINING STEPS:\n{remaining}\n"));
    }
    if out.is_empty() {
        out.push_str("(no steps recorded)\n");
    }
    out
}

/// Placeholder JSON written before the planner has produced anything, so a
/// crash between workspace creation and planning leaves a readable file.
pub fn empty_plan_json() -> serde_json::Value {
    json!({"approach": "", "steps": [], "progress": {"completed": [], "remaining": []}})
}
