//! Agent personas and the two-phase recruiter.
//!
//! Phase 1 skims persona summaries and picks who works the task (plus a
//! model role). Phase 2 reads the chosen personas in full and writes the
//! custom system prompt and the validated tool subset. The result is
//! persisted as `agent_persona.json` in the task workspace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use dotbot_llm::{ChatMessage, ChatOptions, LlmError, ResilientClient, Role, extract_json};

/// Lifecycle of an agent task. `Cancelled` is terminal — no later transition
/// may overwrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Running,
    Blocked,
    Cancelled,
    Completed,
    Failed,
}

/// A persona available for recruitment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub id: String,
    pub name: String,
    /// One-line pitch shown in phase 1.
    pub summary: String,
    /// Full persona text read in phase 2.
    pub body: String,
}

/// `agent_persona.json` — who is working the task and under what prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPersona {
    pub agent_id: String,
    pub status: AgentStatus,
    pub persona_ids: Vec<String>,
    #[serde(default)]
    pub council: Vec<String>,
    pub model_role: Option<Role>,
    pub system_prompt: String,
    pub tool_ids: Vec<String>,
    /// Every restatement of the task so far (intake plus re-entries).
    pub restated_requests: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ── Phase 1: pick personas and a model role ──────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RecruitPick {
    persona_ids: Vec<String>,
    council: Vec<String>,
    model_role: Option<String>,
}

/// Outcome of the two recruiter passes.
pub struct Recruitment {
    pub persona_ids: Vec<String>,
    pub council: Vec<String>,
    pub model_role: Option<Role>,
    pub system_prompt: String,
    pub tool_ids: Vec<String>,
}

pub async fn recruit(
    llm: &ResilientClient,
    restated_request: &str,
    catalog: &[PersonaProfile],
    manifest_tool_ids: &[String],
) -> Result<Recruitment, LlmError> {
    // Phase 1: summaries only.
    let listing = catalog
        .iter()
        .map(|p| format!("- {} ({}): {}", p.id, p.name, p.summary))
        .collect::<Vec<_>>()
        .join("\n");
    let messages = vec![
        ChatMessage::system(
            "Recruit for a task. Reply with JSON: {\"persona_ids\": [str], \
             \"council\": [str], \"model_role\": str?}. Pick one lead persona, \
             optionally a review council, and a model role from: workhorse, \
             deep_context, architect, gui_fast.",
        ),
        ChatMessage::user(format!("TASK:\n{restated_request}\n\nPERSONAS:\n{listing}")),
    ];
    let response = llm
        .chat(Role::Intake, &messages, &ChatOptions::default())
        .await?;
    let pick = extract_json::<RecruitPick>(&response.content).unwrap_or_default();

    // Validate phase-1 ids against the catalog; an empty pick falls back to
    // the first catalog entry (the default persona).
    let mut persona_ids: Vec<String> = pick
        .persona_ids
        .iter()
        .filter(|id| catalog.iter().any(|p| &p.id == *id))
        .cloned()
        .collect();
    if persona_ids.is_empty() {
        if let Some(first) = catalog.first() {
            warn!("recruiter picked no known persona — using default");
            persona_ids.push(first.id.clone());
        }
    }
    let model_role = pick.model_role.as_deref().and_then(Role::parse);

    // Phase 2: full bodies → custom prompt + tool subset.
    let bodies = catalog
        .iter()
        .filter(|p| persona_ids.contains(&p.id))
        .map(|p| format!("## {}\n{}", p.name, p.body))
        .collect::<Vec<_>>()
        .join("\n\n");
    let messages = vec![
        ChatMessage::system(
            "Write the working agent's setup as JSON: {\"system_prompt\": str, \
             \"tool_ids\": [str]}. The system prompt merges the persona voices into \
             one operator. Only request tool ids from the provided list.",
        ),
        ChatMessage::user(format!(
            "TASK:\n{restated_request}\n\nPERSONAS:\n{bodies}\n\nTOOLS:\n{}",
            manifest_tool_ids.join(", ")
        )),
    ];
    let response = llm
        .chat(Role::Workhorse, &messages, &ChatOptions::default())
        .await?;

    #[derive(Debug, Clone, Deserialize, Default)]
    #[serde(default)]
    struct Setup {
        system_prompt: String,
        tool_ids: Vec<String>,
    }
    let setup = extract_json::<Setup>(&response.content).unwrap_or_default();

    let system_prompt = if setup.system_prompt.trim().is_empty() {
        format!("You are a capable agent. Complete this task:\n{restated_request}")
    } else {
        setup.system_prompt
    };
    // Tool subset validated against the manifest; empty grants everything.
    let mut tool_ids: Vec<String> = setup
        .tool_ids
        .iter()
        .filter(|id| manifest_tool_ids.contains(id))
        .cloned()
        .collect();
    if tool_ids.is_empty() {
        tool_ids = manifest_tool_ids.to_vec();
    }

    Ok(Recruitment {
        persona_ids,
        council: pick.council,
        model_role,
        system_prompt,
        tool_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_persona_serde_round_trips() {
        let persona = AgentPersona {
            agent_id: "ag-1".to_string(),
            status: AgentStatus::Running,
            persona_ids: vec!["researcher".to_string()],
            council: vec![],
            model_role: Some(Role::Workhorse),
            system_prompt: "You research things.".to_string(),
            tool_ids: vec!["fs.read_file".to_string()],
            restated_requests: vec!["find the docs".to_string()],
            created_at: Utc::now(),
        };
        let raw = serde_json::to_string(&persona).unwrap();
        let back: AgentPersona = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.status, AgentStatus::Running);
        assert_eq!(back.model_role, Some(Role::Workhorse));
    }

    #[test]
    fn status_serializes_lowercase_for_workspace_scans() {
        assert_eq!(serde_json::to_string(&AgentStatus::Cancelled).unwrap(), "\"cancelled\"");
        assert_eq!(serde_json::to_string(&AgentStatus::Running).unwrap(), "\"running\"");
    }
}
