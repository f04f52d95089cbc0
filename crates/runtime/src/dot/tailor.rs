//! Pre-Dot context preparation, two passes.
//!
//! Pass 1 (tailor) resolves references against recent history and scores the
//! request; pass 2 (consolidator) folds the selected rules and principles
//! into one briefing. Both decode LLM JSON tolerantly and degrade to safe
//! defaults — a bad model response must never crash the request.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use dotbot_llm::{ChatMessage, ChatOptions, LlmError, ResilientClient, Role, extract_json};

/// Cap on manufactured history turns carried into the prompt.
const MANUFACTURED_HISTORY_CAP: usize = 4;
/// Skill feedback is a short friendly acknowledgment, hard-capped.
const SKILL_FEEDBACK_CAP: usize = 60;
/// Consolidated briefing budget, approximated in characters (~4 per token).
const BRIEFING_CHAR_BUDGET: usize = 6000;
/// Complexity at which skill feedback is worth producing.
const SKILL_FEEDBACK_MIN_COMPLEXITY: f32 = 4.0;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryRef {
    pub entity: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

/// Pass-1 output. Every field tolerates absence; unknown keys are dropped.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TailorOutput {
    /// "it/that/the project" resolved against recent history.
    pub restated_request: String,
    pub complexity: f32,
    pub context_confidence: f32,
    pub relevant_cache: Vec<String>,
    pub relevant_memories: Vec<MemoryRef>,
    pub manufactured_history: Vec<HistoryTurn>,
    /// Only populated when the message spans two or more memory models.
    pub topic_segments: Vec<String>,
    pub skill_search_query: Option<String>,
    pub skill_feedback: Option<String>,
}

impl TailorOutput {
    /// Clamp scores and caps after decoding. Applied to every output, model-
    /// produced or defaulted.
    fn normalized(mut self, original_prompt: &str) -> Self {
        if self.restated_request.trim().is_empty() {
            self.restated_request = original_prompt.to_string();
        }
        self.complexity = self.complexity.clamp(0.0, 10.0);
        self.context_confidence = self.context_confidence.clamp(0.0, 1.0);
        self.manufactured_history.truncate(MANUFACTURED_HISTORY_CAP);
        if self.topic_segments.len() < 2 {
            self.topic_segments.clear();
        }
        if self.complexity < SKILL_FEEDBACK_MIN_COMPLEXITY {
            self.skill_feedback = None;
        }
        if let Some(ref mut feedback) = self.skill_feedback {
            if feedback.len() > SKILL_FEEDBACK_CAP {
                let mut end = SKILL_FEEDBACK_CAP;
                while end > 0 && !feedback.is_char_boundary(end) {
                    end -= 1;
                }
                feedback.truncate(end);
            }
        }
        self
    }
}

/// Inputs the tailor looks at.
pub struct TailorContext<'a> {
    pub prompt: &'a str,
    pub recent_history: &'a [HistoryTurn],
    pub memory_spines: &'a [String],
    pub cache_filenames: &'a [String],
}

fn tailor_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "restated_request": {"type": "string"},
            "complexity": {"type": "number", "minimum": 0, "maximum": 10},
            "context_confidence": {"type": "number", "minimum": 0, "maximum": 1},
            "relevant_cache": {"type": "array", "items": {"type": "string"}},
            "relevant_memories": {"type": "array", "items": {
                "type": "object",
                "properties": {"entity": {"type": "string"}, "confidence": {"type": "number"}}
            }},
            "manufactured_history": {"type": "array", "items": {
                "type": "object",
                "properties": {"role": {"type": "string"}, "content": {"type": "string"}}
            }},
            "topic_segments": {"type": "array", "items": {"type": "string"}},
            "skill_search_query": {"type": "string"},
            "skill_feedback": {"type": "string"}
        },
        "required": ["restated_request", "complexity", "context_confidence"]
    })
}

/// Pass 1: a single schema-constrained call on the intake tier.
pub async fn run_tailor(
    client: &ResilientClient,
    ctx: &TailorContext<'_>,
) -> Result<TailorOutput, LlmError> {
    let history_block = if ctx.recent_history.is_empty() {
        "(none)".to_string()
    } else {
        ctx.recent_history
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let spines_block = if ctx.memory_spines.is_empty() {
        "(none)".to_string()
    } else {
        ctx.memory_spines.join("\n")
    };
    let cache_block = if ctx.cache_filenames.is_empty() {
        "(none)".to_string()
    } else {
        ctx.cache_filenames.join("\n")
    };

    let system = "You prepare context for an assistant. Resolve references like \
                  'it', 'that', 'the project' against the recent conversation, score the \
                  request's complexity (0-10) and your confidence in the resolved context \
                  (0-1), pick relevant cache files and memory entities, extract up to 4 \
                  on-topic history turns, and split into topic_segments only when the \
                  message genuinely spans two or more known entities. Reply with JSON only.";
    let user = format!(
        "RECENT CONVERSATION:\n{history_block}\n\nMEMORY SPINES:\n{spines_block}\n\n\
         RESEARCH CACHE FILES:\n{cache_block}\n\nUSER MESSAGE:\n{}",
        ctx.prompt
    );

    let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
    let options = ChatOptions {
        response_schema: Some(tailor_schema()),
        ..Default::default()
    };

    let response = match client.chat(Role::Intake, &messages, &options).await {
        Ok(response) => response,
        Err(LlmError::Parse(_)) => {
            // One retry in simple mode: no schema hints, cold temperature.
            let simple = ChatOptions {
                temperature: Some(0.1),
                simple_mode: true,
                ..Default::default()
            };
            client.chat(Role::Intake, &messages, &simple).await?
        }
        Err(err) => return Err(err),
    };

    let output = extract_json::<TailorOutput>(&response.content).unwrap_or_else(|| {
        warn!("tailor returned no parseable JSON — using pass-through defaults");
        TailorOutput {
            complexity: 3.0,
            ..Default::default()
        }
    });
    Ok(output.normalized(ctx.prompt))
}

// ── Consolidator (pass 2) ────────────────────────────────────────────────────

/// A named principle whose body may be folded into the briefing.
#[derive(Debug, Clone)]
pub struct Principle {
    pub name: String,
    pub body: String,
}

/// Pass 2: one unified briefing from always-on rules plus selected
/// principles, capped at ~1500 tokens. Falls back to verbatim concatenation
/// when the model call fails; no principles at all yields an empty block.
pub async fn run_consolidator(
    client: &ResilientClient,
    tailor: &TailorOutput,
    always_on: &[Principle],
    selected: &[Principle],
) -> String {
    if always_on.is_empty() && selected.is_empty() {
        return String::new();
    }

    let corpus = always_on
        .iter()
        .chain(selected.iter())
        .map(|p| format!("## {}\n{}", p.name, p.body))
        .collect::<Vec<_>>()
        .join("\n\n");

    let system = "Fold the following operating rules into one concise briefing the \
                  assistant reads before answering. Keep every obligation, drop \
                  duplication, stay under 1500 tokens. Output the briefing text only.";
    let user = format!(
        "REQUEST (restated): {}\n\nRULES AND PRINCIPLES:\n{corpus}",
        tailor.restated_request
    );
    let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];

    match client.chat(Role::Intake, &messages, &ChatOptions::default()).await {
        Ok(response) if !response.content.trim().is_empty() => {
            truncate_chars(response.content.trim(), BRIEFING_CHAR_BUDGET)
        }
        Ok(_) | Err(_) => {
            warn!("consolidator failed — concatenating principle bodies verbatim");
            truncate_chars(&corpus, BRIEFING_CHAR_BUDGET)
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
