//! Intake classification: one cheap LLM pass that resolves references and
//! restates the task in standalone form before recruiting begins.

use serde::Deserialize;
use tracing::warn;

use dotbot_llm::{ChatMessage, ChatOptions, LlmError, ResilientClient, Role, extract_json};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct IntakeReply {
    restated_request: String,
}

/// Restate the prompt with references resolved against memory spines. Falls
/// back to the raw prompt whenever the model is unhelpful.
pub async fn classify(
    llm: &ResilientClient,
    prompt: &str,
    memory_spines: &[String],
) -> Result<String, LlmError> {
    let spines_block = if memory_spines.is_empty() {
        "(none)".to_string()
    } else {
        memory_spines.join("\n")
    };
    let messages = vec![
        ChatMessage::system(
            "Restate the task so it stands alone: resolve 'it', 'that', 'the \
             project' and similar references using the memory context. Reply with \
             JSON: {\"restated_request\": str}.",
        ),
        ChatMessage::user(format!("MEMORY:\n{spines_block}\n\nTASK:\n{prompt}")),
    ];

    let response = llm
        .chat(Role::Intake, &messages, &ChatOptions::default())
        .await?;
    let reply = extract_json::<IntakeReply>(&response.content).unwrap_or_default();
    if reply.restated_request.trim().is_empty() {
        warn!("intake produced no restatement — using the raw prompt");
        return Ok(prompt.to_string());
    }
    Ok(reply.restated_request)
}
