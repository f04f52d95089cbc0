use serde::{Deserialize, Serialize};
use serde_json::json;

// ── Chat message types for structured tool calling ───────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation.
///
/// Invariants enforced by [`validate_transcript`]: only assistant messages
/// carry `tool_calls`, only tool messages carry `tool_call_id`, and every
/// tool message answers a call id from the assistant message directly before
/// it in the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    /// Tool calls requested by the assistant (only present on assistant messages).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// When role == Tool, identifies which tool call this result is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Inline image attachments (base64 or URL), passed through to providers
    /// that accept them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Chain-of-thought text some providers return alongside content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::text(ChatRole::System, content)
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self::text(ChatRole::User, content)
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(ChatRole::Assistant, content)
    }
    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: None,
            tool_calls,
            tool_call_id: None,
            images: vec![],
            reasoning_content: None,
        }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
            images: vec![],
            reasoning_content: None,
        }
    }

    fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
            images: vec![],
            reasoning_content: None,
        }
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this call (used to correlate tool results). Providers
    /// that omit one get a generated `call_<n>`.
    #[serde(default)]
    pub id: String,
    /// Always "function" for OpenAI-compatible APIs.
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

/// The function name and arguments within a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments normalized to a parsed JSON value. Providers that send a
    /// string get it parsed on the way in.
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A tool the model may invoke, described by a JSON-schema parameter object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Render as one entry of the OpenAI-compatible `tools` array.
    pub fn to_openai(&self) -> serde_json::Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Render a slice of definitions as the full `tools` parameter.
pub fn definitions_to_openai_tools(defs: &[ToolDefinition]) -> serde_json::Value {
    serde_json::Value::Array(defs.iter().map(ToolDefinition::to_openai).collect())
}

/// Token usage as reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Response from a structured chat call.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The provider that actually handled the request (may differ from the
    /// selection after a runtime fallback).
    pub provider: crate::Provider,
    pub model: String,
    /// Text content of the assistant's response (may be empty if tool_calls present).
    pub content: String,
    /// Tool calls the assistant wants to make (empty if a normal text response).
    pub tool_calls: Vec<ToolCall>,
    /// Finish reason: "stop", "tool_calls", "length", etc.
    pub finish_reason: String,
    pub reasoning_content: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// The assistant message this response represents, ready to append to a
    /// transcript.
    pub fn to_message(&self) -> ChatMessage {
        if self.tool_calls.is_empty() {
            ChatMessage::assistant(self.content.clone())
        } else {
            let mut msg = ChatMessage::assistant_tool_calls(self.tool_calls.clone());
            if !self.content.is_empty() {
                msg.content = Some(self.content.clone());
            }
            msg
        }
    }
}

/// Validate the structural invariants of a transcript.
///
/// Returns the first violation as a human-readable string, or `None` when the
/// transcript is well-formed.
pub fn validate_transcript(messages: &[ChatMessage]) -> Option<String> {
    for (i, msg) in messages.iter().enumerate() {
        if !msg.tool_calls.is_empty() && msg.role != ChatRole::Assistant {
            return Some(format!("message {i}: tool_calls on non-assistant message"));
        }
        if msg.tool_call_id.is_some() && msg.role != ChatRole::Tool {
            return Some(format!("message {i}: tool_call_id on non-tool message"));
        }
        if msg.role == ChatRole::Tool {
            let Some(ref call_id) = msg.tool_call_id else {
                return Some(format!("message {i}: tool message without tool_call_id"));
            };
            // Walk backwards over the run of tool messages to the assistant
            // message that requested this call.
            let assistant = messages[..i]
                .iter()
                .rev()
                .find(|m| m.role != ChatRole::Tool);
            let matched = assistant
                .map(|m| {
                    m.role == ChatRole::Assistant
                        && m.tool_calls.iter().any(|c| &c.id == call_id)
                })
                .unwrap_or(false);
            if !matched {
                return Some(format!(
                    "message {i}: tool result '{call_id}' does not answer the preceding assistant message"
                ));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            r#type: "function".to_string(),
            function: ToolCallFunction {
                name: "read_file".to_string(),
                arguments: json!({"path": "a.txt"}),
            },
        }
    }

    #[test]
    fn well_formed_transcript_validates() {
        let messages = vec![
            ChatMessage::system("you are Dot"),
            ChatMessage::user("read a.txt"),
            ChatMessage::assistant_tool_calls(vec![call("c1"), call("c2")]),
            ChatMessage::tool_result("c1", "contents"),
            ChatMessage::tool_result("c2", "contents"),
            ChatMessage::assistant("done"),
        ];
        assert!(validate_transcript(&messages).is_none());
    }

    #[test]
    fn tool_calls_on_user_message_rejected() {
        let mut msg = ChatMessage::user("hi");
        msg.tool_calls = vec![call("c1")];
        assert!(validate_transcript(&[msg]).is_some());
    }

    #[test]
    fn orphan_tool_result_rejected() {
        let messages = vec![
            ChatMessage::user("hi"),
            ChatMessage::tool_result("c9", "output"),
        ];
        let err = validate_transcript(&messages).unwrap();
        assert!(err.contains("c9"));
    }

    #[test]
    fn tool_result_must_follow_its_assistant_message() {
        let messages = vec![
            ChatMessage::assistant_tool_calls(vec![call("c1")]),
            ChatMessage::tool_result("c1", "ok"),
            ChatMessage::assistant("and then"),
            ChatMessage::tool_result("c1", "stale repeat"),
        ];
        assert!(validate_transcript(&messages).is_some());
    }

    #[test]
    fn definitions_render_as_openai_tools() {
        let defs = vec![ToolDefinition {
            name: "web_search".to_string(),
            description: "Search the web".to_string(),
            parameters: json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        }];
        let tools = definitions_to_openai_tools(&defs);
        assert_eq!(tools[0]["function"]["name"], "web_search");
        assert_eq!(tools[0]["type"], "function");
    }
}
