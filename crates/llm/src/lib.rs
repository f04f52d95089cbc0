//! Provider registry and resilient chat client.
//!
//! Roles (the *why* of a request) map to ordered fallback chains of concrete
//! `(provider, model, temperature, max_tokens)` candidates. Selection is a
//! pure function of the criteria and the registered API keys; the resilient
//! wrapper adds runtime fallback across the same chain on retryable failure.

mod client;
mod error;
mod extract;
mod registry;
mod resilient;
mod role;
mod select;
mod types;

pub use client::{AnthropicClient, ChatOptions, LlmClient, LocalClient, LocalModel, OpenAiCompatClient};
pub use error::{LlmError, classify};
pub use extract::extract_json;
pub use registry::ProviderRegistry;
pub use resilient::ResilientClient;
pub use role::{ApiKeys, ModelChoice, Provider, Role, context_window, fallback_chain};
pub use select::{Selection, SelectionCriteria, select_model};
pub use types::{
    ChatMessage, ChatResponse, ChatRole, TokenUsage, ToolCall, ToolCallFunction, ToolDefinition,
    definitions_to_openai_tools, validate_transcript,
};
