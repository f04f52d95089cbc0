use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Why a model is being asked for, not how capable it is. Selection maps a
/// role to a concrete `(provider, model, temperature, max_tokens)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Workhorse,
    DeepContext,
    Architect,
    Local,
    GuiFast,
    Intake,
    Assistant,
    Image,
    Video,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Workhorse => "workhorse",
            Role::DeepContext => "deep_context",
            Role::Architect => "architect",
            Role::Local => "local",
            Role::GuiFast => "gui_fast",
            Role::Intake => "intake",
            Role::Assistant => "assistant",
            Role::Image => "image",
            Role::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "workhorse" => Some(Role::Workhorse),
            "deep_context" => Some(Role::DeepContext),
            "architect" => Some(Role::Architect),
            "local" => Some(Role::Local),
            "gui_fast" => Some(Role::GuiFast),
            "intake" => Some(Role::Intake),
            "assistant" => Some(Role::Assistant),
            "image" => Some(Role::Image),
            "video" => Some(Role::Video),
            _ => None,
        }
    }
}

/// LLM vendor, plus the on-device loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Deepseek,
    Anthropic,
    Openai,
    Gemini,
    Xai,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Deepseek => "deepseek",
            Provider::Anthropic => "anthropic",
            Provider::Openai => "openai",
            Provider::Gemini => "gemini",
            Provider::Xai => "xai",
            Provider::Local => "local",
        }
    }

    /// Environment variable holding this provider's API key. `Local` needs none.
    pub fn key_var(&self) -> Option<&'static str> {
        match self {
            Provider::Deepseek => Some("DEEPSEEK_API_KEY"),
            Provider::Anthropic => Some("ANTHROPIC_API_KEY"),
            Provider::Openai => Some("OPENAI_API_KEY"),
            Provider::Gemini => Some("GEMINI_API_KEY"),
            Provider::Xai => Some("XAI_API_KEY"),
            Provider::Local => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Deepseek => "deepseek-chat",
            Provider::Anthropic => "claude-sonnet-4-5",
            Provider::Openai => "gpt-4.1",
            Provider::Gemini => "gemini-2.5-pro",
            Provider::Xai => "grok-4",
            Provider::Local => "qwen2.5-7b-instruct",
        }
    }

    pub const ALL: [Provider; 6] = [
        Provider::Deepseek,
        Provider::Anthropic,
        Provider::Openai,
        Provider::Gemini,
        Provider::Xai,
        Provider::Local,
    ];
}

/// Context window in tokens for a `(provider, model)` pair. Unknown models
/// fall back to a conservative default.
pub fn context_window(provider: Provider, model: &str) -> u32 {
    match (provider, model) {
        (Provider::Deepseek, "deepseek-chat") => 128_000,
        (Provider::Deepseek, "deepseek-reasoner") => 128_000,
        (Provider::Anthropic, "claude-sonnet-4-5") => 200_000,
        (Provider::Anthropic, "claude-haiku-4-5") => 200_000,
        (Provider::Openai, "gpt-4.1") => 1_000_000,
        (Provider::Openai, "gpt-4.1-mini") => 1_000_000,
        (Provider::Gemini, "gemini-2.5-pro") => 1_000_000,
        (Provider::Gemini, "gemini-2.5-flash") => 1_000_000,
        (Provider::Xai, "grok-4") => 256_000,
        (Provider::Local, _) => 32_000,
        _ => 64_000,
    }
}

/// One concrete candidate in a role's fallback chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelChoice {
    pub provider: Provider,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelChoice {
    fn new(provider: Provider, model: &str, temperature: f32, max_tokens: u32) -> Self {
        Self {
            provider,
            model: model.to_string(),
            temperature,
            max_tokens,
        }
    }
}

/// Ordered fallback chains, one per role. First entry with a present API key
/// wins at selection time; later entries serve the runtime fallback walk.
pub fn fallback_chain(role: Role) -> Vec<ModelChoice> {
    use Provider::*;
    match role {
        Role::Workhorse => vec![
            ModelChoice::new(Deepseek, "deepseek-chat", 0.7, 8192),
            ModelChoice::new(Gemini, "gemini-2.5-flash", 0.7, 8192),
            ModelChoice::new(Openai, "gpt-4.1-mini", 0.7, 8192),
            ModelChoice::new(Anthropic, "claude-sonnet-4-5", 0.7, 8192),
            ModelChoice::new(Local, "qwen2.5-7b-instruct", 0.7, 4096),
        ],
        Role::DeepContext => vec![
            ModelChoice::new(Gemini, "gemini-2.5-pro", 0.4, 16384),
            ModelChoice::new(Openai, "gpt-4.1", 0.4, 16384),
            ModelChoice::new(Anthropic, "claude-sonnet-4-5", 0.4, 16384),
        ],
        Role::Architect => vec![
            ModelChoice::new(Anthropic, "claude-sonnet-4-5", 0.3, 16384),
            ModelChoice::new(Openai, "gpt-4.1", 0.3, 16384),
            ModelChoice::new(Deepseek, "deepseek-reasoner", 0.3, 16384),
        ],
        Role::Local => vec![ModelChoice::new(Local, "qwen2.5-7b-instruct", 0.7, 4096)],
        Role::GuiFast => vec![
            ModelChoice::new(Xai, "grok-4", 0.5, 4096),
            ModelChoice::new(Gemini, "gemini-2.5-flash", 0.5, 4096),
            ModelChoice::new(Deepseek, "deepseek-chat", 0.5, 4096),
        ],
        Role::Intake => vec![
            ModelChoice::new(Deepseek, "deepseek-chat", 0.2, 4096),
            ModelChoice::new(Gemini, "gemini-2.5-flash", 0.2, 4096),
            ModelChoice::new(Local, "qwen2.5-7b-instruct", 0.2, 2048),
        ],
        Role::Assistant => vec![
            ModelChoice::new(Deepseek, "deepseek-chat", 0.6, 8192),
            ModelChoice::new(Anthropic, "claude-haiku-4-5", 0.6, 8192),
            ModelChoice::new(Gemini, "gemini-2.5-flash", 0.6, 8192),
            ModelChoice::new(Local, "qwen2.5-7b-instruct", 0.6, 4096),
        ],
        Role::Image => vec![
            ModelChoice::new(Gemini, "gemini-2.5-flash-image", 0.7, 4096),
            ModelChoice::new(Openai, "gpt-image-1", 0.7, 4096),
        ],
        Role::Video => vec![ModelChoice::new(Gemini, "veo-3", 0.7, 4096)],
    }
}

/// The set of API keys visible to selection, captured once so that
/// `select_model` stays a pure function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: HashMap<Provider, String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        let mut keys = HashMap::new();
        for provider in Provider::ALL {
            if let Some(var) = provider.key_var() {
                if let Ok(value) = std::env::var(var) {
                    if !value.trim().is_empty() {
                        keys.insert(provider, value);
                    }
                }
            }
        }
        Self { keys }
    }

    pub fn with_key(mut self, provider: Provider, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }

    /// Whether a provider is usable. `Local` needs no key.
    pub fn has(&self, provider: Provider) -> bool {
        provider == Provider::Local || self.keys.contains_key(&provider)
    }

    pub fn get(&self, provider: Provider) -> Option<&str> {
        self.keys.get(&provider).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_role_has_a_chain() {
        for role in [
            Role::Workhorse,
            Role::DeepContext,
            Role::Architect,
            Role::Local,
            Role::GuiFast,
            Role::Intake,
            Role::Assistant,
            Role::Image,
            Role::Video,
        ] {
            assert!(!fallback_chain(role).is_empty(), "{role:?} chain empty");
        }
    }

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::Workhorse, Role::DeepContext, Role::GuiFast] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("mystery"), None);
    }

    #[test]
    fn local_provider_needs_no_key() {
        let keys = ApiKeys::default();
        assert!(keys.has(Provider::Local));
        assert!(!keys.has(Provider::Deepseek));
    }

    #[test]
    fn context_window_has_conservative_default() {
        assert_eq!(context_window(Provider::Openai, "gpt-99"), 64_000);
        assert_eq!(context_window(Provider::Gemini, "gemini-2.5-pro"), 1_000_000);
    }
}
