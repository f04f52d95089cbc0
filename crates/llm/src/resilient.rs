use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::ChatOptions;
use crate::error::LlmError;
use crate::registry::ProviderRegistry;
use crate::role::{ModelChoice, Role, fallback_chain};
use crate::select::{Selection, SelectionCriteria, select_model};
use crate::types::{ChatMessage, ChatResponse};

/// Longest Retry-After the wrapper will actually sleep for.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// Role-indexed chat entry point with runtime fallback.
///
/// A call first tries the selected entry of the role's chain. On a retryable
/// failure it honours a short `Retry-After`, then walks the remaining keyed
/// entries of the same chain, excluding the provider that just failed. The
/// first success wins; on chain exhaustion the *original* error is returned.
/// 401/403 anywhere is fatal to the whole request.
pub struct ResilientClient {
    registry: Arc<ProviderRegistry>,
}

impl ResilientClient {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Selection-time pick for the given criteria, pure in `(criteria, keys)`.
    pub fn select(&self, criteria: &SelectionCriteria) -> Option<Selection> {
        select_model(criteria, self.registry.keys())
    }

    pub async fn chat(
        &self,
        role: Role,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, LlmError> {
        self.run(role, messages, options, None).await
    }

    pub async fn stream(
        &self,
        role: Role,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatResponse, LlmError> {
        self.run(role, messages, options, Some(tx)).await
    }

    async fn run(
        &self,
        role: Role,
        messages: &[ChatMessage],
        options: &ChatOptions,
        tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatResponse, LlmError> {
        let chain: Vec<ModelChoice> = fallback_chain(role)
            .into_iter()
            .filter(|c| self.registry.keys().has(c.provider))
            .collect();
        if chain.is_empty() {
            return Err(LlmError::Unauthorized {
                provider: role.as_str().to_string(),
                message: "no provider in this role's chain has an API key".to_string(),
            });
        }

        let mut original_error: Option<LlmError> = None;
        let mut failed_provider = None;

        for (attempt, choice) in chain.iter().enumerate() {
            if Some(choice.provider) == failed_provider {
                continue;
            }
            let is_primary = attempt == 0;
            let attempt_options = effective_options(options, choice, is_primary);

            let client = match self.registry.client(choice.provider).await {
                Ok(client) => client,
                Err(err) => {
                    // Construction failure (missing local loader, rotated-away
                    // key): note it and keep walking.
                    warn!(provider = choice.provider.as_str(), %err, "client unavailable");
                    original_error.get_or_insert(err);
                    continue;
                }
            };

            let result = match tx {
                Some(ref tx) => client.stream(messages, &attempt_options, tx.clone()).await,
                None => client.chat(messages, &attempt_options).await,
            };

            match result {
                Ok(response) => {
                    if !is_primary {
                        info!(
                            role = role.as_str(),
                            provider = choice.provider.as_str(),
                            "fallback succeeded"
                        );
                    }
                    return Ok(response);
                }
                Err(LlmError::Cancelled) => return Err(LlmError::Cancelled),
                Err(err @ LlmError::Unauthorized { .. }) => return Err(err),
                Err(err) if err.is_retryable() => {
                    warn!(
                        role = role.as_str(),
                        provider = choice.provider.as_str(),
                        %err,
                        "retryable failure; walking fallback chain"
                    );
                    if is_primary {
                        let wait = err.retry_after().unwrap_or(0);
                        if wait > 0 && wait <= MAX_RETRY_AFTER_SECS {
                            tokio::time::sleep(Duration::from_secs(wait)).await;
                        }
                    }
                    failed_provider = Some(choice.provider);
                    original_error.get_or_insert(err);
                }
                Err(err) => {
                    // Not retryable and not auth: fail fast with this error.
                    return Err(err);
                }
            }
        }

        Err(original_error.unwrap_or_else(|| LlmError::Unknown("empty fallback chain".to_string())))
    }
}

/// Merge a chain entry into the caller's options. The primary attempt keeps a
/// caller-supplied model override; fallback attempts always use the chain
/// entry's model (the override names another provider's model). Explicit
/// temperature/max_tokens overrides survive every attempt.
fn effective_options(base: &ChatOptions, choice: &ModelChoice, is_primary: bool) -> ChatOptions {
    let mut options = base.clone();
    if !is_primary || options.model.is_none() {
        options.model = Some(choice.model.clone());
    }
    if options.temperature.is_none() {
        options.temperature = Some(choice.temperature);
    }
    if options.max_tokens.is_none() {
        options.max_tokens = Some(choice.max_tokens);
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LlmClient;
    use crate::role::{ApiKeys, Provider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted fake: fails with a fixed error until it has been called
    /// `fail_times` times, then succeeds.
    struct ScriptedClient {
        provider: Provider,
        error: Option<LlmError>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedClient {
        fn failing(provider: Provider, error: LlmError) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self { provider, error: Some(error), calls: calls.clone() },
                calls,
            )
        }

        fn ok(provider: Provider) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (Self { provider, error: None, calls: calls.clone() }, calls)
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            options: &ChatOptions,
        ) -> Result<ChatResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(err) => Err(err.clone()),
                None => Ok(ChatResponse {
                    provider: self.provider,
                    model: options.model.clone().unwrap_or_default(),
                    content: format!("ok from {}", self.provider.as_str()),
                    tool_calls: vec![],
                    finish_reason: "stop".to_string(),
                    reasoning_content: None,
                    usage: None,
                }),
            }
        }

        async fn stream(
            &self,
            messages: &[ChatMessage],
            options: &ChatOptions,
            tx: mpsc::Sender<String>,
        ) -> Result<ChatResponse, LlmError> {
            let response = self.chat(messages, options).await?;
            let _ = tx.send(response.content.clone()).await;
            Ok(response)
        }
    }

    fn rate_limited() -> LlmError {
        LlmError::RateLimited {
            provider: "deepseek".to_string(),
            message: "429 Too Many Requests".to_string(),
            retry_after: None,
        }
    }

    async fn registry_with(
        clients: Vec<(Provider, Arc<dyn LlmClient>)>,
    ) -> Arc<ProviderRegistry> {
        let mut keys = ApiKeys::default();
        for (provider, _) in &clients {
            if provider.key_var().is_some() {
                keys = keys.with_key(*provider, "test-key");
            }
        }
        let registry = Arc::new(ProviderRegistry::new(keys));
        for (provider, client) in clients {
            registry.insert(provider, client).await;
        }
        registry
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back_to_next_keyed_provider() {
        // Workhorse chain: deepseek, gemini, openai, anthropic, local.
        let (deepseek, deepseek_calls) = ScriptedClient::failing(Provider::Deepseek, rate_limited());
        let (gemini, gemini_calls) = ScriptedClient::ok(Provider::Gemini);
        let registry = registry_with(vec![
            (Provider::Deepseek, Arc::new(deepseek) as Arc<dyn LlmClient>),
            (Provider::Gemini, Arc::new(gemini) as Arc<dyn LlmClient>),
        ])
        .await;

        let client = ResilientClient::new(registry);
        let response = client
            .chat(Role::Workhorse, &[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(response.provider, Provider::Gemini);
        assert_eq!(deepseek_calls.load(Ordering::SeqCst), 1);
        assert_eq!(gemini_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_rethrows_the_original_error() {
        let (deepseek, _) = ScriptedClient::failing(Provider::Deepseek, rate_limited());
        let (gemini, _) = ScriptedClient::failing(
            Provider::Gemini,
            LlmError::Transient {
                provider: "gemini".to_string(),
                message: "502".to_string(),
            },
        );
        let registry = registry_with(vec![
            (Provider::Deepseek, Arc::new(deepseek) as Arc<dyn LlmClient>),
            (Provider::Gemini, Arc::new(gemini) as Arc<dyn LlmClient>),
        ])
        .await;

        let client = ResilientClient::new(registry);
        let err = client
            .chat(Role::Workhorse, &[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();

        // Original (deepseek) error, not the later gemini one.
        assert!(matches!(err, LlmError::RateLimited { provider, .. } if provider == "deepseek"));
    }

    #[tokio::test]
    async fn unauthorized_is_fatal_without_fallback() {
        let (deepseek, _) = ScriptedClient::failing(
            Provider::Deepseek,
            LlmError::Unauthorized {
                provider: "deepseek".to_string(),
                message: "401".to_string(),
            },
        );
        let (gemini, gemini_calls) = ScriptedClient::ok(Provider::Gemini);
        let registry = registry_with(vec![
            (Provider::Deepseek, Arc::new(deepseek) as Arc<dyn LlmClient>),
            (Provider::Gemini, Arc::new(gemini) as Arc<dyn LlmClient>),
        ])
        .await;

        let client = ResilientClient::new(registry);
        let err = client
            .chat(Role::Workhorse, &[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Unauthorized { .. }));
        assert_eq!(gemini_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fallback_uses_chain_entry_model_but_keeps_caller_temperature() {
        let (deepseek, _) = ScriptedClient::failing(Provider::Deepseek, rate_limited());
        let (gemini, _) = ScriptedClient::ok(Provider::Gemini);
        let registry = registry_with(vec![
            (Provider::Deepseek, Arc::new(deepseek) as Arc<dyn LlmClient>),
            (Provider::Gemini, Arc::new(gemini) as Arc<dyn LlmClient>),
        ])
        .await;

        let client = ResilientClient::new(registry);
        let options = ChatOptions {
            model: Some("deepseek-reasoner".to_string()),
            temperature: Some(0.11),
            ..Default::default()
        };
        let response = client
            .chat(Role::Workhorse, &[ChatMessage::user("hi")], &options)
            .await
            .unwrap();

        // The fallback ran with gemini's chain model, not the caller's
        // deepseek-specific override.
        assert_eq!(response.model, "gemini-2.5-flash");
    }

    #[tokio::test]
    async fn stream_replays_on_fallback() {
        let (deepseek, _) = ScriptedClient::failing(Provider::Deepseek, rate_limited());
        let (gemini, _) = ScriptedClient::ok(Provider::Gemini);
        let registry = registry_with(vec![
            (Provider::Deepseek, Arc::new(deepseek) as Arc<dyn LlmClient>),
            (Provider::Gemini, Arc::new(gemini) as Arc<dyn LlmClient>),
        ])
        .await;

        let client = ResilientClient::new(registry);
        let (tx, mut rx) = mpsc::channel(8);
        let response = client
            .stream(Role::Workhorse, &[ChatMessage::user("hi")], &ChatOptions::default(), tx)
            .await
            .unwrap();
        assert_eq!(response.provider, Provider::Gemini);
        assert_eq!(rx.recv().await.unwrap(), "ok from gemini");
    }

    #[tokio::test]
    async fn no_keyed_provider_errors_up_front() {
        let registry = Arc::new(ProviderRegistry::new(ApiKeys::default()));
        let client = ResilientClient::new(registry);
        let err = client
            .chat(Role::Architect, &[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Unauthorized { .. }));
    }
}
