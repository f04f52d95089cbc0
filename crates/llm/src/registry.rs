use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::{AnthropicClient, LlmClient, LocalClient, LocalModel, OpenAiCompatClient};
use crate::error::LlmError;
use crate::role::{ApiKeys, Provider};

/// Clients keyed by the `Provider` enum, built lazily on first use and
/// reused for the process lifetime. The handle is injected at startup; there
/// is no module-level singleton.
pub struct ProviderRegistry {
    keys: ApiKeys,
    local: Option<Arc<dyn LocalModel>>,
    clients: Mutex<HashMap<Provider, Arc<dyn LlmClient>>>,
}

impl ProviderRegistry {
    pub fn new(keys: ApiKeys) -> Self {
        Self {
            keys,
            local: None,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the on-device loader. Without one the `local` provider is
    /// unavailable at runtime even though selection treats it as keyless.
    pub fn with_local_model(mut self, model: Arc<dyn LocalModel>) -> Self {
        self.local = Some(model);
        self
    }

    pub fn keys(&self) -> &ApiKeys {
        &self.keys
    }

    /// Get (or lazily build) the client for a provider.
    pub async fn client(&self, provider: Provider) -> Result<Arc<dyn LlmClient>, LlmError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&provider) {
            return Ok(client.clone());
        }

        let client: Arc<dyn LlmClient> = match provider {
            Provider::Local => {
                let model = self.local.clone().ok_or_else(|| LlmError::Unknown(
                    "local provider requested but no local model is attached".to_string(),
                ))?;
                Arc::new(LocalClient::new(model))
            }
            Provider::Anthropic => {
                let key = self.require_key(provider)?;
                Arc::new(AnthropicClient::new(key))
            }
            other => {
                let key = self.require_key(other)?;
                Arc::new(OpenAiCompatClient::new(other, key))
            }
        };

        clients.insert(provider, client.clone());
        Ok(client)
    }

    /// Replace the client for a provider with a caller-supplied one. Lets the
    /// host route a provider through a proxy, and tests substitute fakes.
    pub async fn insert(&self, provider: Provider, client: Arc<dyn LlmClient>) {
        self.clients.lock().await.insert(provider, client);
    }

    /// Drop all constructed clients (connection pools included). Used at
    /// shutdown and after key rotation.
    pub async fn shutdown(&self) {
        self.clients.lock().await.clear();
    }

    fn require_key(&self, provider: Provider) -> Result<String, LlmError> {
        self.keys
            .get(provider)
            .map(str::to_string)
            .ok_or_else(|| LlmError::Unauthorized {
                provider: provider.as_str().to_string(),
                message: format!(
                    "no API key configured ({})",
                    provider.key_var().unwrap_or("-")
                ),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let registry = ProviderRegistry::new(ApiKeys::default());
        match registry.client(Provider::Deepseek).await {
            Err(err) => assert!(matches!(err, LlmError::Unauthorized { .. })),
            Ok(_) => panic!("expected unauthorized error"),
        }
    }

    #[tokio::test]
    async fn local_without_loader_is_unavailable() {
        let registry = ProviderRegistry::new(ApiKeys::default());
        assert!(registry.client(Provider::Local).await.is_err());
    }

    #[tokio::test]
    async fn clients_are_reused() {
        let keys = ApiKeys::default().with_key(Provider::Openai, "k");
        let registry = ProviderRegistry::new(keys);
        let a = registry.client(Provider::Openai).await.unwrap();
        let b = registry.client(Provider::Openai).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
