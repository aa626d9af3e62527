pub mod anthropic;
pub mod retry;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use anthropic::AnthropicProvider;
pub use retry::RetryingProvider;
pub use types::*;

/// The language-model capability: given a prompt and callable tool
/// signatures, return either a reply or tool-call requests.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse>;
    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: LlmProvider + ?Sized> LlmProvider for Arc<T> {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        (**self).chat(request).await
    }

    async fn health(&self) -> Result<()> {
        (**self).health().await
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    #[default]
    Anthropic,
    /// Offline echo provider.
    Stub,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: ProviderType,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub timeout_secs: u64,
    /// Retries for retryable failures. Zero disables the retry wrapper.
    pub retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Anthropic,
            model: "claude-sonnet-4-5".into(),
            api_key: None,
            base_url: None,
            max_tokens: types::default_max_tokens(),
            timeout_secs: 30,
            retries: 2,
        }
    }
}

impl ProviderConfig {
    pub fn stub() -> Self {
        Self {
            provider_type: ProviderType::Stub,
            model: "stub".into(),
            retries: 0,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Build the configured provider, wrapped in [`RetryingProvider`] when
/// `retries > 0`.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    let provider: Arc<dyn LlmProvider> = match config.provider_type {
        ProviderType::Anthropic => {
            let key = config
                .api_key
                .as_ref()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| anyhow!("anthropic requires api_key"))?;
            let base_url = config
                .base_url
                .as_deref()
                .unwrap_or("https://api.anthropic.com");
            let inner = AnthropicProvider::with_timeout(key.clone(), base_url, config.timeout());
            if config.retries > 0 {
                Arc::new(RetryingProvider::new(inner, config.retries))
            } else {
                Arc::new(inner)
            }
        }
        ProviderType::Stub => Arc::new(StubProvider),
    };
    tracing::info!(
        provider = ?config.provider_type,
        model = %config.model,
        retries = config.retries,
        "provider configured"
    );
    Ok(provider)
}

pub struct StubProvider;

#[async_trait]
impl LlmProvider for StubProvider {
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse> {
        let user_text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.text())
            .unwrap_or_default();
        Ok(LlmResponse::text_only(format!(
            "[stub:{}] {}",
            request.model, user_text
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_provider_echoes_last_user_text() {
        let provider = StubProvider;
        let req = LlmRequest {
            model: "my-model".into(),
            system: None,
            messages: vec![LlmMessage::user("first"), LlmMessage::assistant("ok"), LlmMessage::user("ping")],
            max_tokens: 100,
            tools: vec![],
        };
        let resp = provider.chat(req).await.unwrap();
        assert_eq!(resp.text, "[stub:my-model] ping");
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn stub_provider_chat_empty_messages() {
        let req = LlmRequest {
            model: "m".into(),
            system: None,
            messages: vec![],
            max_tokens: 100,
            tools: vec![],
        };
        let resp = StubProvider.chat(req).await.unwrap();
        assert!(resp.text.starts_with("[stub:m]"));
    }

    #[test]
    fn anthropic_without_key_is_rejected() {
        let config = ProviderConfig::default();
        let err = create_provider(&config).err().unwrap();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn provider_config_parses_from_yaml_like_json() {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "type": "stub",
            "model": "local"
        }))
        .unwrap();
        assert_eq!(config.provider_type, ProviderType::Stub);
        assert_eq!(config.timeout_secs, 30);
        assert!(create_provider(&config).is_ok());
    }

    #[tokio::test]
    async fn arc_provider_delegates() {
        let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
        let resp = provider
            .chat(LlmRequest::simple("m".into(), None, "hey".into()))
            .await
            .unwrap();
        assert!(resp.text.contains("hey"));
        assert!(provider.health().await.is_ok());
    }
}
