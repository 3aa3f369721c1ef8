//! Provider registry: env-configured adapters and model resolution

use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::models::{model_data, ModelData, ProviderId};
use crate::error::{ApiError, ErrorCode};
use crate::providers::anthropic::{AnthropicConfig, AnthropicProvider};
use crate::providers::azure::{AzureConfig, AzureOpenAIProvider};
use crate::providers::bedrock::{BedrockConfig, BedrockProvider};
use crate::providers::fireworks::{FireworksConfig, FireworksProvider};
use crate::providers::gemini::{GeminiConfig, GeminiProvider};
use crate::providers::groq::{GroqConfig, GroqProvider};
use crate::providers::mistral::{MistralConfig, MistralProvider};
use crate::providers::openai::{OpenAIConfig, OpenAIProvider};
use crate::providers::xai::{XaiConfig, XaiProvider};
use crate::providers::Provider;

/// Immutable after init; adapters are stateless and shared across requests
#[derive(Default)]
pub struct ProviderFactory {
    providers: HashMap<ProviderId, Arc<dyn Provider>>,
}

impl ProviderFactory {
    /// Register every adapter whose environment configuration is present
    pub fn from_env() -> Self {
        let mut factory = Self::default();
        if let Some(config) = OpenAIConfig::from_env() {
            factory.register(Arc::new(OpenAIProvider::new(config)));
        }
        if let Some(config) = AnthropicConfig::from_env() {
            factory.register(Arc::new(AnthropicProvider::new(config)));
        }
        if let Some(config) = BedrockConfig::from_env() {
            factory.register(Arc::new(BedrockProvider::new(config)));
        }
        if let Some(config) = GeminiConfig::from_env() {
            factory.register(Arc::new(GeminiProvider::new(config)));
        }
        if let Some(config) = GroqConfig::from_env() {
            factory.register(Arc::new(GroqProvider::new(config)));
        }
        if let Some(config) = XaiConfig::from_env() {
            factory.register(Arc::new(XaiProvider::new(config)));
        }
        if let Some(config) = MistralConfig::from_env() {
            factory.register(Arc::new(MistralProvider::new(config)));
        }
        if let Some(config) = FireworksConfig::from_env() {
            factory.register(Arc::new(FireworksProvider::new(config)));
        }
        if let Some(config) = AzureConfig::from_env() {
            factory.register(Arc::new(AzureOpenAIProvider::new(config)));
        }
        tracing::info!(
            providers = ?factory.providers.keys().collect::<Vec<_>>(),
            "provider factory initialized"
        );
        factory
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id(), provider);
    }

    pub fn get(&self, id: ProviderId) -> Option<Arc<dyn Provider>> {
        self.providers.get(&id).cloned()
    }

    pub fn available(&self) -> Vec<ProviderId> {
        self.providers.keys().copied().collect()
    }

    /// Resolve the provider for a model. A pinned provider must support the
    /// model; otherwise the catalog's preference order picks the first
    /// configured adapter.
    pub fn provider_for_model(
        &self,
        model: &str,
        pinned: Option<ProviderId>,
    ) -> Result<Arc<dyn Provider>, ApiError> {
        let data = model_data(model).ok_or_else(|| {
            ApiError::new(
                ErrorCode::NoProviderSupportingModel,
                format!("Unknown model '{model}'"),
            )
        })?;

        if let Some(pinned) = pinned {
            let provider = self.get(pinned).ok_or_else(|| {
                ApiError::new(
                    ErrorCode::ProviderDoesNotSupportModel,
                    format!("Provider '{pinned}' is not configured"),
                )
            })?;
            if !data.providers.contains(&pinned) {
                return Err(ApiError::new(
                    ErrorCode::ProviderDoesNotSupportModel,
                    format!("Provider '{pinned}' does not support '{model}'"),
                )
                .with_details(serde_json::json!({"model": model, "provider": pinned})));
            }
            return Ok(provider);
        }

        for candidate in &data.providers {
            if let Some(provider) = self.get(*candidate) {
                return Ok(provider);
            }
        }
        Err(ApiError::new(
            ErrorCode::NoProviderSupportingModel,
            format!("No configured providers support model '{model}'"),
        )
        .with_details(serde_json::json!({
            "model": model,
            "available_providers": self
                .available()
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>(),
        })))
    }

    /// Catalog data adjusted by the serving provider
    pub fn sanitized_model_data(&self, model: &str) -> Option<ModelData> {
        let mut data = model_data(model)?;
        if let Ok(provider) = self.provider_for_model(model, None) {
            provider.sanitize_model_data(&mut data);
        }
        Some(data)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::domain::File;
    use crate::domain::Message;
    use crate::error::ProviderError;
    use crate::providers::{ParsedResponse, ProviderOptions, ProviderResponse};
    use serde_json::json;

    /// Configurable stand-in used by runner and factory tests
    #[derive(Debug)]
    pub struct StaticProvider {
        pub provider_id: ProviderId,
    }

    impl Provider for StaticProvider {
        fn id(&self) -> ProviderId {
            self.provider_id
        }

        fn build_request(
            &self,
            _messages: &[Message],
            options: &ProviderOptions,
            stream: bool,
        ) -> Result<serde_json::Value, ProviderError> {
            Ok(json!({"model": options.model, "stream": stream}))
        }

        fn request_url(&self, _model: &str, _stream: bool) -> String {
            "http://localhost:0/unused".to_string()
        }

        fn request_headers(
            &self,
            _model: &str,
        ) -> Result<Vec<(String, String)>, ProviderError> {
            Ok(vec![])
        }

        fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse {
                text: String::from_utf8_lossy(body).to_string(),
                ..Default::default()
            })
        }

        fn parse_stream_delta(&self, _event: &str) -> Result<ParsedResponse, ProviderError> {
            Ok(ParsedResponse::default())
        }

        fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
            false
        }

        fn default_model(&self) -> &'static str {
            "gpt-4.1"
        }

        fn compute_prompt_token_count(
            &self,
            _messages: &[Message],
            _model: &str,
        ) -> Result<f64, ProviderError> {
            Ok(0.0)
        }

        fn map_error(&self, status: u16, body: &str) -> ProviderError {
            crate::providers::ErrorTable::new(&[]).classify(status, body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::StaticProvider;
    use super::*;

    fn factory_with(ids: &[ProviderId]) -> ProviderFactory {
        let mut factory = ProviderFactory::default();
        for id in ids {
            factory.register(Arc::new(StaticProvider { provider_id: *id }));
        }
        factory
    }

    #[test]
    fn test_preference_order_resolution() {
        // claude models prefer Anthropic but fall back to Bedrock when only
        // Bedrock is configured
        let factory = factory_with(&[ProviderId::Bedrock]);
        let provider = factory
            .provider_for_model("claude-sonnet-4-5", None)
            .unwrap();
        assert_eq!(provider.id(), ProviderId::Bedrock);
    }

    #[test]
    fn test_pinned_provider_must_support_model() {
        let factory = factory_with(&[ProviderId::Openai]);
        let err = factory
            .provider_for_model("claude-sonnet-4-5", Some(ProviderId::Openai))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderDoesNotSupportModel);
    }

    #[test]
    fn test_no_provider_supporting_model() {
        let factory = factory_with(&[ProviderId::Openai]);
        let err = factory.provider_for_model("grok-4", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoProviderSupportingModel);
    }

    #[test]
    fn test_unknown_model() {
        let factory = factory_with(&[ProviderId::Openai]);
        let err = factory.provider_for_model("not-a-model", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoProviderSupportingModel);
    }
}
