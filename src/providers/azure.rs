//! Azure OpenAI adapter
//!
//! Same wire format as OpenAI; URLs address a deployment per model and the
//! key travels in an `api-key` header.

use serde_json::Value;

use crate::domain::models::ProviderId;
use crate::domain::{File, Message};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::openai::{OpenAIConfig, OpenAIProvider};
use crate::providers::{ParsedResponse, Provider, ProviderOptions, ProviderResponse};

const DEFAULT_API_VERSION: &str = "2024-10-21";

#[derive(Clone, Debug)]
pub struct AzureConfig {
    pub api_key: String,
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`
    pub endpoint: String,
    pub api_version: String,
}

impl AzureConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("AZURE_OPENAI_API_KEY").ok()?,
            endpoint: std::env::var("AZURE_OPENAI_ENDPOINT").ok()?,
            api_version: std::env::var("AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|_| DEFAULT_API_VERSION.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct AzureOpenAIProvider {
    config: AzureConfig,
    /// Request building and parsing are inherited from the OpenAI adapter
    inner: OpenAIProvider,
}

impl AzureOpenAIProvider {
    pub fn new(config: AzureConfig) -> Self {
        let inner = OpenAIProvider::new(OpenAIConfig {
            api_key: config.api_key.clone(),
            url: config.endpoint.clone(),
        });
        Self { config, inner }
    }

    /// Deployments are conventionally named after the model id
    fn deployment(model: &str) -> String {
        model.replace('.', "")
    }
}

impl Provider for AzureOpenAIProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Azure
    }

    fn build_request(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
        stream: bool,
    ) -> Result<Value, ProviderError> {
        self.inner.build_request(messages, options, stream)
    }

    fn request_url(&self, model: &str, _stream: bool) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.config.endpoint.trim_end_matches('/'),
            Self::deployment(model),
            self.config.api_version
        )
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "Azure OpenAI API key is not configured",
            ));
        }
        Ok(vec![("api-key".to_string(), self.config.api_key.clone())])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        self.inner.parse_response(body)
    }

    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError> {
        self.inner.parse_stream_delta(event)
    }

    fn requires_downloading_file(&self, file: &File, model: &str) -> bool {
        self.inner.requires_downloading_file(file, model)
    }

    fn default_model(&self) -> &'static str {
        "gpt-4.1"
    }

    fn max_number_of_file_urls(&self) -> Option<usize> {
        self.inner.max_number_of_file_urls()
    }

    fn compute_prompt_token_count(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<f64, ProviderError> {
        self.inner.compute_prompt_token_count(messages, model)
    }

    fn map_error(&self, status: u16, body: &str) -> ProviderError {
        self.inner.map_error(status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AzureOpenAIProvider {
        AzureOpenAIProvider::new(AzureConfig {
            api_key: "az-test".to_string(),
            endpoint: "https://my-resource.openai.azure.com".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
        })
    }

    #[test]
    fn test_deployment_url() {
        let url = provider().request_url("gpt-4.1", false);
        assert_eq!(
            url,
            "https://my-resource.openai.azure.com/openai/deployments/gpt-41/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn test_api_key_header() {
        let headers = provider().request_headers("gpt-4.1").unwrap();
        assert_eq!(headers[0].0, "api-key");
    }
}
