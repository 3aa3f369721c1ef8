//! XAI adapter (OpenAI-compatible wire format)

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::domain::models::ProviderId;
use crate::domain::{File, Message};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::openai_compat::{
    self, estimate_prompt_tokens, extract_error_message, OpenAiQuirks,
};
use crate::providers::{
    effective_max_tokens, ErrorTable, ParsedResponse, Provider, ProviderOptions, ProviderResponse,
};

const DEFAULT_URL: &str = "https://api.x.ai/v1";

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)maximum prompt length|context length",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (
            r"(?i)unable to fetch image|image .* invalid",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)does not support",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
        (
            r"(?i)model .* (does not exist|not found)",
            ProviderErrorKind::MissingModel,
        ),
        (
            r"(?i)grammar|structured output",
            ProviderErrorKind::StructuredGeneration,
        ),
    ])
});

#[derive(Clone, Debug)]
pub struct XaiConfig {
    pub api_key: String,
    pub url: String,
}

impl XaiConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("XAI_API_KEY").ok()?,
            url: std::env::var("XAI_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct XaiProvider {
    config: XaiConfig,
}

impl XaiProvider {
    pub fn new(config: XaiConfig) -> Self {
        Self { config }
    }
}

impl Provider for XaiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Xai
    }

    fn build_request(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
        stream: bool,
    ) -> Result<Value, ProviderError> {
        let model = crate::domain::models::model_data(&options.model).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::MissingModel, &options.model)
        })?;
        // Reasoning is always on for Grok models; no effort field on the wire
        let quirks = OpenAiQuirks {
            supports_penalties: false,
            ..OpenAiQuirks::default()
        };
        let max_tokens = effective_max_tokens(
            &model,
            options.max_tokens,
            options.final_reasoning_budget(&model),
        );
        openai_compat::build_chat_body(messages, options, stream, max_tokens, &quirks)
    }

    fn request_url(&self, _model: &str, _stream: bool) -> String {
        format!("{}/chat/completions", self.config.url)
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "XAI API key is not configured",
            ));
        }
        Ok(vec![(
            "authorization".to_string(),
            format!("Bearer {}", self.config.api_key),
        )])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        openai_compat::parse_chat_response(body)
    }

    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError> {
        openai_compat::parse_chat_stream_delta(event)
    }

    fn requires_downloading_file(&self, file: &File, _model: &str) -> bool {
        file.is_image() != Some(true)
    }

    fn default_model(&self) -> &'static str {
        "grok-4"
    }

    fn max_number_of_file_urls(&self) -> Option<usize> {
        Some(10)
    }

    fn compute_prompt_token_count(
        &self,
        messages: &[Message],
        _model: &str,
    ) -> Result<f64, ProviderError> {
        Ok(estimate_prompt_tokens(messages))
    }

    fn map_error(&self, status: u16, body: &str) -> ProviderError {
        ERROR_TABLE.classify(status, &extract_error_message(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> XaiProvider {
        XaiProvider::new(XaiConfig {
            api_key: "xai-test".to_string(),
            url: DEFAULT_URL.to_string(),
        })
    }

    #[test]
    fn test_structured_generation_error_mapping() {
        let err = provider().map_error(
            400,
            r#"{"error":{"message":"grammar error in structured output"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::StructuredGeneration);
    }

    #[test]
    fn test_image_url_limit() {
        assert_eq!(provider().max_number_of_file_urls(), Some(10));
    }
}
