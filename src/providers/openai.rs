//! OpenAI adapter

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::domain::models::ProviderId;
use crate::domain::{File, Message};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::openai_compat::{
    self, estimate_prompt_tokens, extract_error_message, MaxTokensField, OpenAiQuirks,
};
use crate::providers::{
    effective_max_tokens, ErrorTable, ParsedResponse, Provider, ProviderOptions, ProviderResponse,
};

const DEFAULT_URL: &str = "https://api.openai.com/v1";

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)maximum context length|context_length_exceeded",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (
            r"(?i)content management policy|content_policy_violation",
            ProviderErrorKind::ContentModeration,
        ),
        (
            r"(?i)invalid image|unsupported image|error while downloading",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)does not support|is not supported with",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
        (
            r"(?i)model .* does not exist|model_not_found",
            ProviderErrorKind::MissingModel,
        ),
        (
            r"(?i)invalid schema|json_schema",
            ProviderErrorKind::StructuredGeneration,
        ),
    ])
});

#[derive(Clone, Debug)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub url: String,
}

impl OpenAIConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("OPENAI_API_KEY").ok()?,
            url: std::env::var("OPENAI_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct OpenAIProvider {
    config: OpenAIConfig,
}

impl OpenAIProvider {
    pub fn new(config: OpenAIConfig) -> Self {
        Self { config }
    }

    /// Newer model families reject `max_tokens`
    fn quirks(model: &str) -> OpenAiQuirks {
        let reasoning_family =
            model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4");
        OpenAiQuirks {
            max_tokens_field: if reasoning_family || model.starts_with("gpt-5") {
                MaxTokensField::MaxCompletionTokens
            } else {
                MaxTokensField::MaxTokens
            },
            supports_penalties: !reasoning_family,
            supports_reasoning_effort: reasoning_family,
            ..OpenAiQuirks::default()
        }
    }
}

impl Provider for OpenAIProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Openai
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
        // OpenAI has no separate budget field; the budget only widens the cap
        let max_tokens = effective_max_tokens(
            &model,
            options.max_tokens,
            options.final_reasoning_budget(&model),
        );
        openai_compat::build_chat_body(
            messages,
            options,
            stream,
            max_tokens,
            &Self::quirks(&options.model),
        )
    }

    fn request_url(&self, _model: &str, _stream: bool) -> String {
        format!("{}/chat/completions", self.config.url)
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "OpenAI API key is not configured",
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
        // Images can be passed by URL; everything else wants bytes
        file.is_image() != Some(true)
    }

    fn default_model(&self) -> &'static str {
        "gpt-4.1"
    }

    fn max_number_of_file_urls(&self) -> Option<usize> {
        Some(20)
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
    use crate::domain::message::MessageRole;

    fn provider() -> OpenAIProvider {
        OpenAIProvider::new(OpenAIConfig {
            api_key: "sk-test".to_string(),
            url: DEFAULT_URL.to_string(),
        })
    }

    #[test]
    fn test_request_url_and_headers() {
        let p = provider();
        assert_eq!(
            p.request_url("gpt-4.1", true),
            "https://api.openai.com/v1/chat/completions"
        );
        let headers = p.request_headers("gpt-4.1").unwrap();
        assert_eq!(headers[0].0, "authorization");
        assert!(headers[0].1.starts_with("Bearer "));
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let p = OpenAIProvider::new(OpenAIConfig {
            api_key: String::new(),
            url: DEFAULT_URL.to_string(),
        });
        let err = p.request_headers("gpt-4.1").unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::InvalidProviderConfig);
    }

    #[test]
    fn test_build_request_uses_max_completion_tokens_for_o_series() {
        let p = provider();
        let messages = vec![Message::with_text(MessageRole::User, "hi")];
        let options = ProviderOptions {
            model: "o3".to_string(),
            ..Default::default()
        };
        let body = p.build_request(&messages, &options, false).unwrap();
        assert!(body.get("max_completion_tokens").is_some());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_error_mapping() {
        let p = provider();
        let err = p.map_error(
            400,
            r#"{"error":{"message":"This model's maximum context length is 128000 tokens"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::MaxTokensExceeded);

        let err = p.map_error(500, "internal server error");
        assert_eq!(err.kind, ProviderErrorKind::ProviderInternal);
    }

    #[test]
    fn test_image_urls_pass_through() {
        let p = provider();
        let image = File {
            content_type: Some("image/png".to_string()),
            url: Some("https://example.com/cat.png".to_string()),
            ..Default::default()
        };
        assert!(!p.requires_downloading_file(&image, "gpt-4.1"));

        let pdf = File {
            content_type: Some("application/pdf".to_string()),
            url: Some("https://example.com/doc.pdf".to_string()),
            ..Default::default()
        };
        assert!(p.requires_downloading_file(&pdf, "gpt-4.1"));
    }

    #[test]
    fn test_supports_model_from_catalog() {
        let p = provider();
        assert!(p.supports_model("gpt-4.1"));
        assert!(!p.supports_model("claude-sonnet-4-5"));
        assert!(!p.supports_model("unknown-model"));
    }
}
