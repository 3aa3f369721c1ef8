//! Groq adapter (OpenAI-compatible wire format)

use once_cell::sync::Lazy;
use regex::Regex;
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

const DEFAULT_URL: &str = "https://api.groq.com/openai/v1";

/// Moderation refusals come back as plain prose, not a coded error
static CONTENT_MODERATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(can't|not)[^.]*(help|assist|going)[^.]*with that").unwrap());

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)reduce the length|context window|request too large",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (
            r"(?i)failed_generation|json_validate_failed",
            ProviderErrorKind::FailedGeneration,
        ),
        (
            r"(?i)fetching image|image format",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)does not support|tool use is not supported",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
        (
            r"(?i)model .* (does not exist|not found)",
            ProviderErrorKind::MissingModel,
        ),
    ])
});

/// Whether a completed generation reads as a moderation refusal
pub fn is_content_moderation_completion(raw_completion: &str) -> bool {
    CONTENT_MODERATION_REGEX.is_match(raw_completion)
}

#[derive(Clone, Debug)]
pub struct GroqConfig {
    pub api_key: String,
    pub url: String,
}

impl GroqConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("GROQ_API_KEY").ok()?,
            url: std::env::var("GROQ_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct GroqProvider {
    config: GroqConfig,
}

impl GroqProvider {
    pub fn new(config: GroqConfig) -> Self {
        Self { config }
    }
}

impl Provider for GroqProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Groq
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
        let quirks = OpenAiQuirks {
            supports_parallel_tool_calls: false,
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
                "Groq API key is not configured",
            ));
        }
        Ok(vec![(
            "authorization".to_string(),
            format!("Bearer {}", self.config.api_key),
        )])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        let parsed = openai_compat::parse_chat_response(body)?;
        if is_content_moderation_completion(&parsed.text) {
            return Err(ProviderError::new(
                ProviderErrorKind::ContentModeration,
                "Model refused to generate a response",
            )
            .with_raw(parsed.text));
        }
        Ok(parsed)
    }

    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError> {
        openai_compat::parse_chat_stream_delta(event)
    }

    fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
        // Groq rejects remote URLs for anything but tiny images; always inline
        true
    }

    fn default_model(&self) -> &'static str {
        "llama-3.3-70b"
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

    fn provider() -> GroqProvider {
        GroqProvider::new(GroqConfig {
            api_key: "gsk-test".to_string(),
            url: DEFAULT_URL.to_string(),
        })
    }

    #[test]
    fn test_moderation_regexp() {
        assert!(is_content_moderation_completion(
            "I can't help you with that"
        ));
        assert!(is_content_moderation_completion(
            "I'm not going to assist with that"
        ));
        assert!(!is_content_moderation_completion("The capital is Paris"));
    }

    #[test]
    fn test_moderation_response_raises() {
        let body = serde_json::json!({
            "choices": [{"message": {"content": "I can't assist with that."}, "finish_reason": "stop"}]
        });
        let err = provider()
            .parse_response(body.to_string().as_bytes())
            .unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::ContentModeration);
    }

    #[test]
    fn test_failed_generation_mapping() {
        let err = provider().map_error(
            400,
            r#"{"error":{"message":"json_validate_failed: output did not match schema"}}"#,
        );
        assert_eq!(err.kind, ProviderErrorKind::FailedGeneration);
    }

    #[test]
    fn test_request_url() {
        assert_eq!(
            provider().request_url("llama-3.3-70b", false),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }
}
