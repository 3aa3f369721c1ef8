//! Fireworks adapter (OpenAI-compatible wire format)
//!
//! Open-weight reasoning models served here emit their reasoning inline as
//! `<think>...</think>` spans instead of a dedicated field; the streaming
//! layer diverts those spans into the reasoning buffer.

use once_cell::sync::Lazy;
use serde_json::Value;

use crate::domain::models::{ModelData, ProviderId};
use crate::domain::{File, Message};
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::openai_compat::{
    self, estimate_prompt_tokens, extract_error_message, OpenAiQuirks,
};
use crate::providers::{
    effective_max_tokens, ErrorTable, ParsedResponse, Provider, ProviderOptions, ProviderResponse,
};

const DEFAULT_URL: &str = "https://api.fireworks.ai/inference/v1";

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)longer than the maximum|context length",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (
            r"(?i)failed to download|image is invalid",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)does not support",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
        (
            r"(?i)model not found|no such model",
            ProviderErrorKind::MissingModel,
        ),
    ])
});

/// Catalog ids map to fully qualified account paths upstream
fn wire_model(model: &str) -> String {
    match model {
        "deepseek-r1" => "accounts/fireworks/models/deepseek-r1".to_string(),
        "deepseek-v3" => "accounts/fireworks/models/deepseek-v3".to_string(),
        "llama-3.3-70b" => "accounts/fireworks/models/llama-v3p3-70b-instruct".to_string(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct FireworksConfig {
    pub api_key: String,
    pub url: String,
}

impl FireworksConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("FIREWORKS_API_KEY").ok()?,
            url: std::env::var("FIREWORKS_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct FireworksProvider {
    config: FireworksConfig,
}

impl FireworksProvider {
    pub fn new(config: FireworksConfig) -> Self {
        Self { config }
    }
}

impl Provider for FireworksProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Fireworks
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
        let max_tokens = effective_max_tokens(
            &model,
            options.max_tokens,
            options.final_reasoning_budget(&model),
        );
        let mut body = openai_compat::build_chat_body(
            messages,
            options,
            stream,
            max_tokens,
            &OpenAiQuirks::default(),
        )?;
        body["model"] = Value::String(wire_model(&options.model));
        Ok(body)
    }

    fn request_url(&self, _model: &str, _stream: bool) -> String {
        format!("{}/chat/completions", self.config.url)
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "Fireworks API key is not configured",
            ));
        }
        Ok(vec![(
            "authorization".to_string(),
            format!("Bearer {}", self.config.api_key),
        )])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        let mut parsed = openai_compat::parse_chat_response(body)?;
        // Unary responses can carry an inline think span too
        if parsed.reasoning.is_none() {
            if let Some(rest) = parsed.text.strip_prefix("<think>") {
                if let Some((reasoning, text)) = rest.split_once("</think>") {
                    parsed.reasoning = Some(reasoning.trim().to_string());
                    parsed.text = text.trim_start().to_string();
                }
            }
        }
        Ok(parsed)
    }

    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError> {
        openai_compat::parse_chat_stream_delta(event)
    }

    fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
        true
    }

    fn default_model(&self) -> &'static str {
        "deepseek-v3"
    }

    fn sanitize_model_data(&self, data: &mut ModelData) {
        // Served open-weight models cannot do strict structured generation
        if data.id.starts_with("deepseek") {
            data.supports_files = false;
        }
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

    fn uses_inline_think_tags(&self) -> bool {
        true
    }
}
