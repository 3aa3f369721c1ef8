//! Amazon Bedrock adapter (Converse API)
//!
//! Converse streaming uses the AWS binary event-stream protocol rather than
//! SSE, so the adapter reports itself as non-streamable and the runner falls
//! back to unary calls.

use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::domain::message::{Message, MessageRole};
use crate::domain::models::ProviderId;
use crate::domain::tool_call::{ToolCallRequest, ToolChoice};
use crate::domain::usage::LLMUsage;
use crate::domain::File;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::{
    effective_max_tokens, internal_tool_name_to_native, native_tool_name_to_internal, ErrorTable,
    ParsedResponse, Provider, ProviderOptions, ProviderResponse,
};

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)input is too long|too many input tokens",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (
            r"(?i)ThrottlingException|too many requests",
            ProviderErrorKind::RateLimited,
        ),
        (
            r"(?i)ValidationException.*image|could not process the image",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)does not support|on-demand throughput",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
        (
            r"(?i)model identifier is invalid",
            ProviderErrorKind::MissingModel,
        ),
        (
            r"(?i)ServiceUnavailableException|ModelErrorException",
            ProviderErrorKind::ProviderInternal,
        ),
    ])
});

/// Catalog ids map to Bedrock inference profile ids
fn wire_model(model: &str) -> String {
    match model {
        "claude-opus-4-1" => "us.anthropic.claude-opus-4-1-20250805-v1:0".to_string(),
        "claude-sonnet-4-5" => "us.anthropic.claude-sonnet-4-5-20250929-v1:0".to_string(),
        "claude-haiku-4-5" => "us.anthropic.claude-haiku-4-5-20251001-v1:0".to_string(),
        other => other.to_string(),
    }
}

#[derive(Clone, Debug)]
pub struct BedrockConfig {
    /// Bearer token for the runtime API
    pub api_key: String,
    pub region: String,
}

impl BedrockConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("AWS_BEARER_TOKEN_BEDROCK").ok()?,
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        })
    }
}

#[derive(Debug)]
pub struct BedrockProvider {
    config: BedrockConfig,
}

impl BedrockProvider {
    pub fn new(config: BedrockConfig) -> Self {
        Self { config }
    }

    fn content_blocks(message: &Message) -> Result<Vec<Value>, ProviderError> {
        let mut blocks = Vec::new();
        for content in &message.content {
            if let Some(text) = &content.text {
                blocks.push(json!({"text": text}));
            } else if let Some(object) = &content.object {
                blocks.push(json!({"text": object.to_string()}));
            } else if let Some(file) = &content.file {
                let Some(data) = &file.data else {
                    return Err(ProviderError::new(
                        ProviderErrorKind::ProviderInvalidFile,
                        "File bytes must be materialized before building a Bedrock request",
                    ));
                };
                let format = file.extension().trim_start_matches('.').to_string();
                if file.is_pdf() == Some(true) {
                    blocks.push(json!({
                        "document": {"format": "pdf", "name": "document", "source": {"bytes": data}}
                    }));
                } else {
                    blocks.push(json!({
                        "image": {"format": format, "source": {"bytes": data}}
                    }));
                }
            } else if let Some(request) = &content.tool_call_request {
                blocks.push(json!({
                    "toolUse": {
                        "toolUseId": request.id,
                        "name": internal_tool_name_to_native(&request.tool_name),
                        "input": request.tool_input,
                    }
                }));
            } else if let Some(result) = &content.tool_call_result {
                blocks.push(json!({
                    "toolResult": {
                        "toolUseId": result.id,
                        "content": [{"json": result.result}],
                        "status": if result.error.is_some() { "error" } else { "success" },
                    }
                }));
            }
        }
        Ok(blocks)
    }
}

impl Provider for BedrockProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Bedrock
    }

    fn build_request(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
        _stream: bool,
    ) -> Result<Value, ProviderError> {
        let model = crate::domain::models::model_data(&options.model).ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::MissingModel, &options.model)
        })?;

        let (system, rest): (Option<String>, &[Message]) = match messages.first() {
            Some(first) if first.role == MessageRole::System => {
                (Some(first.text_content()), &messages[1..])
            }
            _ => (None, messages),
        };

        let mut wire_messages = Vec::new();
        for message in rest {
            let role = match message.role {
                MessageRole::Assistant => "assistant",
                _ => "user",
            };
            let blocks = Self::content_blocks(message)?;
            if !blocks.is_empty() {
                wire_messages.push(json!({"role": role, "content": blocks}));
            }
        }
        if wire_messages.is_empty() {
            wire_messages.push(json!({"role": "user", "content": [{"text": "-"}]}));
        }

        let thinking_budget = options.final_reasoning_budget(&model);
        let mut inference_config = Map::new();
        inference_config.insert(
            "maxTokens".to_string(),
            json!(effective_max_tokens(&model, options.max_tokens, thinking_budget)),
        );
        if let Some(t) = options.temperature {
            inference_config.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = options.top_p {
            inference_config.insert("topP".to_string(), json!(p));
        }

        let mut body = Map::new();
        if let Some(system) = system {
            body.insert("system".to_string(), json!([{"text": system}]));
        }
        body.insert("messages".to_string(), json!(wire_messages));
        body.insert("inferenceConfig".to_string(), Value::Object(inference_config));

        if let Some(budget) = thinking_budget {
            body.insert(
                "additionalModelRequestFields".to_string(),
                json!({"thinking": {"type": "enabled", "budget_tokens": budget}}),
            );
        }

        if !options.enabled_tools.is_empty() {
            let tools: Vec<Value> = options
                .enabled_tools
                .iter()
                .map(|t| {
                    json!({
                        "toolSpec": {
                            "name": internal_tool_name_to_native(&t.name),
                            "description": t.description,
                            "inputSchema": {"json": t.parameters.clone().unwrap_or(json!({"type": "object"}))},
                        }
                    })
                })
                .collect();
            let mut tool_config = Map::new();
            tool_config.insert("tools".to_string(), json!(tools));
            if let Some(choice) = &options.tool_choice {
                let wire_choice = match choice {
                    ToolChoice::Auto | ToolChoice::None => json!({"auto": {}}),
                    ToolChoice::Required => json!({"any": {}}),
                    ToolChoice::Function { name } => {
                        json!({"tool": {"name": internal_tool_name_to_native(name)}})
                    }
                };
                tool_config.insert("toolChoice".to_string(), wire_choice);
            }
            body.insert("toolConfig".to_string(), Value::Object(tool_config));
        }
        Ok(Value::Object(body))
    }

    fn request_url(&self, model: &str, _stream: bool) -> String {
        format!(
            "https://bedrock-runtime.{}.amazonaws.com/model/{}/converse",
            self.config.region,
            wire_model(model)
        )
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "Bedrock bearer token is not configured",
            ));
        }
        Ok(vec![(
            "authorization".to_string(),
            format!("Bearer {}", self.config.api_key),
        )])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        let response: WireResponse = serde_json::from_slice(body).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                format!("Failed to parse Bedrock response: {e}"),
            )
            .with_raw(String::from_utf8_lossy(body).to_string())
        })?;

        match response.stop_reason.as_deref() {
            Some("max_tokens") => {
                return Err(ProviderError::new(
                    ProviderErrorKind::MaxTokensExceeded,
                    "Model returned a max_tokens stop reason",
                ));
            }
            Some("content_filtered") => {
                return Err(ProviderError::new(
                    ProviderErrorKind::ContentModeration,
                    "Model response was filtered for content",
                ));
            }
            _ => {}
        }

        let mut text = String::new();
        let mut reasoning_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let blocks = response
            .output
            .and_then(|o| o.message)
            .map(|m| m.content)
            .unwrap_or_default();
        for (i, block) in blocks.into_iter().enumerate() {
            if let Some(t) = block.text {
                text.push_str(&t);
            }
            if let Some(reasoning) = block.reasoning_content {
                if let Some(rt) = reasoning.reasoning_text {
                    reasoning_parts.push(rt.text);
                }
            }
            if let Some(tool_use) = block.tool_use {
                tool_calls.push(ToolCallRequest {
                    index: Some(i),
                    id: tool_use.tool_use_id,
                    tool_name: native_tool_name_to_internal(&tool_use.name),
                    tool_input: tool_use.input.unwrap_or(json!({})),
                });
            }
        }

        Ok(ProviderResponse {
            text,
            reasoning: if reasoning_parts.is_empty() {
                None
            } else {
                Some(reasoning_parts.join("\n\n"))
            },
            tool_calls,
            usage: response.usage.map(|u| u.to_domain()).unwrap_or_default(),
        })
    }

    fn parse_stream_delta(&self, _event: &str) -> Result<ParsedResponse, ProviderError> {
        Err(ProviderError::new(
            ProviderErrorKind::ModelDoesNotSupportMode,
            "Bedrock converse streaming is not supported",
        ))
    }

    fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
        true
    }

    fn is_streamable(&self, _model: &str, _has_tools: bool) -> bool {
        false
    }

    fn default_model(&self) -> &'static str {
        "claude-sonnet-4-5"
    }

    fn compute_prompt_token_count(
        &self,
        _messages: &[Message],
        _model: &str,
    ) -> Result<f64, ProviderError> {
        Err(ProviderError::new(
            ProviderErrorKind::UnpriceableRun,
            "Token counting is not implemented for Bedrock",
        ))
    }

    fn map_error(&self, status: u16, body: &str) -> ProviderError {
        let message = serde_json::from_str::<WireErrorBody>(body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| body.to_string());
        ERROR_TABLE.classify(status, &message)
    }
}

// ---------------------------------------------------------------------------
// Wire models

#[derive(Debug, Deserialize)]
struct WireToolUse {
    #[serde(rename = "toolUseId")]
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireReasoningText {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireReasoningContent {
    #[serde(default, rename = "reasoningText")]
    reasoning_text: Option<WireReasoningText>,
}

#[derive(Debug, Deserialize)]
struct WireBlock {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "toolUse")]
    tool_use: Option<WireToolUse>,
    #[serde(default, rename = "reasoningContent")]
    reasoning_content: Option<WireReasoningContent>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireBlock>,
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default, rename = "inputTokens")]
    input_tokens: Option<f64>,
    #[serde(default, rename = "outputTokens")]
    output_tokens: Option<f64>,
    #[serde(default, rename = "cacheReadInputTokens")]
    cache_read_input_tokens: Option<f64>,
}

impl WireUsage {
    fn to_domain(&self) -> LLMUsage {
        LLMUsage {
            prompt_token_count: self.input_tokens,
            prompt_token_count_cached: self.cache_read_input_tokens,
            completion_token_count: self.output_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    output: Option<WireOutput>,
    #[serde(default, rename = "stopReason")]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    message: Option<String>,
}
