//! Anthropic adapter
//!
//! The messages API differs from the OpenAI shape in three ways the gateway
//! must normalize: the system prompt is a dedicated field, `max_tokens` is
//! mandatory, and streaming uses named SSE events with typed content-block
//! deltas.

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
    FinishReason, ParsedResponse, Provider, ProviderOptions, ProviderResponse,
    ToolCallRequestDelta,
};

const DEFAULT_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_PDF_BETA: &str = "pdfs-2024-09-25";

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)prompt is too long|exceed context limit",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (r"(?i)overloaded_error|overloaded", ProviderErrorKind::ProviderInternal),
        (
            r"(?i)credit balance is too low",
            ProviderErrorKind::InvalidProviderConfig,
        ),
        (
            r"(?i)could not process image|invalid image",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)does not support",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
    ])
});

#[derive(Clone, Debug)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub url: String,
}

impl AnthropicConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("ANTHROPIC_API_KEY").ok()?,
            url: std::env::var("ANTHROPIC_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct AnthropicProvider {
    config: AnthropicConfig,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Self {
        Self { config }
    }

    fn content_blocks(message: &Message) -> Result<Vec<Value>, ProviderError> {
        let mut blocks = Vec::new();
        for content in &message.content {
            if let Some(text) = &content.text {
                blocks.push(json!({"type": "text", "text": text}));
            } else if let Some(object) = &content.object {
                blocks.push(json!({"type": "text", "text": object.to_string()}));
            } else if let Some(file) = &content.file {
                let Some(data) = &file.data else {
                    return Err(ProviderError::new(
                        ProviderErrorKind::ProviderInvalidFile,
                        "File bytes must be materialized before building an Anthropic request",
                    ));
                };
                let media_type = file.content_type.as_deref().unwrap_or("image/png");
                let block_type = if file.is_pdf() == Some(true) {
                    "document"
                } else {
                    "image"
                };
                blocks.push(json!({
                    "type": block_type,
                    "source": {"type": "base64", "media_type": media_type, "data": data},
                }));
            } else if let Some(request) = &content.tool_call_request {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": request.id,
                    "name": internal_tool_name_to_native(&request.tool_name),
                    "input": request.tool_input,
                }));
            } else if let Some(result) = &content.tool_call_result {
                blocks.push(json!({
                    "type": "tool_result",
                    "tool_use_id": result.id,
                    "content": result.result.to_string(),
                    "is_error": result.error.is_some(),
                }));
            }
            // Reasoning parts are not echoed back
        }
        Ok(blocks)
    }
}

impl Provider for AnthropicProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Anthropic
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

        // The system prompt rides in a dedicated field
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
            // At least one message is required upstream
            wire_messages.push(json!({"role": "user", "content": [{"type": "text", "text": "-"}]}));
        }

        let thinking_budget = options.final_reasoning_budget(&model);

        let mut body = Map::new();
        body.insert("model".to_string(), json!(options.model));
        body.insert("messages".to_string(), json!(wire_messages));
        body.insert(
            "max_tokens".to_string(),
            json!(effective_max_tokens(&model, options.max_tokens, thinking_budget)),
        );
        if let Some(system) = system {
            body.insert("system".to_string(), json!(system));
        }
        if let Some(temperature) = options.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(top_p) = options.top_p {
            body.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(budget) = thinking_budget {
            body.insert(
                "thinking".to_string(),
                json!({"type": "enabled", "budget_tokens": budget}),
            );
        }
        if !options.enabled_tools.is_empty() {
            let tools: Vec<Value> = options
                .enabled_tools
                .iter()
                .map(|t| {
                    json!({
                        "name": internal_tool_name_to_native(&t.name),
                        "description": t.description,
                        "input_schema": t.parameters.clone().unwrap_or(json!({"type": "object"})),
                    })
                })
                .collect();
            body.insert("tools".to_string(), json!(tools));
            if let Some(choice) = &options.tool_choice {
                let wire_choice = match choice {
                    ToolChoice::Auto | ToolChoice::None => json!({"type": "auto"}),
                    ToolChoice::Required => json!({"type": "any"}),
                    ToolChoice::Function { name } => {
                        json!({"type": "tool", "name": internal_tool_name_to_native(name)})
                    }
                };
                body.insert("tool_choice".to_string(), wire_choice);
            }
        }
        if stream {
            body.insert("stream".to_string(), json!(true));
        }
        // Presence and frequency penalties are not supported upstream
        Ok(Value::Object(body))
    }

    fn request_url(&self, _model: &str, _stream: bool) -> String {
        self.config.url.clone()
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "Anthropic API key is not configured",
            ));
        }
        Ok(vec![
            ("x-api-key".to_string(), self.config.api_key.clone()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("anthropic-beta".to_string(), ANTHROPIC_PDF_BETA.to_string()),
        ])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        let response: WireResponse = serde_json::from_slice(body).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                format!("Failed to parse Anthropic response: {e}"),
            )
            .with_raw(String::from_utf8_lossy(body).to_string())
        })?;

        if response.stop_reason.as_deref() == Some("max_tokens") {
            return Err(ProviderError::new(
                ProviderErrorKind::MaxTokensExceeded,
                "Model returned a max_tokens stop reason, the max tokens limit was exceeded",
            )
            .with_raw(String::from_utf8_lossy(body).to_string()));
        }
        if response.content.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                "No content in Anthropic response",
            ));
        }

        let mut text = String::new();
        let mut reasoning_parts = Vec::new();
        let mut tool_calls = Vec::new();
        for (i, block) in response.content.iter().enumerate() {
            match block {
                WireContent::Text { text: t } => {
                    if text.is_empty() {
                        text = t.clone();
                    }
                }
                WireContent::Thinking { thinking } => reasoning_parts.push(thinking.clone()),
                WireContent::ToolUse { id, name, input } => tool_calls.push(ToolCallRequest {
                    index: Some(i),
                    id: id.clone(),
                    tool_name: native_tool_name_to_internal(name),
                    tool_input: input.clone(),
                }),
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

    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError> {
        let chunk: WireStreamEvent = serde_json::from_str(event).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                format!("Failed to parse Anthropic stream event: {e}"),
            )
            .with_raw(event.to_string())
        })?;

        let mut parsed = ParsedResponse::default();
        match chunk {
            WireStreamEvent::MessageStart { message } => {
                parsed.usage = message.usage.map(|u| u.to_domain());
            }
            WireStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                if let WireContent::ToolUse { id, name, .. } = content_block {
                    parsed.tool_call_requests.push(ToolCallRequestDelta {
                        idx: Some(index),
                        id: Some(id),
                        tool_name: Some(native_tool_name_to_internal(&name)),
                        arguments: String::new(),
                    });
                }
            }
            WireStreamEvent::ContentBlockDelta { index, delta } => match delta {
                WireBlockDelta::TextDelta { text } => parsed.delta = Some(text),
                WireBlockDelta::ThinkingDelta { thinking } => parsed.reasoning = Some(thinking),
                WireBlockDelta::InputJsonDelta { partial_json } => {
                    parsed.tool_call_requests.push(ToolCallRequestDelta {
                        idx: Some(index),
                        id: None,
                        tool_name: None,
                        arguments: partial_json,
                    });
                }
                WireBlockDelta::Other => {}
            },
            WireStreamEvent::MessageDelta { delta, usage } => {
                parsed.usage = usage.map(|u| u.to_domain());
                parsed.finish_reason = delta.and_then(|d| d.stop_reason).and_then(|r| {
                    match r.as_str() {
                        "max_tokens" => Some(FinishReason::MaxContext),
                        "tool_use" => Some(FinishReason::ToolCalls),
                        "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
                        "refusal" => Some(FinishReason::ContentFilter),
                        _ => None,
                    }
                });
            }
            WireStreamEvent::Ignored => {}
        }
        Ok(parsed)
    }

    fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
        // The messages API only accepts inline base64 content
        true
    }

    fn default_model(&self) -> &'static str {
        "claude-sonnet-4-5"
    }

    fn compute_prompt_token_count(
        &self,
        _messages: &[Message],
        _model: &str,
    ) -> Result<f64, ProviderError> {
        // Token counts arrive with the usage payload
        Err(ProviderError::new(
            ProviderErrorKind::UnpriceableRun,
            "Token counting is not implemented for Anthropic",
        ))
    }

    fn map_error(&self, status: u16, body: &str) -> ProviderError {
        let message = serde_json::from_str::<WireErrorResponse>(body)
            .ok()
            .and_then(|b| b.error)
            .map(|e| e.message)
            .unwrap_or_else(|| body.to_string());
        ERROR_TABLE.classify(status, &message)
    }

    fn observe_rate_limits(&self, headers: &reqwest::header::HeaderMap) {
        for kind in ["requests", "tokens", "input-tokens", "output-tokens"] {
            let name = format!("anthropic-ratelimit-{kind}-remaining");
            if let Some(remaining) = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
            {
                crate::metrics::observe_rate_limit("anthropic", kind, remaining);
            }
        }
    }

    fn sse_skips_event_lines(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Wire models

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<f64>,
    #[serde(default)]
    output_tokens: Option<f64>,
    #[serde(default)]
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
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    content: Vec<WireContent>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireMessageStart {
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireStopDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireStreamEvent {
    MessageStart {
        message: WireMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: WireContent,
    },
    ContentBlockDelta {
        index: usize,
        delta: WireBlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: Option<WireStopDelta>,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct WireErrorResponse {
    error: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}
