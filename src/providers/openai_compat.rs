//! Shared wire types for providers speaking the OpenAI chat format
//!
//! OpenAI, Azure, Groq, XAI, Mistral and Fireworks all accept the same
//! request shape and stream the same delta shape, differing only in URLs,
//! headers, error vocabularies and a handful of quirks captured by
//! `OpenAiQuirks`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::domain::message::{Message, MessageRole};
use crate::domain::tool_call::ToolChoice;
use crate::domain::usage::LLMUsage;
use crate::domain::version::ReasoningEffort;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::{
    internal_tool_name_to_native, native_tool_name_to_internal, FinishReason, ParsedResponse,
    ProviderOptions, ProviderResponse, ToolCallRequestDelta,
};

/// Which field carries the output-token cap
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxTokensField {
    MaxTokens,
    /// Newer OpenAI models reject `max_tokens`
    MaxCompletionTokens,
}

/// Per-adapter deviations from the base wire format
#[derive(Clone, Copy, Debug)]
pub struct OpenAiQuirks {
    pub max_tokens_field: MaxTokensField,
    pub supports_penalties: bool,
    pub supports_stream_options: bool,
    pub supports_parallel_tool_calls: bool,
    /// o-series style `reasoning_effort` request field
    pub supports_reasoning_effort: bool,
}

impl Default for OpenAiQuirks {
    fn default() -> Self {
        Self {
            max_tokens_field: MaxTokensField::MaxTokens,
            supports_penalties: true,
            supports_stream_options: true,
            supports_parallel_tool_calls: true,
            supports_reasoning_effort: false,
        }
    }
}

fn content_part(
    content: &crate::domain::message::MessageContent,
) -> Result<Option<Value>, ProviderError> {
    if let Some(text) = &content.text {
        return Ok(Some(json!({"type": "text", "text": text})));
    }
    if let Some(object) = &content.object {
        return Ok(Some(json!({"type": "text", "text": object.to_string()})));
    }
    if let Some(file) = &content.file {
        let url = file
            .to_url(Some("image/png"))
            .map_err(|e| ProviderError::new(ProviderErrorKind::ProviderInvalidFile, e.message))?;
        if file.is_audio() == Some(true) {
            let data = file.data.clone().unwrap_or_default();
            return Ok(Some(json!({
                "type": "input_audio",
                "input_audio": {"data": data, "format": "wav"},
            })));
        }
        return Ok(Some(json!({"type": "image_url", "image_url": {"url": url}})));
    }
    // Reasoning parts are never echoed back upstream
    Ok(None)
}

/// Convert domain messages into OpenAI wire messages. Tool results become
/// dedicated `tool` role messages; assistant tool requests ride on
/// `tool_calls`.
pub fn build_messages(messages: &[Message]) -> Result<Vec<Value>, ProviderError> {
    let mut wire = Vec::new();
    for message in messages {
        let role = message.role.as_str();

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        for content in &message.content {
            if let Some(request) = &content.tool_call_request {
                tool_calls.push(json!({
                    "id": request.id,
                    "type": "function",
                    "function": {
                        "name": internal_tool_name_to_native(&request.tool_name),
                        "arguments": request.tool_input.to_string(),
                    },
                }));
                continue;
            }
            if let Some(result) = &content.tool_call_result {
                wire.push(json!({
                    "role": "tool",
                    "tool_call_id": result.id,
                    "content": result.result.to_string(),
                }));
                continue;
            }
            if let Some(part) = content_part(content)? {
                parts.push(part);
            }
        }

        if parts.is_empty() && tool_calls.is_empty() {
            continue;
        }

        let mut entry = Map::new();
        entry.insert("role".to_string(), json!(role));
        if message.role == MessageRole::Assistant && !tool_calls.is_empty() {
            entry.insert("tool_calls".to_string(), json!(tool_calls));
            if !parts.is_empty() {
                entry.insert("content".to_string(), json!(parts));
            } else {
                entry.insert("content".to_string(), Value::Null);
            }
        } else if parts.len() == 1 && parts[0]["type"] == "text" {
            // Collapse single text parts to a plain string, the common case
            entry.insert("content".to_string(), parts[0]["text"].clone());
        } else {
            entry.insert("content".to_string(), json!(parts));
        }
        wire.push(Value::Object(entry));
    }
    Ok(wire)
}

/// Build a chat-completions request body
pub fn build_chat_body(
    messages: &[Message],
    options: &ProviderOptions,
    stream: bool,
    max_tokens: u32,
    quirks: &OpenAiQuirks,
) -> Result<Value, ProviderError> {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(options.model));
    body.insert("messages".to_string(), json!(build_messages(messages)?));

    match quirks.max_tokens_field {
        MaxTokensField::MaxTokens => body.insert("max_tokens".to_string(), json!(max_tokens)),
        MaxTokensField::MaxCompletionTokens => {
            body.insert("max_completion_tokens".to_string(), json!(max_tokens))
        }
    };

    if let Some(temperature) = options.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = options.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if quirks.supports_penalties {
        if let Some(p) = options.presence_penalty {
            body.insert("presence_penalty".to_string(), json!(p));
        }
        if let Some(p) = options.frequency_penalty {
            body.insert("frequency_penalty".to_string(), json!(p));
        }
    }

    if !options.enabled_tools.is_empty() {
        let tools: Vec<Value> = options
            .enabled_tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": internal_tool_name_to_native(&t.name),
                        "description": t.description,
                        "parameters": t.parameters.clone().unwrap_or(json!({"type": "object"})),
                    },
                })
            })
            .collect();
        body.insert("tools".to_string(), json!(tools));

        if let Some(choice) = &options.tool_choice {
            let wire_choice = match choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Function { name } => json!({
                    "type": "function",
                    "function": {"name": internal_tool_name_to_native(name)},
                }),
            };
            body.insert("tool_choice".to_string(), wire_choice);
        }
        if quirks.supports_parallel_tool_calls {
            if let Some(parallel) = options.parallel_tool_calls {
                body.insert("parallel_tool_calls".to_string(), json!(parallel));
            }
        }
    }

    if let Some(schema) = &options.output_schema {
        body.insert(
            "response_format".to_string(),
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "output",
                    "schema": schema,
                    "strict": options.use_structured_generation,
                },
            }),
        );
    }

    if quirks.supports_reasoning_effort {
        let effort = match options.reasoning_effort {
            Some(ReasoningEffort::Low) => Some("low"),
            Some(ReasoningEffort::Medium) => Some("medium"),
            Some(ReasoningEffort::High) => Some("high"),
            _ => None,
        };
        if let Some(effort) = effort {
            body.insert("reasoning_effort".to_string(), json!(effort));
        }
    }

    if stream {
        body.insert("stream".to_string(), json!(true));
        if quirks.supports_stream_options {
            body.insert("stream_options".to_string(), json!({"include_usage": true}));
        }
    }
    Ok(Value::Object(body))
}

// ---------------------------------------------------------------------------
// Response parsing

#[derive(Debug, Deserialize)]
struct WireUsageDetails {
    #[serde(default)]
    cached_tokens: Option<f64>,
    #[serde(default)]
    reasoning_tokens: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<f64>,
    #[serde(default)]
    completion_tokens: Option<f64>,
    #[serde(default)]
    prompt_tokens_details: Option<WireUsageDetails>,
    #[serde(default)]
    completion_tokens_details: Option<WireUsageDetails>,
}

impl WireUsage {
    fn to_domain(&self) -> LLMUsage {
        LLMUsage {
            prompt_token_count: self.prompt_tokens,
            prompt_token_count_cached: self
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens),
            completion_token_count: self.completion_tokens,
            completion_reasoning_token_count: self
                .completion_tokens_details
                .as_ref()
                .and_then(|d| d.reasoning_tokens),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    /// Emitted by reasoning models on several OpenAI-compatible hosts
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

/// Parse the arguments string of a completed tool call
pub fn parse_tool_arguments(raw: &str) -> Result<Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|_| {
        ProviderError::new(
            ProviderErrorKind::InvalidGeneration,
            "Model returned a tool call with unparseable arguments",
        )
        .with_capture()
        .with_extras(json!({"arguments": raw}))
    })
}

/// Parse a unary chat response
pub fn parse_chat_response(body: &[u8]) -> Result<ProviderResponse, ProviderError> {
    let response: WireChatResponse = serde_json::from_slice(body).map_err(|e| {
        ProviderError::new(
            ProviderErrorKind::ProviderInternal,
            format!("Failed to parse provider response: {e}"),
        )
        .with_raw(String::from_utf8_lossy(body).to_string())
    })?;

    let Some(choice) = response.choices.into_iter().next() else {
        return Err(ProviderError::new(
            ProviderErrorKind::ProviderInternal,
            "No choices in provider response",
        ));
    };

    match choice.finish_reason.as_deref() {
        Some("length") => {
            return Err(ProviderError::new(
                ProviderErrorKind::MaxTokensExceeded,
                "Model returned a length finish reason, the max tokens limit was exceeded",
            ));
        }
        Some("content_filter") => {
            return Err(ProviderError::new(
                ProviderErrorKind::ContentModeration,
                "Model refused to generate a response due to content moderation",
            ));
        }
        _ => {}
    }

    let mut tool_calls = Vec::new();
    for (i, call) in choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
    {
        tool_calls.push(crate::domain::tool_call::ToolCallRequest {
            index: Some(i),
            id: call.id.unwrap_or_default(),
            tool_name: native_tool_name_to_internal(&call.function.name.unwrap_or_default()),
            tool_input: parse_tool_arguments(call.function.arguments.as_deref().unwrap_or(""))?,
        });
    }

    Ok(ProviderResponse {
        text: choice.message.content.unwrap_or_default(),
        reasoning: choice.message.reasoning_content,
        tool_calls,
        usage: response.usage.map(|u| u.to_domain()).unwrap_or_default(),
    })
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    delta: Option<WireDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireChatChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

fn map_finish_reason(reason: &str) -> Option<FinishReason> {
    match reason {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::MaxContext),
        "tool_calls" | "function_call" => Some(FinishReason::ToolCalls),
        "content_filter" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

/// Parse one streamed SSE payload
pub fn parse_chat_stream_delta(event: &str) -> Result<ParsedResponse, ProviderError> {
    let chunk: WireChatChunk = serde_json::from_str(event).map_err(|e| {
        ProviderError::new(
            ProviderErrorKind::ProviderInternal,
            format!("Failed to parse stream chunk: {e}"),
        )
        .with_raw(event.to_string())
    })?;

    let mut parsed = ParsedResponse {
        usage: chunk.usage.map(|u| u.to_domain()),
        ..Default::default()
    };

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(parsed);
    };

    if let Some(delta) = choice.delta {
        parsed.delta = delta.content.filter(|c| !c.is_empty());
        parsed.reasoning = delta.reasoning_content.filter(|c| !c.is_empty());
        for call in delta.tool_calls.unwrap_or_default() {
            let function = call.function.unwrap_or(WireFunction {
                name: None,
                arguments: None,
            });
            parsed.tool_call_requests.push(ToolCallRequestDelta {
                idx: call.index,
                id: call.id.filter(|id| !id.is_empty()),
                tool_name: function
                    .name
                    .filter(|n| !n.is_empty())
                    .map(|n| native_tool_name_to_internal(&n)),
                arguments: function.arguments.unwrap_or_default(),
            });
        }
    }
    parsed.finish_reason = choice.finish_reason.as_deref().and_then(map_finish_reason);
    Ok(parsed)
}

/// Error envelope common to OpenAI-format providers
#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Pull the human-readable message out of an error body, falling back to the
/// raw body
pub fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<WireErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.to_string())
}

/// Rough local token estimate used when a provider does not report prompt
/// tokens: ~4 chars per token plus a per-message overhead
pub fn estimate_prompt_tokens(messages: &[Message]) -> f64 {
    messages
        .iter()
        .map(|m| 3.0 + m.text_content().len() as f64 / 4.0)
        .sum()
}
