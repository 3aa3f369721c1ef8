//! Gemini adapter (generateContent API)

use once_cell::sync::Lazy;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::domain::message::{Message, MessageRole};
use crate::domain::models::ProviderId;
use crate::domain::tool_call::{ToolCallRequest, ToolChoice};
use crate::domain::usage::LLMUsage;
use crate::domain::File;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::openai_compat::estimate_prompt_tokens;
use crate::providers::{
    effective_max_tokens, internal_tool_name_to_native, native_tool_name_to_internal, ErrorTable,
    FinishReason, ParsedResponse, Provider, ProviderOptions, ProviderResponse,
    ToolCallRequestDelta,
};

const DEFAULT_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

static ERROR_TABLE: Lazy<ErrorTable> = Lazy::new(|| {
    ErrorTable::new(&[
        (
            r"(?i)exceeds the maximum number of tokens|token count",
            ProviderErrorKind::MaxTokensExceeded,
        ),
        (
            r"(?i)url_retrieval|unable to process input image|file .* not exist",
            ProviderErrorKind::ProviderInvalidFile,
        ),
        (
            r"(?i)function calling is not enabled|not supported",
            ProviderErrorKind::ModelDoesNotSupportMode,
        ),
        (
            r"(?i)models/.* is not found",
            ProviderErrorKind::MissingModel,
        ),
        (r"(?i)PROHIBITED_CONTENT|SAFETY", ProviderErrorKind::ContentModeration),
        (r"(?i)RESOURCE_EXHAUSTED", ProviderErrorKind::RateLimited),
    ])
});

#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: String,
    pub url: String,
}

impl GeminiConfig {
    pub fn from_env() -> Option<Self> {
        Some(Self {
            api_key: std::env::var("GEMINI_API_KEY").ok()?,
            url: std::env::var("GEMINI_API_URL").unwrap_or_else(|_| DEFAULT_URL.to_string()),
        })
    }
}

#[derive(Debug)]
pub struct GeminiProvider {
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Self {
        Self { config }
    }

    fn parts(message: &Message) -> Result<Vec<Value>, ProviderError> {
        let mut parts = Vec::new();
        for content in &message.content {
            if let Some(text) = &content.text {
                parts.push(json!({"text": text}));
            } else if let Some(object) = &content.object {
                parts.push(json!({"text": object.to_string()}));
            } else if let Some(file) = &content.file {
                let Some(data) = &file.data else {
                    return Err(ProviderError::new(
                        ProviderErrorKind::ProviderInvalidFile,
                        "File bytes must be materialized before building a Gemini request",
                    ));
                };
                parts.push(json!({
                    "inline_data": {
                        "mime_type": file.content_type.as_deref().unwrap_or("image/png"),
                        "data": data,
                    }
                }));
            } else if let Some(request) = &content.tool_call_request {
                parts.push(json!({
                    "functionCall": {
                        "name": internal_tool_name_to_native(&request.tool_name),
                        "args": request.tool_input,
                    }
                }));
            } else if let Some(result) = &content.tool_call_result {
                parts.push(json!({
                    "functionResponse": {
                        "name": result
                            .tool_name
                            .as_deref()
                            .map(internal_tool_name_to_native)
                            .unwrap_or_default(),
                        "response": {"result": result.result},
                    }
                }));
            }
        }
        Ok(parts)
    }
}

impl Provider for GeminiProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Gemini
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

        let mut contents = Vec::new();
        for message in rest {
            let role = match message.role {
                MessageRole::Assistant => "model",
                _ => "user",
            };
            let parts = Self::parts(message)?;
            if !parts.is_empty() {
                contents.push(json!({"role": role, "parts": parts}));
            }
        }

        let thinking_budget = options.final_reasoning_budget(&model);
        let mut generation_config = Map::new();
        generation_config.insert(
            "maxOutputTokens".to_string(),
            json!(effective_max_tokens(&model, options.max_tokens, thinking_budget)),
        );
        if let Some(t) = options.temperature {
            generation_config.insert("temperature".to_string(), json!(t));
        }
        if let Some(p) = options.top_p {
            generation_config.insert("topP".to_string(), json!(p));
        }
        if let Some(budget) = thinking_budget {
            generation_config.insert(
                "thinkingConfig".to_string(),
                json!({"thinkingBudget": budget, "includeThoughts": true}),
            );
        }
        if let Some(schema) = &options.output_schema {
            generation_config.insert("responseMimeType".to_string(), json!("application/json"));
            generation_config.insert("responseSchema".to_string(), schema.clone());
        }

        let mut body = Map::new();
        if let Some(system) = system {
            body.insert(
                "systemInstruction".to_string(),
                json!({"parts": [{"text": system}]}),
            );
        }
        body.insert("contents".to_string(), json!(contents));
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );

        if !options.enabled_tools.is_empty() {
            let declarations: Vec<Value> = options
                .enabled_tools
                .iter()
                .map(|t| {
                    json!({
                        "name": internal_tool_name_to_native(&t.name),
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect();
            body.insert(
                "tools".to_string(),
                json!([{"functionDeclarations": declarations}]),
            );
            if let Some(choice) = &options.tool_choice {
                let mode = match choice {
                    ToolChoice::Auto => json!({"mode": "AUTO"}),
                    ToolChoice::None => json!({"mode": "NONE"}),
                    ToolChoice::Required => json!({"mode": "ANY"}),
                    ToolChoice::Function { name } => json!({
                        "mode": "ANY",
                        "allowedFunctionNames": [internal_tool_name_to_native(name)],
                    }),
                };
                body.insert(
                    "toolConfig".to_string(),
                    json!({"functionCallingConfig": mode}),
                );
            }
        }
        Ok(Value::Object(body))
    }

    fn request_url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.config.url, model
            )
        } else {
            format!("{}/models/{}:generateContent", self.config.url, model)
        }
    }

    fn request_headers(&self, _model: &str) -> Result<Vec<(String, String)>, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::new(
                ProviderErrorKind::InvalidProviderConfig,
                "Gemini API key is not configured",
            ));
        }
        Ok(vec![(
            "x-goog-api-key".to_string(),
            self.config.api_key.clone(),
        )])
    }

    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError> {
        let response: WireResponse = serde_json::from_slice(body).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                format!("Failed to parse Gemini response: {e}"),
            )
            .with_raw(String::from_utf8_lossy(body).to_string())
        })?;

        let Some(candidate) = response.candidates.into_iter().next() else {
            return Err(ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                "No candidates in Gemini response",
            ));
        };

        match candidate.finish_reason.as_deref() {
            Some("MAX_TOKENS") => {
                return Err(ProviderError::new(
                    ProviderErrorKind::MaxTokensExceeded,
                    "Model returned a MAX_TOKENS finish reason",
                ));
            }
            Some("RECITATION") => {
                return Err(ProviderError::new(
                    ProviderErrorKind::FailedGeneration,
                    "Model returned a RECITATION finish reason",
                ));
            }
            Some("SAFETY") | Some("PROHIBITED_CONTENT") => {
                return Err(ProviderError::new(
                    ProviderErrorKind::ContentModeration,
                    "Model blocked the response for safety reasons",
                ));
            }
            Some("MALFORMED_FUNCTION_CALL") => {
                return Err(ProviderError::new(
                    ProviderErrorKind::InvalidGeneration,
                    "Model returned a malformed function call",
                )
                .with_capture());
            }
            _ => {}
        }

        let mut text = String::new();
        let mut reasoning_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for (i, part) in parts.into_iter().enumerate() {
            if let Some(t) = part.text {
                if part.thought == Some(true) {
                    reasoning_parts.push(t);
                } else {
                    text.push_str(&t);
                }
            } else if let Some(call) = part.function_call {
                tool_calls.push(ToolCallRequest {
                    index: Some(i),
                    id: format!("{}_{i}", call.name),
                    tool_name: native_tool_name_to_internal(&call.name),
                    tool_input: call.args.unwrap_or(json!({})),
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
            usage: response
                .usage_metadata
                .map(|u| u.to_domain())
                .unwrap_or_default(),
        })
    }

    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError> {
        // Stream chunks share the unary shape
        let response: WireResponse = serde_json::from_str(event).map_err(|e| {
            ProviderError::new(
                ProviderErrorKind::ProviderInternal,
                format!("Failed to parse Gemini stream chunk: {e}"),
            )
            .with_raw(event.to_string())
        })?;

        let mut parsed = ParsedResponse {
            usage: response.usage_metadata.map(|u| u.to_domain()),
            ..Default::default()
        };

        let Some(candidate) = response.candidates.into_iter().next() else {
            return Ok(parsed);
        };

        for (i, part) in candidate
            .content
            .map(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .enumerate()
        {
            if let Some(t) = part.text {
                if part.thought == Some(true) {
                    parsed.reasoning = Some(t);
                } else {
                    parsed.delta = Some(match parsed.delta.take() {
                        Some(existing) => existing + &t,
                        None => t,
                    });
                }
            } else if let Some(call) = part.function_call {
                parsed.tool_call_requests.push(ToolCallRequestDelta {
                    idx: None,
                    id: Some(format!("{}_{i}", call.name)),
                    tool_name: Some(native_tool_name_to_internal(&call.name)),
                    arguments: call.args.map(|a| a.to_string()).unwrap_or_default(),
                });
            }
        }

        parsed.finish_reason = candidate.finish_reason.as_deref().and_then(|r| match r {
            "STOP" => Some(FinishReason::Stop),
            "MAX_TOKENS" => Some(FinishReason::MaxContext),
            "RECITATION" => Some(FinishReason::Recitation),
            "MALFORMED_FUNCTION_CALL" => Some(FinishReason::MalformedFunctionCall),
            "SAFETY" | "PROHIBITED_CONTENT" => Some(FinishReason::ContentFilter),
            _ => None,
        });
        Ok(parsed)
    }

    fn requires_downloading_file(&self, _file: &File, _model: &str) -> bool {
        // The API wants inline data unless files are pre-uploaded
        true
    }

    fn default_model(&self) -> &'static str {
        "gemini-2.5-flash"
    }

    fn compute_prompt_token_count(
        &self,
        messages: &[Message],
        _model: &str,
    ) -> Result<f64, ProviderError> {
        Ok(estimate_prompt_tokens(messages))
    }

    fn map_error(&self, status: u16, body: &str) -> ProviderError {
        let message = serde_json::from_str::<WireErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .map(|e| e.message)
            .unwrap_or_else(|| body.to_string());
        ERROR_TABLE.classify(status, &message)
    }
}

// ---------------------------------------------------------------------------
// Wire models

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: Option<f64>,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: Option<f64>,
    #[serde(default, rename = "thoughtsTokenCount")]
    thoughts_token_count: Option<f64>,
    #[serde(default, rename = "cachedContentTokenCount")]
    cached_content_token_count: Option<f64>,
}

impl WireUsageMetadata {
    fn to_domain(&self) -> LLMUsage {
        LLMUsage {
            prompt_token_count: self.prompt_token_count,
            prompt_token_count_cached: self.cached_content_token_count,
            completion_token_count: self.candidates_token_count,
            completion_reasoning_token_count: self.thoughts_token_count,
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<WireUsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    error: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> GeminiProvider {
        GeminiProvider::new(GeminiConfig {
            api_key: "gm-test".to_string(),
            url: DEFAULT_URL.to_string(),
        })
    }

    #[test]
    fn test_request_urls() {
        let p = provider();
        assert!(p
            .request_url("gemini-2.5-flash", false)
            .ends_with("models/gemini-2.5-flash:generateContent"));
        assert!(p
            .request_url("gemini-2.5-flash", true)
            .ends_with("models/gemini-2.5-flash:streamGenerateContent?alt=sse"));
    }

    #[test]
    fn test_system_instruction_and_model_role() {
        let messages = vec![
            Message::with_text(MessageRole::System, "Be brief."),
            Message::with_text(MessageRole::User, "Hi"),
            Message::with_text(MessageRole::Assistant, "Hello"),
        ];
        let options = ProviderOptions {
            model: "gemini-2.5-flash".to_string(),
            ..Default::default()
        };
        let body = provider().build_request(&messages, &options, false).unwrap();
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be brief.");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn test_parse_response_with_thoughts() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Consider the capital.", "thought": true},
                    {"text": "Paris"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 8, "candidatesTokenCount": 2, "thoughtsTokenCount": 5}
        });
        let parsed = provider().parse_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(parsed.text, "Paris");
        assert_eq!(parsed.reasoning.as_deref(), Some("Consider the capital."));
        assert_eq!(parsed.usage.completion_reasoning_token_count, Some(5.0));
    }

    #[test]
    fn test_malformed_function_call_finish_reason() {
        let chunk = provider()
            .parse_stream_delta(r#"{"candidates":[{"finishReason":"MALFORMED_FUNCTION_CALL"}]}"#)
            .unwrap();
        assert_eq!(chunk.finish_reason, Some(FinishReason::MalformedFunctionCall));
    }

    #[test]
    fn test_recitation_finish_reason() {
        let chunk = provider()
            .parse_stream_delta(r#"{"candidates":[{"finishReason":"RECITATION"}]}"#)
            .unwrap();
        assert_eq!(chunk.finish_reason, Some(FinishReason::Recitation));
    }
}
