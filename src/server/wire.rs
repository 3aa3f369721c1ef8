//! OpenAI chat-completions wire compatibility
//!
//! Request models stay permissive: unknown fields are tolerated and
//! contents accept both string and part-list forms, so upstream schema
//! drift never rejects a call outright. Extension fields (`input`,
//! `provider`, `use_cache`, ...) ride alongside the standard schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::agent::AgentInput;
use crate::domain::completion::AgentCompletion;
use crate::domain::file::File;
use crate::domain::message::{Message, MessageContent, MessageRole};
use crate::domain::models::ProviderId;
use crate::domain::tool_call::{ToolCallRequest, ToolCallResult, ToolChoice, ToolDefinition};
use crate::domain::version::{ReasoningEffort, Version};
use crate::error::ApiError;
use crate::runner::{CacheUsage, FallbackOption};
use crate::templates::{extract_variable_schema, TemplateManager};

// ---------------------------------------------------------------------------
// Request

#[derive(Clone, Debug, Deserialize)]
pub struct WireImageUrl {
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireAudioInput {
    pub data: String,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireFilePart {
    pub file_data: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image_url: Option<WireImageUrl>,
    #[serde(default)]
    pub input_audio: Option<WireAudioInput>,
    #[serde(default)]
    pub file: Option<WireFilePart>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    pub function: WireFunctionCall,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireRequestMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<WireContent>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireToolFunction {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub strict: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireTool {
    pub function: WireToolFunction,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireJsonSchema {
    #[serde(default)]
    pub name: Option<String>,
    pub schema: Value,
    #[serde(default)]
    pub strict: Option<bool>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub json_schema: Option<WireJsonSchema>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct WireReasoning {
    #[serde(default)]
    pub effort: Option<String>,
    #[serde(default)]
    pub budget: Option<u32>,
}

/// The chat-completions body plus gateway extension fields
#[derive(Clone, Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<WireRequestMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub tools: Option<Vec<WireTool>>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default)]
    pub response_format: Option<WireResponseFormat>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, Value>>,

    // Extension fields
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub use_cache: Option<CacheUsage>,
    #[serde(default)]
    pub use_fallback: Option<FallbackOption>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub deployment_id: Option<String>,
    #[serde(default)]
    pub reasoning: Option<WireReasoning>,
}

fn parse_role(role: &str) -> Result<MessageRole, ApiError> {
    match role {
        "system" | "developer" => Ok(MessageRole::System),
        "user" | "tool" | "function" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        other => Err(ApiError::bad_request(format!("Unknown message role '{other}'"))),
    }
}

fn content_part_to_domain(part: &WireContentPart) -> Result<Option<MessageContent>, ApiError> {
    match part.kind.as_str() {
        "text" => Ok(part.text.clone().map(MessageContent::text)),
        "image_url" => {
            let image = part
                .image_url
                .as_ref()
                .ok_or_else(|| ApiError::bad_request("image_url part without image_url"))?;
            Ok(Some(MessageContent::file(File::from_url(&image.url))))
        }
        "input_audio" => {
            let audio = part
                .input_audio
                .as_ref()
                .ok_or_else(|| ApiError::bad_request("input_audio part without input_audio"))?;
            Ok(Some(MessageContent::file(File {
                data: Some(audio.data.clone()),
                content_type: audio.format.as_deref().map(|f| match f {
                    "wav" => "audio/wav".to_string(),
                    "mp3" => "audio/mpeg".to_string(),
                    other => format!("audio/{other}"),
                }),
                ..Default::default()
            })))
        }
        "file" => {
            let file = part
                .file
                .as_ref()
                .ok_or_else(|| ApiError::bad_request("file part without file"))?;
            Ok(Some(MessageContent::file(File {
                url: Some(file.file_data.clone()),
                ..Default::default()
            })))
        }
        other => Err(ApiError::bad_request(format!(
            "Unsupported content part type '{other}'"
        ))),
    }
}

/// Convert wire messages into domain messages
pub fn messages_to_domain(messages: &[WireRequestMessage]) -> Result<Vec<Message>, ApiError> {
    let mut domain = Vec::new();
    for message in messages {
        let role = parse_role(&message.role)?;
        let mut content = Vec::new();

        if message.role == "tool" || message.role == "function" {
            let result_text = match &message.content {
                Some(WireContent::Text(text)) => text.clone(),
                Some(WireContent::Parts(parts)) => parts
                    .iter()
                    .filter_map(|p| p.text.clone())
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => String::new(),
            };
            content.push(MessageContent {
                tool_call_result: Some(ToolCallResult {
                    id: message.tool_call_id.clone().unwrap_or_default(),
                    tool_name: message.name.clone(),
                    result: serde_json::from_str(&result_text)
                        .unwrap_or(Value::String(result_text)),
                    error: None,
                }),
                ..Default::default()
            });
        } else {
            match &message.content {
                Some(WireContent::Text(text)) => content.push(MessageContent::text(text)),
                Some(WireContent::Parts(parts)) => {
                    for part in parts {
                        if let Some(domain_part) = content_part_to_domain(part)? {
                            content.push(domain_part);
                        }
                    }
                }
                None => {}
            }
            for call in message.tool_calls.iter().flatten() {
                content.push(MessageContent {
                    tool_call_request: Some(ToolCallRequest {
                        index: None,
                        id: call.id.clone(),
                        tool_name: call.function.name.clone(),
                        tool_input: call
                            .function
                            .arguments
                            .as_deref()
                            .and_then(|raw| serde_json::from_str(raw).ok())
                            .unwrap_or(Value::Object(Default::default())),
                    }),
                    ..Default::default()
                });
            }
        }

        if !content.is_empty() {
            domain.push(Message {
                role,
                content,
                run_id: None,
            });
        }
    }
    Ok(domain)
}

fn tool_choice_to_domain(value: &Value) -> Option<ToolChoice> {
    match value {
        Value::String(word) => match word.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            "required" => Some(ToolChoice::Required),
            _ => None,
        },
        Value::Object(map) => map
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|name| ToolChoice::Function {
                name: name.to_string(),
            }),
        _ => None,
    }
}

fn reasoning_to_domain(
    reasoning: &WireReasoning,
) -> Result<(Option<ReasoningEffort>, Option<u32>), ApiError> {
    if reasoning.effort.is_none() && reasoning.budget.is_none() {
        return Err(ApiError::bad_request(
            "reasoning requires at least an effort or a budget",
        ));
    }
    let effort = match reasoning.effort.as_deref() {
        None => None,
        Some("disabled") => Some(ReasoningEffort::Disabled),
        Some("low") => Some(ReasoningEffort::Low),
        Some("medium") => Some(ReasoningEffort::Medium),
        Some("high") => Some(ReasoningEffort::High),
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "Unknown reasoning effort '{other}'"
            )))
        }
    };
    Ok((effort, reasoning.budget))
}

/// Metadata values are flattened to strings: strings pass through, anything
/// else is JSON-encoded. Deliberately lossy on read-back.
pub fn metadata_to_domain(metadata: Option<&BTreeMap<String, Value>>) -> BTreeMap<String, String> {
    metadata
        .map(|m| {
            m.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Everything the chat endpoint resolves from a request body
#[derive(Debug)]
pub struct ResolvedChatRequest {
    pub agent_id: String,
    pub version: Version,
    pub input: AgentInput,
    pub metadata: BTreeMap<String, String>,
    pub use_cache: CacheUsage,
    pub use_fallback: FallbackOption,
    pub conversation_id: Option<String>,
    pub stream: bool,
    pub deployment_id: Option<String>,
}

impl ChatCompletionRequest {
    /// Split the request into a version (the prompt configuration) and an
    /// input. With `input` variables the messages array is a template and
    /// becomes the version's prompt; without it the messages are the input.
    pub fn resolve(self, templates: &TemplateManager) -> Result<ResolvedChatRequest, ApiError> {
        let messages = messages_to_domain(&self.messages)?;

        let provider = match self.provider.as_deref() {
            None => None,
            Some(raw) => Some(ProviderId::parse(raw).ok_or_else(|| {
                ApiError::bad_request(format!("Unknown provider '{raw}'"))
            })?),
        };

        let tools: Option<Vec<ToolDefinition>> = self.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| ToolDefinition {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                    strict: t.function.strict,
                })
                .collect()
        });
        let enabled_tools = tools
            .as_ref()
            .map(|tools| tools.iter().map(|t| t.name.clone()).collect());

        let (output_schema, use_structured_generation) = match &self.response_format {
            Some(format) if format.kind == "json_schema" => {
                let schema = format
                    .json_schema
                    .as_ref()
                    .ok_or_else(|| ApiError::bad_request("json_schema response_format without schema"))?;
                (
                    Some(schema.schema.clone()),
                    schema.strict.unwrap_or(false),
                )
            }
            Some(format) if format.kind == "json_object" => {
                (Some(serde_json::json!({"type": "object"})), false)
            }
            _ => (None, false),
        };

        let (reasoning_effort, reasoning_budget) = match &self.reasoning {
            Some(reasoning) => reasoning_to_domain(reasoning)?,
            None => (None, None),
        };

        let mut version = Version {
            id: String::new(),
            model: self.model.clone(),
            provider,
            prompt: None,
            temperature: self.temperature,
            top_p: self.top_p,
            max_output_tokens: self.max_tokens.or(self.max_completion_tokens),
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            tool_choice: self.tool_choice.as_ref().and_then(tool_choice_to_domain),
            tools,
            enabled_tools,
            input_variables_schema: None,
            output_schema,
            reasoning_effort,
            reasoning_budget,
            parallel_tool_calls: self.parallel_tool_calls,
            use_structured_generation: if use_structured_generation {
                Some(true)
            } else {
                None
            },
        };

        let input = match &self.input {
            Some(variables) => {
                // Messages are the template; derive the variables schema from
                // every templated text part
                let mut schema: Option<Value> = None;
                for message in &messages {
                    for content in &message.content {
                        if let Some(text) = &content.text {
                            if TemplateManager::is_template(text) {
                                let (merged, _) =
                                    extract_variable_schema(text, schema.as_ref(), None)?;
                                schema = merged;
                            }
                        }
                    }
                }
                version.prompt = Some(messages);
                version.input_variables_schema = schema;
                AgentInput {
                    variables: Some(variables.clone()),
                    ..Default::default()
                }
            }
            None => AgentInput {
                messages: Some(messages),
                ..Default::default()
            },
        };

        // A pinned provider disables fallback
        let use_fallback = if self.provider.is_some() {
            FallbackOption::Never
        } else {
            self.use_fallback.clone().unwrap_or_default()
        };

        Ok(ResolvedChatRequest {
            agent_id: self.agent_id.clone().unwrap_or_else(|| "default".to_string()),
            version,
            input,
            metadata: metadata_to_domain(self.metadata.as_ref()),
            use_cache: self.use_cache.unwrap_or_default(),
            use_fallback,
            conversation_id: self.conversation_id,
            stream: self.stream.unwrap_or(false),
            deployment_id: self.deployment_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Response

#[derive(Clone, Debug, Default, Serialize)]
pub struct WireResponseToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: WireResponseFunction,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WireResponseFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WireResponseMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireResponseToolCall>>,
    /// Structured-output payload parsed from the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Value>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WireChoice {
    pub index: usize,
    pub message: WireResponseMessage,
    pub finish_reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct WireUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<WireChoice>,
    pub usage: WireUsage,
    // Gateway extensions
    pub version_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub url: String,
}

fn usage_from_completion(completion: &AgentCompletion) -> WireUsage {
    let mut usage = WireUsage::default();
    for trace in &completion.traces {
        if let crate::domain::completion::Trace::Llm {
            usage: Some(llm_usage),
            ..
        } = trace
        {
            usage.prompt_tokens += llm_usage.prompt_token_count.unwrap_or(0.0) as u64;
            usage.completion_tokens += llm_usage.completion_token_count.unwrap_or(0.0) as u64
                + llm_usage.completion_reasoning_token_count.unwrap_or(0.0) as u64;
        }
    }
    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    usage
}

/// Project a stored completion onto the OpenAI response shape
pub fn completion_to_response(
    completion: &AgentCompletion,
    api_url: &str,
    parse_structured: bool,
) -> ChatCompletionResponse {
    let output_message = completion
        .agent_output
        .messages
        .as_ref()
        .and_then(|messages| messages.last());

    let mut message = WireResponseMessage {
        role: "assistant",
        ..Default::default()
    };
    let mut finish_reason = "stop";
    if let Some(output) = output_message {
        let text = output.text_content();
        message.reasoning_content = output
            .content
            .iter()
            .find_map(|c| c.reasoning.clone());
        let tool_calls: Vec<WireResponseToolCall> = output
            .tool_call_request_iterator()
            .map(|request| WireResponseToolCall {
                id: request.id.clone(),
                kind: "function",
                function: WireResponseFunction {
                    name: request.tool_name.clone(),
                    arguments: request.tool_input.to_string(),
                },
            })
            .collect();
        if !tool_calls.is_empty() {
            finish_reason = "tool_calls";
            message.tool_calls = Some(tool_calls);
        }
        if parse_structured {
            message.parsed = serde_json::from_str(&text).ok();
        }
        message.content = Some(text);
    }

    ChatCompletionResponse {
        id: completion.id.to_string(),
        object: "chat.completion",
        created: completion.created_at().timestamp(),
        model: completion.version.model.clone(),
        choices: vec![WireChoice {
            index: 0,
            message,
            finish_reason,
            cost_usd: completion.cost_usd,
            duration_seconds: completion.duration_seconds,
        }],
        usage: usage_from_completion(completion),
        version_id: completion.version.id.clone(),
        cost_usd: completion.cost_usd,
        duration_seconds: completion.duration_seconds,
        url: format!("{}/v1/completions/{}", api_url.trim_end_matches('/'), completion.id),
    }
}
