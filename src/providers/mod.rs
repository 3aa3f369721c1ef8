//! Provider abstraction
//!
//! Each upstream (OpenAI, Anthropic, Bedrock, Gemini, Groq, XAI, Mistral,
//! Fireworks, Azure) implements the `Provider` capability interface: request
//! construction, response and stream-delta parsing, error taxonomy mapping
//! and token accounting. Shared helpers (SSE framing, error-pattern
//! matching, hosted tool naming, reasoning-budget arithmetic) live here.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod factory;
pub mod fireworks;
pub mod gemini;
pub mod groq;
pub mod mistral;
pub mod openai;
pub mod openai_compat;
pub mod xai;

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::domain::models::{ModelData, ProviderId};
use crate::domain::tool_call::{ToolCallRequest, ToolChoice, ToolDefinition};
use crate::domain::usage::LLMUsage;
use crate::domain::version::ReasoningEffort;
use crate::domain::File;
use crate::domain::Message;
use crate::error::{ProviderError, ProviderErrorKind};

pub use factory::ProviderFactory;

/// Options resolved from a version for one provider call
#[derive(Clone, Debug, Default)]
pub struct ProviderOptions {
    pub model: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub max_tokens: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub tool_choice: Option<ToolChoice>,
    pub enabled_tools: Vec<ToolDefinition>,
    pub output_schema: Option<Value>,
    pub use_structured_generation: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub reasoning_budget: Option<u32>,
    pub parallel_tool_calls: Option<bool>,
}

impl ProviderOptions {
    /// The reasoning budget actually sent upstream. An explicit budget wins;
    /// an effort level maps to a budget sized against the model's output cap.
    pub fn final_reasoning_budget(&self, model: &ModelData) -> Option<u32> {
        if !model.reasoning {
            return None;
        }
        if let Some(budget) = self.reasoning_budget {
            return Some(budget);
        }
        let cap = model.max_output_tokens;
        match self.reasoning_effort {
            Some(ReasoningEffort::Disabled) | None => None,
            Some(ReasoningEffort::Low) => Some((cap / 8).min(1024)),
            Some(ReasoningEffort::Medium) => Some((cap / 4).min(8192)),
            Some(ReasoningEffort::High) => Some((cap / 2).min(24_576)),
        }
    }
}

/// Max-tokens arithmetic shared by adapters: the reasoning budget rides on
/// top of the requested output, capped by the model
pub fn effective_max_tokens(
    model: &ModelData,
    requested: Option<u32>,
    reasoning_budget: Option<u32>,
) -> u32 {
    const DEFAULT_OUTPUT_TOKENS: u32 = 8192;
    let requested = requested.unwrap_or(DEFAULT_OUTPUT_TOKENS);
    let total = requested.saturating_add(reasoning_budget.unwrap_or(0));
    total.min(model.max_output_tokens)
}

/// Why a provider stopped producing output
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Length cap hit without exceeding the context window
    Length,
    MaxContext,
    ToolCalls,
    MalformedFunctionCall,
    Recitation,
    ContentFilter,
}

/// One fragment of a tool call emitted while streaming
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallRequestDelta {
    pub idx: Option<usize>,
    pub id: Option<String>,
    pub tool_name: Option<String>,
    pub arguments: String,
}

/// The unified chunk model every adapter parses stream events into
#[derive(Clone, Debug, Default)]
pub struct ParsedResponse {
    pub tool_call_requests: Vec<ToolCallRequestDelta>,
    pub reasoning: Option<String>,
    pub delta: Option<String>,
    pub usage: Option<LLMUsage>,
    pub finish_reason: Option<FinishReason>,
}

/// A fully parsed unary response
#[derive(Clone, Debug, Default)]
pub struct ProviderResponse {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: LLMUsage,
}

/// The capability interface each upstream adapter implements
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn id(&self) -> ProviderId;

    /// Build the provider-specific request body
    fn build_request(
        &self,
        messages: &[Message],
        options: &ProviderOptions,
        stream: bool,
    ) -> Result<Value, ProviderError>;

    fn request_url(&self, model: &str, stream: bool) -> String;

    fn request_headers(&self, model: &str) -> Result<Vec<(String, String)>, ProviderError>;

    /// Parse a unary response body
    fn parse_response(&self, body: &[u8]) -> Result<ProviderResponse, ProviderError>;

    /// Parse one SSE event payload
    fn parse_stream_delta(&self, event: &str) -> Result<ParsedResponse, ProviderError>;

    fn supports_model(&self, model: &str) -> bool {
        crate::domain::models::model_data(model)
            .map(|d| d.providers.contains(&self.id()))
            .unwrap_or(false)
    }

    /// Whether the runner must materialize bytes before `build_request`
    fn requires_downloading_file(&self, file: &File, model: &str) -> bool;

    /// Providers that cannot stream certain modes return false here and the
    /// runner falls back to a unary call
    fn is_streamable(&self, _model: &str, _has_tools: bool) -> bool {
        true
    }

    fn default_model(&self) -> &'static str;

    /// Cap on the number of file URLs passed through without materializing
    fn max_number_of_file_urls(&self) -> Option<usize> {
        None
    }

    fn sanitize_model_data(&self, _data: &mut ModelData) {}

    /// Count prompt tokens without calling the provider. Not every provider
    /// can; `UnpriceableRun`-style errors surface as internal.
    fn compute_prompt_token_count(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<f64, ProviderError>;

    /// Map an upstream HTTP error to the provider-agnostic taxonomy
    fn map_error(&self, status: u16, body: &str) -> ProviderError;

    /// Record advertised rate-limit quota; never surfaced to callers
    fn observe_rate_limits(&self, _headers: &reqwest::header::HeaderMap) {}

    /// Whether the stream wrapper should skip `event:` lines (Anthropic-style
    /// named events) instead of flagging them
    fn sse_skips_event_lines(&self) -> bool {
        false
    }

    /// Whether stream output may carry inline `<think>` spans that must be
    /// diverted into the reasoning buffer
    fn uses_inline_think_tags(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// SSE framing

/// Incremental SSE framing over raw byte chunks. Chunk boundaries may split
/// lines and JSON tokens arbitrarily; payloads are only emitted on complete
/// lines.
pub struct SseParser {
    buffer: String,
    skip_event_lines: bool,
    done: bool,
}

impl SseParser {
    pub fn new(skip_event_lines: bool) -> Self {
        Self {
            buffer: String::new(),
            skip_event_lines,
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed raw bytes, returning any complete event payloads
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line = self.buffer[..newline].trim_end_matches('\r').to_string();
            self.buffer.drain(..=newline);

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with(':') {
                continue;
            }
            if let Some(payload) = trimmed.strip_prefix("data:") {
                let payload = payload.trim_start();
                if payload == "[DONE]" {
                    self.done = true;
                    continue;
                }
                payloads.push(payload.to_string());
            } else if trimmed.starts_with("event:") {
                if !self.skip_event_lines {
                    tracing::debug!(line = %trimmed, "ignoring SSE event line");
                }
            } else {
                tracing::debug!(line = %trimmed, "unexpected line in SSE stream");
            }
        }
        payloads
    }
}

// ---------------------------------------------------------------------------
// Error matching

/// Ordered regex table mapping upstream error strings to taxonomy kinds
pub struct ErrorTable {
    patterns: Vec<(Regex, ProviderErrorKind)>,
}

impl ErrorTable {
    pub fn new(patterns: &[(&str, ProviderErrorKind)]) -> Self {
        Self {
            patterns: patterns
                .iter()
                .map(|(p, kind)| (Regex::new(p).expect("invalid error pattern"), *kind))
                .collect(),
        }
    }

    /// Classify an upstream error. The first matching pattern wins, then the
    /// HTTP status decides, and anything left is `Unknown` with the raw
    /// message preserved.
    pub fn classify(&self, status: u16, message: &str) -> ProviderError {
        for (pattern, kind) in &self.patterns {
            if pattern.is_match(message) {
                return ProviderError::new(*kind, message.to_string()).with_raw(message);
            }
        }
        let kind = match status {
            429 => ProviderErrorKind::RateLimited,
            401 | 403 => ProviderErrorKind::InvalidProviderConfig,
            404 => ProviderErrorKind::MissingModel,
            400..=499 => ProviderErrorKind::ProviderBadRequest,
            500..=599 => ProviderErrorKind::ProviderInternal,
            _ => ProviderErrorKind::Unknown,
        };
        ProviderError::new(kind, message.to_string()).with_raw(message)
    }
}

/// Parse a `Retry-After` header value (seconds form only)
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

// ---------------------------------------------------------------------------
// Hosted tool naming

/// Hosted tools are addressed internally with an `@`-prefixed name; providers
/// see a native identifier. The map is bidirectional.
static HOSTED_TOOL_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("@search-documentation", "search_documentation"),
        ("@fetch-url", "fetch_url"),
        ("@current-datetime", "current_datetime"),
    ])
});

static NATIVE_TOOL_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HOSTED_TOOL_NAMES.iter().map(|(k, v)| (*v, *k)).collect()
});

pub fn internal_tool_name_to_native(name: &str) -> String {
    HOSTED_TOOL_NAMES
        .get(name)
        .map(|native| native.to_string())
        .unwrap_or_else(|| name.to_string())
}

pub fn native_tool_name_to_internal(name: &str) -> String {
    NATIVE_TOOL_NAMES
        .get(name)
        .map(|internal| internal.to_string())
        .unwrap_or_else(|| name.to_string())
}
