//! Streaming aggregation
//!
//! `StreamingContext` folds the heterogeneous chunks adapters emit (text
//! deltas, reasoning deltas, tool-call fragments, usage, finish reasons)
//! into one ordered output and a final completion payload. Chunks arrive in
//! provider order and are re-emitted to the caller in the same order.

use crate::domain::tool_call::ToolCallRequest;
use crate::domain::usage::LLMUsage;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::openai_compat::parse_tool_arguments;
use crate::providers::{FinishReason, ParsedResponse, ToolCallRequestDelta};

/// The assembled result of one provider call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunnerOutput {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// One chunk relayed to the HTTP client while streaming. The final chunk is
/// the only one carrying `final_output`.
#[derive(Clone, Debug, Default)]
pub struct RunnerOutputChunk {
    pub tool_call_requests: Vec<ToolCallRequestDelta>,
    pub reasoning: Option<String>,
    pub delta: Option<String>,
    pub final_output: Option<RunnerOutput>,
}

/// Accumulator handed back to error paths so failures still carry usage
#[derive(Clone, Debug, Default)]
pub struct RawCompletion {
    pub usage: LLMUsage,
    pub finish_reason: Option<FinishReason>,
}

/// Buffer for one in-flight tool call assembled from deltas
#[derive(Clone, Debug)]
struct ToolCallBuffer {
    id: Option<String>,
    idx: usize,
    tool_name: Option<String>,
    arguments: Vec<String>,
}

impl ToolCallBuffer {
    fn from_delta(delta: &ToolCallRequestDelta, default_idx: usize) -> Self {
        Self {
            id: delta.id.clone(),
            idx: delta.idx.unwrap_or(default_idx),
            tool_name: delta.tool_name.clone(),
            arguments: vec![delta.arguments.clone()],
        }
    }

    /// Matching precedence: idx, then id, then tool name, else accept
    fn should_handle_delta(&self, delta: &ToolCallRequestDelta) -> bool {
        if let Some(idx) = delta.idx {
            return idx == self.idx;
        }
        if let Some(id) = &delta.id {
            return Some(id) == self.id.as_ref();
        }
        if let Some(name) = &delta.tool_name {
            return Some(name) == self.tool_name.as_ref();
        }
        true
    }

    fn add_delta(&mut self, delta: &ToolCallRequestDelta) {
        self.arguments.push(delta.arguments.clone());
    }

    fn into_tool_call(self) -> Result<ToolCallRequest, ProviderError> {
        let raw = self.arguments.concat();
        Ok(ToolCallRequest {
            index: Some(self.idx),
            id: self.id.unwrap_or_default(),
            tool_name: self.tool_name.unwrap_or_default(),
            tool_input: parse_tool_arguments(&raw)?,
        })
    }
}

/// Folds provider chunks into the final output
#[derive(Default)]
pub struct StreamingContext {
    raw: RawCompletion,
    buffers: Vec<ToolCallBuffer>,
    agg_output: Vec<String>,
    agg_reasoning: Vec<String>,
    usage: LLMUsage,
    final_output: Option<RunnerOutput>,
}

impl StreamingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(&self) -> &LLMUsage {
        &self.usage
    }

    /// Everything streamed so far
    pub fn aggregated_output(&self) -> String {
        self.agg_output.concat()
    }

    pub fn final_output(&self) -> Option<&RunnerOutput> {
        self.final_output.as_ref()
    }

    pub fn raw_completion(&self) -> &RawCompletion {
        &self.raw
    }

    fn add_tool_call_delta(&mut self, delta: &ToolCallRequestDelta) {
        for buffer in self.buffers.iter_mut().rev() {
            if buffer.should_handle_delta(delta) {
                buffer.add_delta(delta);
                return;
            }
        }
        self.buffers
            .push(ToolCallBuffer::from_delta(delta, self.buffers.len()));
    }

    /// Fold one chunk. Returns the chunk to relay to the caller, or the
    /// error implied by a terminal finish reason.
    pub fn add_chunk(&mut self, chunk: ParsedResponse) -> Result<RunnerOutputChunk, ProviderError> {
        for delta in &chunk.tool_call_requests {
            self.add_tool_call_delta(delta);
        }
        if let Some(reasoning) = &chunk.reasoning {
            self.agg_reasoning.push(reasoning.clone());
        }
        if let Some(delta) = &chunk.delta {
            self.agg_output.push(delta.clone());
        }
        if let Some(usage) = &chunk.usage {
            self.usage.apply(usage);
        }
        if let Some(reason) = chunk.finish_reason {
            self.raise_for_finish_reason(reason)?;
        }

        Ok(RunnerOutputChunk {
            tool_call_requests: chunk.tool_call_requests,
            reasoning: chunk.reasoning,
            delta: chunk.delta,
            final_output: None,
        })
    }

    fn raise_for_finish_reason(&mut self, reason: FinishReason) -> Result<(), ProviderError> {
        self.raw.usage = self.usage.clone();
        self.raw.finish_reason = Some(reason);
        match reason {
            FinishReason::MaxContext => Err(ProviderError::new(
                ProviderErrorKind::MaxTokensExceeded,
                "Model returned a response with a length finish reason, meaning the maximum number of tokens was exceeded",
            )
            .with_raw(self.aggregated_output())),
            FinishReason::MalformedFunctionCall => Err(ProviderError::new(
                ProviderErrorKind::InvalidGeneration,
                "Model returned a malformed function call finish reason",
            )
            .with_capture()),
            FinishReason::Recitation => Err(ProviderError::new(
                ProviderErrorKind::FailedGeneration,
                "Model returned a response with a recitation finish reason",
            )
            .with_raw(self.aggregated_output())),
            FinishReason::ContentFilter => Err(ProviderError::new(
                ProviderErrorKind::ContentModeration,
                "Model refused to generate a response",
            )),
            FinishReason::Stop | FinishReason::Length | FinishReason::ToolCalls => Ok(()),
        }
    }

    /// Assemble the final output. Every open tool-call buffer must hold
    /// JSON-parsable arguments; anything else is an invalid generation.
    pub fn complete(
        &mut self,
        builder: impl FnOnce(String, Option<String>, Vec<ToolCallRequest>) -> RunnerOutput,
    ) -> Result<RunnerOutputChunk, ProviderError> {
        let tool_calls: Vec<ToolCallRequest> = std::mem::take(&mut self.buffers)
            .into_iter()
            .map(ToolCallBuffer::into_tool_call)
            .collect::<Result<_, _>>()?;

        let reasoning = if self.agg_reasoning.is_empty() {
            None
        } else {
            Some(self.agg_reasoning.concat())
        };
        let output = builder(self.aggregated_output(), reasoning, tool_calls);
        self.final_output = Some(output.clone());

        Ok(RunnerOutputChunk {
            tool_call_requests: Vec::new(),
            reasoning: None,
            delta: None,
            final_output: Some(output),
        })
    }
}

// ---------------------------------------------------------------------------
// Inline think-tag filtering

#[derive(Debug, PartialEq)]
enum ThinkState {
    /// Start of stream: an opening tag may still arrive
    Detecting,
    InThink,
    Passthrough,
}

/// Wraps a `StreamingContext` for models that emit reasoning inline as
/// `<think>...</think>`. The opening tag is only honored at the very start
/// of the stream; both tags may be split across chunk boundaries, and text
/// following the closing tag in the same chunk is preserved.
pub struct ThinkTagStreamingContext {
    inner: StreamingContext,
    state: ThinkState,
    carry: String,
}

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

impl Default for ThinkTagStreamingContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkTagStreamingContext {
    pub fn new() -> Self {
        Self {
            inner: StreamingContext::new(),
            state: ThinkState::Detecting,
            carry: String::new(),
        }
    }

    pub fn inner(&self) -> &StreamingContext {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut StreamingContext {
        &mut self.inner
    }

    /// Split an incoming text delta into (reasoning, text) per the state
    /// machine
    fn route_delta(&mut self, delta: &str) -> (Option<String>, Option<String>) {
        self.carry.push_str(delta);
        let mut reasoning = String::new();
        let mut text = String::new();

        loop {
            match self.state {
                ThinkState::Detecting => {
                    let trimmed = self.carry.trim_start();
                    if trimmed.is_empty() {
                        return (None, None);
                    }
                    if OPEN_TAG.starts_with(trimmed) {
                        // Could still become an opening tag; wait for more
                        return (none_if_empty(reasoning), none_if_empty(text));
                    }
                    if let Some(rest) = trimmed.strip_prefix(OPEN_TAG) {
                        self.carry = rest.to_string();
                        self.state = ThinkState::InThink;
                        continue;
                    }
                    // Not a think stream; everything is plain text
                    text.push_str(&std::mem::take(&mut self.carry));
                    self.state = ThinkState::Passthrough;
                    return (none_if_empty(reasoning), none_if_empty(text));
                }
                ThinkState::InThink => {
                    if let Some(pos) = self.carry.find(CLOSE_TAG) {
                        reasoning.push_str(&self.carry[..pos]);
                        self.carry = self.carry[pos + CLOSE_TAG.len()..].to_string();
                        self.state = ThinkState::Passthrough;
                        continue;
                    }
                    // Hold back a potential partial closing tag
                    let safe = self.carry.len().saturating_sub(CLOSE_TAG.len() - 1);
                    let split = floor_char_boundary(&self.carry, safe);
                    reasoning.push_str(&self.carry[..split]);
                    self.carry = self.carry[split..].to_string();
                    return (none_if_empty(reasoning), none_if_empty(text));
                }
                ThinkState::Passthrough => {
                    text.push_str(&std::mem::take(&mut self.carry));
                    return (none_if_empty(reasoning), none_if_empty(text));
                }
            }
        }
    }

    pub fn add_chunk(&mut self, chunk: ParsedResponse) -> Result<RunnerOutputChunk, ProviderError> {
        let mut routed = chunk;
        if let Some(delta) = routed.delta.take() {
            let (reasoning, text) = self.route_delta(&delta);
            routed.delta = text;
            if let Some(reasoning) = reasoning {
                routed.reasoning = Some(match routed.reasoning.take() {
                    Some(existing) => existing + &reasoning,
                    None => reasoning,
                });
            }
        }
        self.inner.add_chunk(routed)
    }

    pub fn complete(
        &mut self,
        builder: impl FnOnce(String, Option<String>, Vec<ToolCallRequest>) -> RunnerOutput,
    ) -> Result<RunnerOutputChunk, ProviderError> {
        // Whatever is still carried belongs to the active buffer
        if !self.carry.is_empty() {
            let leftover = std::mem::take(&mut self.carry);
            let chunk = match self.state {
                ThinkState::InThink => ParsedResponse {
                    reasoning: Some(leftover),
                    ..Default::default()
                },
                _ => ParsedResponse {
                    delta: Some(leftover),
                    ..Default::default()
                },
            };
            self.inner.add_chunk(chunk)?;
        }
        self.inner.complete(builder)
    }
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
