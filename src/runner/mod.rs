//! The per-request completion pipeline
//!
//! `prepare_completion` renders templates and freezes the content-addressed
//! version/input pair; `run` and `stream` execute the provider call with
//! fallback on recoverable errors. Every attempt, success or failure,
//! contributes an `LLMTrace` to the final completion.

pub mod file_handler;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentInput, AgentOutput, OutputError};
use crate::domain::completion::{AgentCompletion, CompletionSource, CompletionStatus, Trace};
use crate::domain::message::{validate_messages, Message, MessageContent, MessageRole};
use crate::domain::models::model_data;
use crate::domain::tool_call::ToolDefinition;
use crate::domain::usage::LLMUsage;
use crate::domain::version::Version;
use crate::error::{ApiError, ErrorCode, ProviderError, ProviderErrorKind};
use crate::providers::{
    parse_retry_after, Provider, ProviderFactory, ProviderOptions, SseParser,
};
use crate::runner::file_handler::FileHandler;
use crate::streaming::{
    RunnerOutput, RunnerOutputChunk, StreamingContext, ThinkTagStreamingContext,
};
use crate::templates::TemplateManager;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(240);
/// Caps the tool-call loop length carried by a conversation
pub const MAX_TOOL_CALL_ITERATIONS: usize = 10;

/// Fallback policy for a completion
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FallbackOption {
    #[default]
    Never,
    Auto,
    /// Explicit ordered list of models to try after the primary
    Models(Vec<String>),
}

impl Serialize for FallbackOption {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FallbackOption::Never => serializer.serialize_str("never"),
            FallbackOption::Auto => serializer.serialize_str("auto"),
            FallbackOption::Models(models) => models.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FallbackOption {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Word(String),
            Models(Vec<String>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Word(word) => match word.as_str() {
                "never" => Ok(FallbackOption::Never),
                "auto" => Ok(FallbackOption::Auto),
                other => Err(serde::de::Error::custom(format!(
                    "invalid fallback option '{other}'"
                ))),
            },
            Raw::Models(models) => Ok(FallbackOption::Models(models)),
        }
    }
}

/// Completion cache policy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheUsage {
    Never,
    #[default]
    Auto,
    Always,
}

/// Everything resolved ahead of the provider call. The completion lands here
/// so the caller can persist it whether the run succeeded or failed.
#[derive(Debug)]
pub struct CompletionBuilder {
    pub completion_id: Uuid,
    pub agent: Agent,
    pub version: Version,
    pub input: AgentInput,
    /// Rendered prompt + input messages as they go to the provider
    pub messages: Vec<Message>,
    pub metadata: BTreeMap<String, String>,
    pub conversation_id: Option<String>,
    pub start_time: Instant,
    pub source: CompletionSource,
    pub stream: bool,
    pub traces: Vec<Trace>,
    pub completion: Option<AgentCompletion>,
}

impl CompletionBuilder {
    fn base_completion(&self, output: AgentOutput, status: CompletionStatus) -> AgentCompletion {
        let cost_usd = {
            let total: f64 = self.traces.iter().filter_map(Trace::cost_usd).sum();
            if total > 0.0 {
                Some(total)
            } else {
                None
            }
        };
        AgentCompletion {
            id: self.completion_id,
            agent: self.agent.clone(),
            agent_input: self.input.clone(),
            agent_output: output,
            messages: self.messages.clone(),
            version: self.version.clone(),
            duration_seconds: Some(self.start_time.elapsed().as_secs_f64()),
            cost_usd,
            traces: self.traces.clone(),
            metadata: self.metadata.clone(),
            source: self.source,
            stream: self.stream,
            from_cache: false,
            status,
            conversation_id: self.conversation_id.clone(),
        }
    }

    fn record_success(&mut self, output: &RunnerOutput) -> AgentCompletion {
        let mut content = Vec::new();
        if let Some(reasoning) = &output.reasoning {
            content.push(MessageContent {
                reasoning: Some(reasoning.clone()),
                ..Default::default()
            });
        }
        if !output.text.is_empty() || output.tool_calls.is_empty() {
            content.push(MessageContent {
                text: Some(output.text.clone()),
                ..Default::default()
            });
        }
        for tool_call in &output.tool_calls {
            content.push(MessageContent {
                tool_call_request: Some(tool_call.clone()),
                ..Default::default()
            });
        }
        let mut agent_output = AgentOutput {
            messages: Some(vec![Message {
                role: MessageRole::Assistant,
                content,
                run_id: Some(self.completion_id.to_string()),
            }]),
            ..Default::default()
        };
        agent_output.reset_id();

        let completion = self.base_completion(agent_output, CompletionStatus::Success);
        self.completion = Some(completion.clone());
        completion
    }

    fn record_failure(&mut self, error: &ApiError) {
        let mut agent_output = AgentOutput {
            error: Some(OutputError {
                message: error.message.clone(),
                code: Some(
                    serde_json::to_value(error.code)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_default(),
                ),
            }),
            ..Default::default()
        };
        agent_output.reset_id();
        self.completion = Some(self.base_completion(agent_output, CompletionStatus::Failure));
    }
}

/// Events yielded by `Runner::stream`
pub enum StreamEvent {
    Chunk(RunnerOutputChunk),
    /// Emitted exactly once, after the final chunk
    Completed(Box<AgentCompletion>),
}

enum RunError {
    /// Local error; never retried on another provider
    Api(ApiError),
    Provider(ProviderError),
}

impl From<ApiError> for RunError {
    fn from(e: ApiError) -> Self {
        RunError::Api(e)
    }
}

impl From<ProviderError> for RunError {
    fn from(e: ProviderError) -> Self {
        RunError::Provider(e)
    }
}

/// Aggregation contexts differ only for inline-think models
enum StreamCtx {
    Plain(StreamingContext),
    Think(ThinkTagStreamingContext),
}

impl StreamCtx {
    fn add_chunk(
        &mut self,
        chunk: crate::providers::ParsedResponse,
    ) -> Result<RunnerOutputChunk, ProviderError> {
        match self {
            StreamCtx::Plain(ctx) => ctx.add_chunk(chunk),
            StreamCtx::Think(ctx) => ctx.add_chunk(chunk),
        }
    }

    fn complete(&mut self) -> Result<RunnerOutput, ProviderError> {
        let builder = |text: String,
                       reasoning: Option<String>,
                       tool_calls: Vec<crate::domain::tool_call::ToolCallRequest>| {
            RunnerOutput {
                text,
                reasoning,
                tool_calls,
            }
        };
        let chunk = match self {
            StreamCtx::Plain(ctx) => ctx.complete(builder)?,
            StreamCtx::Think(ctx) => ctx.complete(builder)?,
        };
        Ok(chunk.final_output.unwrap_or_default())
    }

    fn usage(&self) -> LLMUsage {
        match self {
            StreamCtx::Plain(ctx) => ctx.usage().clone(),
            StreamCtx::Think(ctx) => ctx.inner().usage().clone(),
        }
    }
}

pub struct Runner {
    factory: Arc<ProviderFactory>,
    templates: Arc<TemplateManager>,
    http: reqwest::Client,
    timeout: Duration,
    use_fallback: FallbackOption,
}

impl Runner {
    pub fn new(
        factory: Arc<ProviderFactory>,
        templates: Arc<TemplateManager>,
        http: reqwest::Client,
        timeout: Option<Duration>,
        use_fallback: FallbackOption,
    ) -> Self {
        Self {
            factory,
            templates,
            http,
            timeout: timeout.unwrap_or(DEFAULT_TIMEOUT),
            use_fallback,
        }
    }

    /// Render templates, validate structure and freeze ids. The version
    /// keeps the template form of the prompt; only the outgoing messages are
    /// rendered.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_completion(
        &self,
        agent: Agent,
        mut version: Version,
        mut input: AgentInput,
        completion_id: Uuid,
        metadata: BTreeMap<String, String>,
        conversation_id: Option<String>,
        source: CompletionSource,
        stream: bool,
    ) -> Result<CompletionBuilder, ApiError> {
        let mut messages: Vec<Message> = Vec::new();
        if let Some(prompt) = &version.prompt {
            messages.extend(prompt.iter().cloned());
        }
        if let Some(input_messages) = &input.messages {
            messages.extend(input_messages.iter().cloned());
        }
        validate_messages(&messages)?;

        let tool_results = messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter(|c| c.tool_call_result.is_some())
            .count();
        if tool_results > MAX_TOOL_CALL_ITERATIONS {
            return Err(ApiError::new(
                ErrorCode::InvalidRunProperties,
                format!("Conversation exceeds {MAX_TOOL_CALL_ITERATIONS} tool call iterations"),
            ));
        }

        if let Some(variables) = &input.variables {
            for message in &mut messages {
                for content in &mut message.content {
                    if let Some(text) = &content.text {
                        if TemplateManager::is_template(text) {
                            let (rendered, _) =
                                self.templates.render_template(text, variables)?;
                            content.text = Some(rendered);
                        }
                    }
                }
            }
        }

        version.reset_id();
        input.reset_id();

        Ok(CompletionBuilder {
            completion_id,
            agent,
            version,
            input,
            messages,
            metadata,
            conversation_id,
            start_time: Instant::now(),
            source,
            stream,
            traces: Vec::new(),
            completion: None,
        })
    }

    /// Models to try, in order. A pinned provider disables fallback.
    fn candidates(&self, version: &Version) -> Vec<String> {
        let primary = version.model.clone();
        if version.provider.is_some() {
            return vec![primary];
        }
        let mut candidates = vec![primary.clone()];
        match &self.use_fallback {
            FallbackOption::Never => {}
            FallbackOption::Auto => {
                if let Some(data) = model_data(&primary) {
                    candidates.extend(data.fallback.iter().cloned());
                }
            }
            FallbackOption::Models(models) => candidates.extend(models.iter().cloned()),
        }
        candidates.dedup();
        candidates
    }

    fn provider_options(version: &Version, model: &str) -> ProviderOptions {
        let mut tools: Vec<ToolDefinition> = version.tools.clone().unwrap_or_default();
        if let Some(enabled) = &version.enabled_tools {
            for name in enabled {
                if !tools.iter().any(|t| &t.name == name) {
                    tools.push(ToolDefinition {
                        name: name.clone(),
                        ..Default::default()
                    });
                }
            }
        }
        ProviderOptions {
            model: model.to_string(),
            temperature: version.temperature,
            top_p: version.top_p,
            max_tokens: version.max_output_tokens,
            presence_penalty: version.presence_penalty,
            frequency_penalty: version.frequency_penalty,
            tool_choice: version.tool_choice.clone(),
            enabled_tools: tools,
            output_schema: version.output_schema.clone(),
            use_structured_generation: version.use_structured_generation.unwrap_or(false),
            reasoning_effort: version.reasoning_effort,
            reasoning_budget: version.reasoning_budget,
            parallel_tool_calls: version.parallel_tool_calls,
        }
    }

    fn remaining_budget(&self, builder: &CompletionBuilder) -> Duration {
        self.timeout.saturating_sub(builder.start_time.elapsed())
    }

    fn push_llm_trace(
        builder: &mut CompletionBuilder,
        model: &str,
        provider: &dyn Provider,
        usage: Option<LLMUsage>,
        duration: Duration,
    ) {
        let cost_usd = usage.as_ref().and_then(LLMUsage::total_cost_usd);
        builder.traces.push(Trace::Llm {
            model: model.to_string(),
            provider: provider.id().as_str().to_string(),
            usage,
            duration_seconds: Some(duration.as_secs_f64()),
            cost_usd,
        });
    }

    async fn attempt_unary(
        &self,
        builder: &CompletionBuilder,
        model: &str,
        provider: &dyn Provider,
        budget: Duration,
    ) -> Result<(RunnerOutput, LLMUsage), RunError> {
        let mut messages = builder.messages.clone();
        FileHandler::new(provider, model, &self.http)
            .handle_files_in_messages(&mut messages)
            .await?;

        let options = Self::provider_options(&builder.version, model);
        let body = provider.build_request(&messages, &options, false)?;
        let url = provider.request_url(model, false);
        let headers = provider.request_headers(model)?;

        let mut request = self.http.post(&url).timeout(budget).json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(map_transport_error)?;
        provider.observe_rate_limits(response.headers());
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let bytes = response.bytes().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(provider
                .map_error(status.as_u16(), &String::from_utf8_lossy(&bytes))
                .with_retry_after(retry_after)
                .into());
        }

        let parsed = provider.parse_response(&bytes)?;
        let mut usage = parsed.usage.clone();
        if usage.prompt_token_count.is_none() {
            if let Ok(count) = provider.compute_prompt_token_count(&messages, model) {
                usage.prompt_token_count = Some(count);
            }
        }
        if let Some(data) = model_data(model) {
            usage.compute_cost(&data);
        }
        Ok((
            RunnerOutput {
                text: parsed.text,
                reasoning: parsed.reasoning,
                tool_calls: parsed.tool_calls,
            },
            usage,
        ))
    }

    /// Execute the completion, falling back across models on recoverable
    /// errors until the wall-clock budget is spent
    pub async fn run(&self, builder: &mut CompletionBuilder) -> Result<AgentCompletion, ApiError> {
        let candidates = self.candidates(&builder.version);
        let mut last_error: Option<ApiError> = None;

        for (i, model) in candidates.iter().enumerate() {
            let budget = self.remaining_budget(builder);
            if budget.is_zero() {
                last_error = Some(ApiError::new(
                    ErrorCode::OperationTimeout,
                    "Completion timed out before all fallbacks were attempted",
                ));
                break;
            }
            let pinned = if i == 0 { builder.version.provider } else { None };
            let provider = match self.factory.provider_for_model(model, pinned) {
                Ok(provider) => provider,
                Err(e) => {
                    if i == 0 {
                        builder.record_failure(&e);
                        return Err(e);
                    }
                    last_error = Some(e);
                    continue;
                }
            };

            let attempt_start = Instant::now();
            match self
                .attempt_unary(builder, model, provider.as_ref(), budget)
                .await
            {
                Ok((output, usage)) => {
                    crate::metrics::INFERENCE_SECONDS
                        .with_label_values(&[provider.id().as_str(), model])
                        .observe(attempt_start.elapsed().as_secs_f64());
                    Self::push_llm_trace(
                        builder,
                        model,
                        provider.as_ref(),
                        Some(usage),
                        attempt_start.elapsed(),
                    );
                    return Ok(builder.record_success(&output));
                }
                Err(RunError::Api(e)) => {
                    builder.record_failure(&e);
                    return Err(e);
                }
                Err(RunError::Provider(e)) => {
                    Self::push_llm_trace(
                        builder,
                        model,
                        provider.as_ref(),
                        None,
                        attempt_start.elapsed(),
                    );
                    tracing::warn!(
                        model,
                        provider = provider.id().as_str(),
                        kind = ?e.kind,
                        "provider attempt failed: {}",
                        e.message
                    );
                    let recoverable = e.is_recoverable();
                    last_error = Some(e.into());
                    if !recoverable {
                        break;
                    }
                }
            }
        }

        let error = last_error
            .unwrap_or_else(|| ApiError::internal("Completion failed without a recorded error"));
        builder.record_failure(&error);
        Err(error)
    }

    /// Streaming variant. Fallback applies until the first chunk has been
    /// relayed; afterwards errors surface to the caller as a terminal event.
    pub fn stream(
        self: Arc<Self>,
        mut builder: CompletionBuilder,
    ) -> impl futures::Stream<Item = Result<StreamEvent, ApiError>> {
        async_stream::stream! {
            let candidates = self.candidates(&builder.version);
            let mut last_error: Option<ApiError> = None;
            let mut emitted = false;

            'candidates: for (i, model) in candidates.iter().enumerate() {
                let budget = self.remaining_budget(&builder);
                if budget.is_zero() {
                    last_error = Some(ApiError::new(
                        ErrorCode::OperationTimeout,
                        "Completion timed out before all fallbacks were attempted",
                    ));
                    break;
                }
                let pinned = if i == 0 { builder.version.provider } else { None };
                let provider = match self.factory.provider_for_model(model, pinned) {
                    Ok(provider) => provider,
                    Err(e) => {
                        last_error = Some(e);
                        if i == 0 {
                            break 'candidates;
                        }
                        continue;
                    }
                };

                let mut messages = builder.messages.clone();
                let options = Self::provider_options(&builder.version, model);
                let has_tools = !options.enabled_tools.is_empty();
                let attempt_start = Instant::now();

                // Providers that cannot stream this shape run unary and the
                // whole output is relayed as a single chunk
                if !provider.is_streamable(model, has_tools) {
                    match self.attempt_unary(&builder, model, provider.as_ref(), budget).await {
                        Ok((output, usage)) => {
                            Self::push_llm_trace(&mut builder, model, provider.as_ref(), Some(usage), attempt_start.elapsed());
                            let completion = builder.record_success(&output);
                            yield Ok(StreamEvent::Chunk(RunnerOutputChunk {
                                delta: Some(output.text.clone()),
                                reasoning: output.reasoning.clone(),
                                tool_call_requests: Vec::new(),
                                final_output: Some(output),
                            }));
                            yield Ok(StreamEvent::Completed(Box::new(completion)));
                            return;
                        }
                        Err(RunError::Api(e)) => {
                            last_error = Some(e);
                            break 'candidates;
                        }
                        Err(RunError::Provider(e)) => {
                            Self::push_llm_trace(&mut builder, model, provider.as_ref(), None, attempt_start.elapsed());
                            let recoverable = e.is_recoverable();
                            last_error = Some(e.into());
                            if recoverable { continue 'candidates; }
                            break 'candidates;
                        }
                    }
                }

                if let Err(e) = FileHandler::new(provider.as_ref(), model, &self.http)
                    .handle_files_in_messages(&mut messages)
                    .await
                {
                    last_error = Some(e);
                    break 'candidates;
                }

                let open = async {
                    let body = provider.build_request(&messages, &options, true)?;
                    let url = provider.request_url(model, true);
                    let headers = provider.request_headers(model)?;
                    let mut request = self.http.post(&url).timeout(budget).json(&body);
                    for (name, value) in headers {
                        request = request.header(name, value);
                    }
                    let response = request.send().await.map_err(map_transport_error)?;
                    provider.observe_rate_limits(response.headers());
                    let status = response.status();
                    if !status.is_success() {
                        let retry_after = parse_retry_after(response.headers());
                        let body = response.text().await.unwrap_or_default();
                        return Err(provider
                            .map_error(status.as_u16(), &body)
                            .with_retry_after(retry_after));
                    }
                    Ok(response)
                };

                let response = match open.await {
                    Ok(response) => response,
                    Err(e) => {
                        Self::push_llm_trace(&mut builder, model, provider.as_ref(), None, attempt_start.elapsed());
                        let recoverable = e.is_recoverable();
                        last_error = Some(e.into());
                        if recoverable { continue 'candidates; }
                        break 'candidates;
                    }
                };

                let mut ctx = if provider.uses_inline_think_tags() {
                    StreamCtx::Think(ThinkTagStreamingContext::new())
                } else {
                    StreamCtx::Plain(StreamingContext::new())
                };
                let mut parser = SseParser::new(provider.sse_skips_event_lines());
                let mut byte_stream = response.bytes_stream();
                let mut stream_error: Option<ProviderError> = None;

                'read: while let Some(next) = byte_stream.next().await {
                    let bytes = match next {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            stream_error = Some(map_transport_error(e));
                            break 'read;
                        }
                    };
                    for payload in parser.push(&bytes) {
                        let parsed = match provider.parse_stream_delta(&payload) {
                            Ok(parsed) => parsed,
                            Err(e) => {
                                stream_error = Some(e);
                                break 'read;
                            }
                        };
                        let chunk = match ctx.add_chunk(parsed) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                stream_error = Some(e);
                                break 'read;
                            }
                        };
                        emitted = true;
                        yield Ok(StreamEvent::Chunk(chunk));
                    }
                    if parser.is_done() {
                        break 'read;
                    }
                }

                let usage = {
                    let mut usage = ctx.usage();
                    if let Some(data) = model_data(model) {
                        usage.compute_cost(&data);
                    }
                    usage
                };

                if let Some(e) = stream_error {
                    Self::push_llm_trace(&mut builder, model, provider.as_ref(), Some(usage), attempt_start.elapsed());
                    let recoverable = e.is_recoverable() && !emitted;
                    last_error = Some(e.into());
                    if recoverable { continue 'candidates; }
                    break 'candidates;
                }

                match ctx.complete() {
                    Ok(output) => {
                        crate::metrics::INFERENCE_SECONDS
                            .with_label_values(&[provider.id().as_str(), model])
                            .observe(attempt_start.elapsed().as_secs_f64());
                        Self::push_llm_trace(&mut builder, model, provider.as_ref(), Some(usage), attempt_start.elapsed());
                        let completion = builder.record_success(&output);
                        yield Ok(StreamEvent::Chunk(RunnerOutputChunk {
                            tool_call_requests: Vec::new(),
                            reasoning: None,
                            delta: None,
                            final_output: Some(output),
                        }));
                        yield Ok(StreamEvent::Completed(Box::new(completion)));
                        return;
                    }
                    Err(e) => {
                        Self::push_llm_trace(&mut builder, model, provider.as_ref(), Some(usage), attempt_start.elapsed());
                        let recoverable = e.is_recoverable() && !emitted;
                        last_error = Some(e.into());
                        if recoverable { continue 'candidates; }
                        break 'candidates;
                    }
                }
            }

            let error = last_error
                .unwrap_or_else(|| ApiError::internal("Completion failed without a recorded error"));
            builder.record_failure(&error);
            if let Some(completion) = builder.completion.clone() {
                yield Ok(StreamEvent::Completed(Box::new(completion)));
            }
            yield Err(error);
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> ProviderError {
    let kind = if e.is_timeout() {
        ProviderErrorKind::Timeout
    } else {
        ProviderErrorKind::Connection
    };
    ProviderError::new(kind, format!("Provider request failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::ProviderId;
    use crate::providers::factory::test_support::StaticProvider;
    use serde_json::json;

    fn runner(use_fallback: FallbackOption) -> Runner {
        let mut factory = ProviderFactory::default();
        factory.register(Arc::new(StaticProvider {
            provider_id: ProviderId::Openai,
        }));
        Runner::new(
            Arc::new(factory),
            Arc::new(TemplateManager::new()),
            reqwest::Client::new(),
            None,
            use_fallback,
        )
    }

    fn version(model: &str) -> Version {
        Version {
            model: model.to_string(),
            prompt: Some(vec![Message::with_text(
                MessageRole::System,
                "You are a helpful assistant.",
            )]),
            ..Default::default()
        }
    }

    fn prepare(runner: &Runner, version: Version, input: AgentInput) -> CompletionBuilder {
        runner
            .prepare_completion(
                Agent::new("assistant"),
                version,
                input,
                crate::domain::hashing::uuid7(),
                BTreeMap::new(),
                None,
                CompletionSource::Api,
                false,
            )
            .unwrap()
    }

    #[test]
    fn test_prepare_renders_templates_but_keeps_version_template() {
        let runner = runner(FallbackOption::Never);
        let mut v = version("gpt-4.1");
        v.prompt = Some(vec![Message::with_text(
            MessageRole::User,
            "What is the capital of the country that has {{name}}?",
        )]);
        let input = AgentInput {
            variables: Some(json!({"name": "Toulouse"})),
            ..Default::default()
        };
        let builder = prepare(&runner, v, input);

        assert!(builder.messages[0].text_content().contains("Toulouse"));
        // The stored version keeps the template form
        assert!(builder.version.prompt.as_ref().unwrap()[0]
            .text_content()
            .contains("{{name}}"));
        assert_eq!(builder.version.id.len(), 32);
        assert_eq!(builder.input.id.len(), 32);
    }

    #[test]
    fn test_prepare_appends_input_messages() {
        let runner = runner(FallbackOption::Never);
        let input = AgentInput {
            messages: Some(vec![Message::with_text(MessageRole::User, "Hello")]),
            ..Default::default()
        };
        let builder = prepare(&runner, version("gpt-4.1"), input);
        assert_eq!(builder.messages.len(), 2);
        assert_eq!(builder.messages[1].text_content(), "Hello");
    }

    #[test]
    fn test_prepare_rejects_invalid_content_parts() {
        let runner = runner(FallbackOption::Never);
        let mut v = version("gpt-4.1");
        v.prompt = Some(vec![Message {
            role: MessageRole::User,
            content: vec![MessageContent::default()],
            run_id: None,
        }]);
        let err = runner
            .prepare_completion(
                Agent::new("assistant"),
                v,
                AgentInput::default(),
                crate::domain::hashing::uuid7(),
                BTreeMap::new(),
                None,
                CompletionSource::Api,
                false,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[test]
    fn test_candidates_auto_uses_catalog_fallback_chain() {
        let runner = runner(FallbackOption::Auto);
        let candidates = runner.candidates(&version("gpt-4.1"));
        assert_eq!(candidates[0], "gpt-4.1");
        assert!(candidates.len() > 1);
        assert_eq!(
            &candidates[1..],
            model_data("gpt-4.1").unwrap().fallback.as_slice()
        );
    }

    #[test]
    fn test_candidates_explicit_list() {
        let runner = runner(FallbackOption::Models(vec![
            "claude-sonnet-4-5".to_string(),
        ]));
        let candidates = runner.candidates(&version("gpt-4.1"));
        assert_eq!(candidates, vec!["gpt-4.1", "claude-sonnet-4-5"]);
    }

    #[test]
    fn test_pinned_provider_disables_fallback() {
        let runner = runner(FallbackOption::Auto);
        let mut v = version("gpt-4.1");
        v.provider = Some(ProviderId::Openai);
        assert_eq!(runner.candidates(&v), vec!["gpt-4.1"]);
    }

    #[test]
    fn test_fallback_option_serde() {
        assert_eq!(
            serde_json::from_value::<FallbackOption>(json!("auto")).unwrap(),
            FallbackOption::Auto
        );
        assert_eq!(
            serde_json::from_value::<FallbackOption>(json!("never")).unwrap(),
            FallbackOption::Never
        );
        assert_eq!(
            serde_json::from_value::<FallbackOption>(json!(["a", "b"])).unwrap(),
            FallbackOption::Models(vec!["a".to_string(), "b".to_string()])
        );
        assert!(serde_json::from_value::<FallbackOption>(json!("sometimes")).is_err());
    }

    #[test]
    fn test_prepare_caps_tool_call_iterations() {
        let runner = runner(FallbackOption::Never);
        let messages: Vec<Message> = (0..=MAX_TOOL_CALL_ITERATIONS)
            .map(|i| Message {
                role: MessageRole::User,
                content: vec![MessageContent {
                    tool_call_result: Some(crate::domain::tool_call::ToolCallResult {
                        id: format!("call_{i}"),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                run_id: None,
            })
            .collect();
        let input = AgentInput {
            messages: Some(messages),
            ..Default::default()
        };
        let err = runner
            .prepare_completion(
                Agent::new("assistant"),
                version("gpt-4.1"),
                input,
                crate::domain::hashing::uuid7(),
                BTreeMap::new(),
                None,
                CompletionSource::Api,
                false,
            )
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRunProperties);
    }

    #[test]
    fn test_record_failure_builds_storable_completion() {
        let runner = runner(FallbackOption::Never);
        let mut builder = prepare(&runner, version("gpt-4.1"), AgentInput::default());
        builder.record_failure(&ApiError::new(ErrorCode::ContentModeration, "refused"));

        let completion = builder.completion.unwrap();
        assert_eq!(completion.status, CompletionStatus::Failure);
        let error = completion.agent_output.error.unwrap();
        assert_eq!(error.message, "refused");
        assert_eq!(error.code.as_deref(), Some("content_moderation"));
    }

    #[test]
    fn test_record_success_orders_output_parts() {
        let runner = runner(FallbackOption::Never);
        let mut builder = prepare(&runner, version("gpt-4.1"), AgentInput::default());
        let output = RunnerOutput {
            text: "answer".to_string(),
            reasoning: Some("thinking".to_string()),
            tool_calls: vec![crate::domain::tool_call::ToolCallRequest {
                index: Some(0),
                id: "call_1".to_string(),
                tool_name: "lookup".to_string(),
                tool_input: json!({}),
            }],
        };
        let completion = builder.record_success(&output);
        let content = &completion.agent_output.messages.as_ref().unwrap()[0].content;
        assert!(content[0].reasoning.is_some());
        assert!(content[1].text.is_some());
        assert!(content[2].tool_call_request.is_some());
        assert_eq!(completion.status, CompletionStatus::Success);
    }
}
