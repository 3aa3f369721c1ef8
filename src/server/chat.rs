//! `POST /v1/chat/completions`: the OpenAI-compatible intake

use std::convert::Infallible;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use serde_json::json;

use crate::domain::agent::Agent;
use crate::error::ApiError;
use crate::runner::StreamEvent;
use crate::server::wire::{completion_to_response, ChatCompletionRequest};
use crate::server::AppState;
use crate::services::RunParams;

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let mut resolved = request.resolve(&state.templates)?;

    // A deployment pins the version; the request messages become the input
    if let Some(deployment_id) = resolved.deployment_id.clone() {
        let deployment = state
            .relational
            .get_deployment(tenant.uid, &deployment_id)
            .await?;
        let request_messages = resolved
            .version
            .prompt
            .take()
            .or_else(|| resolved.input.messages.take());
        resolved.version = deployment.version;
        resolved.agent_id = deployment.agent_id;
        if resolved.input.variables.is_none() {
            resolved.input.messages = request_messages;
        }
    }

    let parse_structured = resolved.version.output_schema.is_some();
    let params = RunParams {
        agent: Agent::new(resolved.agent_id.clone()),
        version: resolved.version,
        input: resolved.input,
        metadata: resolved.metadata,
        timeout: None,
        use_cache: resolved.use_cache,
        use_fallback: resolved.use_fallback,
        completion_id: None,
        conversation_id: resolved.conversation_id,
        source: crate::domain::completion::CompletionSource::Api,
    };

    if resolved.stream {
        let stream = sse_stream(state, tenant.uid, params, parse_structured);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let completion = state.runner_service.run(tenant.uid, params).await?;
    let response = completion_to_response(&completion, &state.config.api_url, parse_structured);
    Ok(Json(response).into_response())
}

fn delta_event(
    completion_id: Option<&str>,
    model: &str,
    chunk: &crate::streaming::RunnerOutputChunk,
) -> serde_json::Value {
    let mut delta = serde_json::Map::new();
    if let Some(text) = &chunk.delta {
        delta.insert("content".to_string(), json!(text));
    }
    if let Some(reasoning) = &chunk.reasoning {
        delta.insert("reasoning_content".to_string(), json!(reasoning));
    }
    if !chunk.tool_call_requests.is_empty() {
        let calls: Vec<serde_json::Value> = chunk
            .tool_call_requests
            .iter()
            .map(|call| {
                json!({
                    "index": call.idx,
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.tool_name, "arguments": call.arguments},
                })
            })
            .collect();
        delta.insert("tool_calls".to_string(), json!(calls));
    }
    json!({
        "id": completion_id,
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{"index": 0, "delta": delta, "finish_reason": serde_json::Value::Null}],
    })
}

/// Relay runner events as OpenAI-style SSE. Errors surface as one terminal
/// `data: {"error": ...}` event followed by a clean close.
fn sse_stream(
    state: AppState,
    tenant_uid: i64,
    params: RunParams,
    parse_structured: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let model = params.version.model.clone();
    async_stream::stream! {
        let mut inner = Box::pin(state.runner_service.stream(tenant_uid, params));
        let mut completion_id: Option<String> = None;

        while let Some(event) = inner.next().await {
            match event {
                Ok(StreamEvent::Chunk(chunk)) => {
                    if chunk.final_output.is_some() {
                        // The terminal payload rides on the Completed event
                        continue;
                    }
                    let payload = delta_event(completion_id.as_deref(), &model, &chunk);
                    yield Ok(Event::default().data(payload.to_string()));
                }
                Ok(StreamEvent::Completed(completion)) => {
                    completion_id = Some(completion.id.to_string());
                    if completion.agent_output.error.is_none() {
                        let response = completion_to_response(
                            &completion,
                            &state.config.api_url,
                            parse_structured,
                        );
                        let payload = json!({
                            "id": response.id,
                            "object": "chat.completion.chunk",
                            "model": response.model,
                            "choices": [{
                                "index": 0,
                                "delta": {},
                                "finish_reason": response.choices[0].finish_reason,
                            }],
                            "usage": response.usage,
                            "version_id": response.version_id,
                            "cost_usd": response.cost_usd,
                            "duration_seconds": response.duration_seconds,
                            "url": response.url,
                        });
                        yield Ok(Event::default().data(payload.to_string()));
                        yield Ok(Event::default().data("[DONE]"));
                    }
                }
                Err(error) => {
                    error.capture_if_needed();
                    yield Ok(Event::default().data(error.serialized().to_string()));
                    break;
                }
            }
        }
    }
}
