//! End-to-end gateway tests against a mocked upstream provider
//!
//! A tiny axum server stands in for the OpenAI API; the gateway is driven
//! through its real router so requests exercise intake, the runner, the
//! analytics store and the query surface together.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use modelgate::config::Config;
use modelgate::events::{EventKind, SystemEventRouter};
use modelgate::providers::openai::{OpenAIConfig, OpenAIProvider};
use modelgate::providers::ProviderFactory;
use modelgate::server::{build_router, AppState};
use modelgate::services::{
    AnnotationService, ApiKeyService, CompletionRequestHandler, CompletionRunnerService,
    CompletionStorer, ExperimentService, SecurityService, StoreCompletionHandler,
    UserConnectedHandler,
};
use modelgate::storage::{CompletionStore, LocalFileStorage, RelationalStorage};
use modelgate::templates::TemplateManager;

/// Requests captured by the mock upstream
#[derive(Clone, Default)]
struct Upstream {
    requests: Arc<Mutex<Vec<Value>>>,
    /// Number of upcoming requests to answer with a 500
    fail_next: Arc<Mutex<u32>>,
}

async fn upstream_chat(
    State(upstream): State<Upstream>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    upstream.requests.lock().push(body.clone());
    let model = body["model"].as_str().unwrap_or_default().to_string();

    {
        let mut fail_next = upstream.fail_next.lock();
        if *fail_next > 0 {
            *fail_next -= 1;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "upstream exploded"}})),
            );
        }
    }

    let content = if body["response_format"]["type"] == "json_schema" {
        "{\"name\":\"John Doe\",\"age\":30}".to_string()
    } else {
        "The meaning of life is 42".to_string()
    };
    (
        StatusCode::OK,
        Json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 7}
        })),
    )
}

async fn upstream_pdf() -> ([(&'static str, &'static str); 1], &'static [u8]) {
    (
        [("content-type", "application/pdf")],
        b"%PDF-1.4 minimal fixture",
    )
}

async fn spawn_upstream() -> (String, Upstream) {
    let upstream = Upstream::default();
    let router = Router::new()
        .route("/chat/completions", post(upstream_chat))
        .route("/doc.pdf", axum::routing::get(upstream_pdf))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}"), upstream)
}

struct Gateway {
    router: Router,
    state: AppState,
    upstream: Upstream,
    upstream_base: String,
    _dir: tempfile::TempDir,
}

async fn gateway() -> Gateway {
    let (upstream_url, upstream) = spawn_upstream().await;
    let dir = tempfile::tempdir().unwrap();

    let relational = RelationalStorage::connect("sqlite::memory:").await.unwrap();
    let completions = CompletionStore::connect(&format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("analytics.db").display()
    ))
    .await
    .unwrap();

    let mut factory = ProviderFactory::default();
    factory.register(Arc::new(OpenAIProvider::new(OpenAIConfig {
        api_key: "test-key".to_string(),
        url: upstream_url.clone(),
    })));
    let factory = Arc::new(factory);

    let templates = Arc::new(TemplateManager::new());
    let files = Arc::new(LocalFileStorage::new(
        dir.path().join("blobs"),
        "http://localhost:8000/files",
    ));
    let storer = Arc::new(CompletionStorer::new(
        completions.clone(),
        relational.clone(),
        files,
    ));

    let events = Arc::new(SystemEventRouter::new());
    events.register(
        EventKind::StoreCompletion,
        Arc::new(StoreCompletionHandler::new(storer)),
    );
    events.register(EventKind::UserConnected, Arc::new(UserConnectedHandler));

    let runner_service = Arc::new(CompletionRunnerService::new(
        relational.clone(),
        completions.clone(),
        factory.clone(),
        templates.clone(),
        reqwest::Client::new(),
        events.clone(),
    ));
    events.register(
        EventKind::CompletionRequest,
        Arc::new(CompletionRequestHandler::new(runner_service.clone())),
    );

    let config = Config {
        database_dsn: String::new(),
        analytics_dsn: String::new(),
        blob_dir: dir.path().join("blobs"),
        api_url: "http://localhost:8000".to_string(),
        no_tenant_allowed: true,
        jwt_secret: None,
        allowed_origins: Vec::new(),
    };

    let state = AppState {
        config: Arc::new(config),
        templates,
        security: Arc::new(SecurityService::new(relational.clone(), None, true)),
        runner_service,
        experiments: Arc::new(ExperimentService::new(
            relational.clone(),
            completions.clone(),
            events.clone(),
        )),
        annotations: Arc::new(AnnotationService::new(
            relational.clone(),
            completions.clone(),
        )),
        api_keys: Arc::new(ApiKeyService::new(relational.clone())),
        relational,
        completions,
        factory,
        events,
    };

    Gateway {
        router: build_router(state.clone()),
        state,
        upstream,
        upstream_base: upstream_url,
        _dir: dir,
    }
}

async fn post_json(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(path)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get_json(router: &Router, path: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_happy_path_completion_roundtrip() {
    let gateway = gateway().await;

    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": "Hello, world!"}]
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "The meaning of life is 42"
    );
    assert!(body["cost_usd"].as_f64().unwrap() > 0.0);
    assert!(!body["version_id"].as_str().unwrap().is_empty());
    assert!(body["url"].as_str().unwrap().contains("/v1/completions/"));

    // Storage is fire-and-forget; drain before reading back
    gateway.state.events.drain().await;

    let id = body["id"].as_str().unwrap();
    let (status, stored) = get_json(&gateway.router, &format!("/v1/completions/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["id"], body["id"]);
    assert_eq!(
        stored["agent_output"]["messages"][0]["content"][0]["text"],
        "The meaning of life is 42"
    );
    assert_eq!(
        stored["messages"][0]["content"][0]["text"],
        "Hello, world!"
    );
}

#[tokio::test]
async fn test_templated_input_preserves_template_in_version() {
    let gateway = gateway().await;

    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4.1",
            "messages": [{
                "role": "user",
                "content": "What is the capital of the country that has {{name}}?"
            }],
            "input": {"name": "Toulouse"}
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");

    // The rendered prompt reached the provider
    let upstream_request = gateway.upstream.requests.lock()[0].clone();
    let sent = upstream_request["messages"][0]["content"].as_str().unwrap().to_string();
    assert!(sent.contains("Toulouse"));
    assert!(!sent.contains("{{name}}"));

    gateway.state.events.drain().await;
    let id = body["id"].as_str().unwrap();
    let (_, stored) = get_json(&gateway.router, &format!("/v1/completions/{id}")).await;
    // The version keeps the template, not the rendered form
    assert!(stored["version"]["prompt"][0]["content"][0]["text"]
        .as_str()
        .unwrap()
        .contains("{{name}}"));
    assert_eq!(
        stored["version"]["input_variables_schema"],
        json!({"type": "object", "properties": {"name": {}}})
    );
}

#[tokio::test]
async fn test_structured_output_parsed_and_queryable() {
    let gateway = gateway().await;

    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": "Describe John"}],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "person",
                    "schema": {"type": "object", "properties": {"name": {}, "age": {}}}
                }
            }
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(body["choices"][0]["message"]["parsed"]["name"], "John Doe");
    assert_eq!(body["choices"][0]["message"]["parsed"]["age"], 30);

    gateway.state.events.drain().await;

    // The stored row is reachable through the tenant SQL surface
    let query = "SELECT id FROM completions WHERE output_messages LIKE '%\"age\":30%'";
    let (status, result) = get_json(
        &gateway.router,
        &format!("/v1/completions/query?query={}", urlencode(query)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["items"].as_array().unwrap().len(), 1);
    assert_eq!(result["items"][0]["id"], body["id"]);
}

#[tokio::test]
async fn test_fallback_on_5xx_records_both_traces() {
    let gateway = gateway().await;
    // The first upstream call fails with a 500; the fallback model succeeds
    *gateway.upstream.fail_next.lock() = 1;

    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": "hi"}],
            "use_fallback": ["gpt-4.1-mini"]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "The meaning of life is 42"
    );

    // Both models were attempted upstream
    let requests = gateway.upstream.requests.lock().clone();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["model"], "gpt-4.1");
    assert_eq!(requests[1]["model"], "gpt-4.1-mini");

    gateway.state.events.drain().await;
    let id = body["id"].as_str().unwrap();
    let (_, stored) = get_json(&gateway.router, &format!("/v1/completions/{id}")).await;
    let traces = stored["traces"].as_array().unwrap();
    assert_eq!(traces.len(), 2);
    assert_eq!(traces[0]["model"], "gpt-4.1");
    assert_eq!(traces[1]["model"], "gpt-4.1-mini");
}

#[tokio::test]
async fn test_non_recoverable_error_surfaces_without_fallback() {
    let gateway = gateway().await;

    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            // Catalog model with no configured provider in this gateway
            "model": "grok-4",
            "messages": [{"role": "user", "content": "hi"}],
            "use_fallback": "auto"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
    assert!(gateway.upstream.requests.lock().is_empty());
}

#[tokio::test]
async fn test_annotation_flow_attaches_completion_to_experiment() {
    let gateway = gateway().await;

    let (status, experiment) = post_json(
        &gateway.router,
        "/v1/experiments",
        json!({
            "id": "exp-annotations",
            "agent_id": "assistant",
            "title": "Annotation flow",
            "author_name": "reviewer"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {experiment}");

    let (_, completion) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4.1",
            "messages": [{"role": "user", "content": "Hello"}],
            "agent_id": "assistant"
        }),
    )
    .await;
    gateway.state.events.drain().await;
    let completion_id = completion["id"].as_str().unwrap();

    let (status, _) = post_json(
        &gateway.router,
        "/v1/annotations",
        json!([{
            "id": "00000000-0000-0000-0000-000000000000",
            "author_name": "reviewer",
            "target": {"completion_id": completion_id},
            "context": {"experiment_id": "exp-annotations"},
            "text": "correct answer",
            "created_at": "2026-07-01T00:00:00Z",
            "updated_at": "2026-07-01T00:00:00Z"
        }]),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = get_json(&gateway.router, "/v1/experiments/exp-annotations").await;
    assert_eq!(status, StatusCode::OK);
    let run_ids: Vec<&str> = body["experiment"]["run_ids"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_str)
        .collect();
    assert!(run_ids.contains(&completion_id));
    assert_eq!(body["annotations"].as_array().unwrap().len(), 1);
    assert_eq!(body["annotations"][0]["text"], "correct answer");
}

#[tokio::test]
async fn test_experiment_fan_out_and_wait() {
    let gateway = gateway().await;

    post_json(
        &gateway.router,
        "/v1/experiments",
        json!({"id": "exp-fanout", "agent_id": "assistant", "title": "fan out"}),
    )
    .await;

    let (status, versions) = post_json(
        &gateway.router,
        "/v1/experiments/exp-fanout/versions",
        json!({
            "version": {
                "model": "gpt-4.1",
                "prompt": [{"role": "user", "content": [{"text": "Say hi to {{name}}"}]}]
            },
            "overrides": [{"temperature": 0.0}, {"temperature": 1.0}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {versions}");
    assert_eq!(versions["version_ids"].as_array().unwrap().len(), 2);

    let (status, inputs) = post_json(
        &gateway.router,
        "/v1/experiments/exp-fanout/inputs",
        json!({
            "inputs": [
                {"variables": {"name": "Ada"}},
                {"variables": {"name": "Alan"}}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {inputs}");
    // 2 versions × 2 new inputs
    assert_eq!(inputs["enqueued"], 4);

    let (status, waited) = get_json(
        &gateway.router,
        "/v1/experiments/exp-fanout/wait?max_wait_seconds=30",
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {waited}");
    assert_eq!(
        waited["experiment"]["run_ids"].as_array().unwrap().len(),
        4
    );
    assert!(waited["query"].as_str().unwrap().contains("FROM completions"));

    // Re-adding the same inputs enqueues nothing new
    let (_, again) = post_json(
        &gateway.router,
        "/v1/experiments/exp-fanout/inputs",
        json!({"inputs": [{"variables": {"name": "Ada"}}]}),
    )
    .await;
    assert_eq!(again["enqueued"], 0);
}

#[tokio::test]
async fn test_file_url_materialized_before_provider_and_stored_as_blob() {
    let gateway = gateway().await;
    // The upstream mock also serves the file being attached
    let pdf_url = format!("{}/doc.pdf", gateway.upstream_base);

    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "gpt-4.1",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "Summarize this document"},
                    {"type": "file", "file": {"file_data": pdf_url}}
                ]
            }]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "body: {body}");

    // The provider saw inline bytes, not the URL: PDFs are materialized
    let upstream_request = gateway
        .upstream
        .requests
        .lock()
        .iter()
        .find(|r| r.get("messages").is_some())
        .cloned()
        .unwrap();
    let sent = upstream_request["messages"][0]["content"].to_string();
    assert!(sent.contains("data:application/pdf;base64,"));

    gateway.state.events.drain().await;
    let id = body["id"].as_str().unwrap();
    let (_, stored) = get_json(&gateway.router, &format!("/v1/completions/{id}")).await;
    let file = &stored["messages"][0]["content"][1]["file"];
    // Bytes landed in the blob store; inline data is dropped from the row
    assert!(file["storage_url"]
        .as_str()
        .unwrap()
        .contains("/files/1/completions/"));
    assert!(file.get("data").is_none());
}

#[tokio::test]
async fn test_api_key_minted_once() {
    let gateway = gateway().await;
    let (status, minted) = post_json(
        &gateway.router,
        "/v1/organization/keys",
        json!({"name": "ci"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let api_key = minted["api_key"].as_str().unwrap();
    assert!(api_key.starts_with("aai-"));
    assert_eq!(
        minted["partial_key"].as_str().unwrap(),
        format!("{}****", &api_key[..9])
    );
}

#[tokio::test]
async fn test_unknown_model_is_bad_request() {
    let gateway = gateway().await;
    let (status, body) = post_json(
        &gateway.router,
        "/v1/chat/completions",
        json!({
            "model": "not-a-model",
            "messages": [{"role": "user", "content": "hi"}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "no_provider_supporting_model");
}

fn urlencode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}
