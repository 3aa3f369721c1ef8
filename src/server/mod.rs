//! HTTP server wiring: state, routes and startup

pub mod admin;
pub mod chat;
pub mod wire;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::domain::tenant::TenantData;
use crate::error::ApiError;
use crate::events::{EventKind, SystemEventRouter};
use crate::providers::ProviderFactory;
use crate::services::{
    AnnotationService, ApiKeyService, CompletionRequestHandler, CompletionRunnerService,
    CompletionStorer, ExperimentService, SecurityService, StoreCompletionHandler,
    UserConnectedHandler,
};
use crate::storage::{CompletionStore, LocalFileStorage, RelationalStorage};
use crate::templates::TemplateManager;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub templates: Arc<TemplateManager>,
    pub security: Arc<SecurityService>,
    pub runner_service: Arc<CompletionRunnerService>,
    pub experiments: Arc<ExperimentService>,
    pub annotations: Arc<AnnotationService>,
    pub api_keys: Arc<ApiKeyService>,
    pub relational: RelationalStorage,
    pub completions: CompletionStore,
    pub factory: Arc<ProviderFactory>,
    pub events: Arc<SystemEventRouter>,
}

impl AppState {
    /// Resolve the tenant for a request's Authorization header
    pub async fn tenant(&self, headers: &HeaderMap) -> Result<TenantData, ApiError> {
        let authorization = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        self.security.find_tenant(authorization).await
    }
}

/// Build the full application state: storage pools, provider factory,
/// services and the background-event dispatch table.
pub async fn build_state(config: Config) -> Result<AppState, ApiError> {
    let relational = RelationalStorage::connect(&config.database_dsn).await?;
    let completions = CompletionStore::connect(&config.analytics_dsn).await?;
    let factory = Arc::new(ProviderFactory::from_env());
    let templates = Arc::new(TemplateManager::new());
    let http = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .map_err(|e| ApiError::internal(format!("http client: {e}")))?;

    let files = Arc::new(LocalFileStorage::new(
        config.blob_dir.clone(),
        format!("{}/files", config.api_url.trim_end_matches('/')),
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
        http,
        events.clone(),
    ));
    // Experiment-scheduled completions run through the same service
    events.register(
        EventKind::CompletionRequest,
        Arc::new(CompletionRequestHandler::new(runner_service.clone())),
    );

    let security = Arc::new(SecurityService::new(
        relational.clone(),
        config.jwt_secret.clone(),
        config.no_tenant_allowed,
    ));
    let experiments = Arc::new(ExperimentService::new(
        relational.clone(),
        completions.clone(),
        events.clone(),
    ));
    let annotations = Arc::new(AnnotationService::new(
        relational.clone(),
        completions.clone(),
    ));
    let api_keys = Arc::new(ApiKeyService::new(relational.clone()));

    Ok(AppState {
        config: Arc::new(config),
        templates,
        security,
        runner_service,
        experiments,
        annotations,
        api_keys,
        relational,
        completions,
        factory,
        events,
    })
}

/// Route table
pub fn build_router(state: AppState) -> Router {
    let cors = if state.config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse::<axum::http::HeaderValue>().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/completions/query", get(admin::query_completions))
        .route("/v1/completions/:id", get(admin::get_completion))
        .route(
            "/v1/experiments",
            post(admin::create_experiment).get(admin::list_experiments),
        )
        .route("/v1/experiments/:id", get(admin::get_experiment))
        .route("/v1/experiments/:id/wait", get(admin::wait_for_experiment))
        .route("/v1/experiments/:id/inputs", post(admin::add_experiment_inputs))
        .route(
            "/v1/experiments/:id/versions",
            post(admin::add_experiment_versions),
        )
        .route(
            "/v1/annotations",
            post(admin::create_annotations).get(admin::list_annotations),
        )
        .route("/v1/annotations/:id", delete(admin::delete_annotation))
        .route("/v1/agents", get(admin::list_agents))
        .route("/v1/models", get(admin::list_models))
        .route("/v1/models/ids", get(admin::list_model_ids))
        .route("/v1/views", get(admin::list_views).post(admin::upsert_view))
        .route(
            "/v1/views/:id",
            patch(admin::patch_view).delete(admin::delete_view),
        )
        .route("/v1/view-folders", post(admin::upsert_view_folder))
        .route("/v1/view-folders/:id", delete(admin::delete_view_folder))
        .route("/v1/organization/keys", post(admin::create_api_key))
        .route("/health", get(admin::health))
        .route("/metrics", get(admin::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve until ctrl-c, then drain background tasks
pub async fn run_server(config: Config, host: &str, port: u16) -> anyhow::Result<()> {
    let state = build_state(config).await.map_err(|e| anyhow::anyhow!(e.message))?;
    let events = state.events.clone();
    let router = build_router(state);

    let listener = TcpListener::bind((host, port)).await?;
    tracing::info!("gateway listening on {host}:{port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    events.drain().await;
    Ok(())
}
