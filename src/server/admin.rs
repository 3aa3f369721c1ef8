//! Admin and query surface: completions, experiments, annotations, agents,
//! models, views and API keys

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::agent::AgentInput;
use crate::domain::annotation::Annotation;
use crate::domain::models::{all_models, model_ids};
use crate::domain::version::Version;
use crate::error::ApiError;
use crate::server::AppState;
use crate::services::annotations::new_annotation;
use crate::services::CreateExperimentRequest;
use crate::storage::{AnnotationFilter, View, ViewFolder};

// -- completions -------------------------------------------------------------

#[derive(Deserialize)]
pub struct RawQueryParams {
    pub query: String,
}

pub async fn query_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RawQueryParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let rows = state.completions.raw_query(tenant.uid, &params.query).await?;
    Ok(Json(json!({ "items": rows })))
}

pub async fn get_completion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(completion_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let completion = state
        .completions
        .completion_by_id(tenant.uid, completion_id)
        .await?;
    Ok(Json(serde_json::to_value(completion).unwrap_or_default()))
}

// -- experiments -------------------------------------------------------------

pub async fn create_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateExperimentRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let experiment = state.experiments.create_experiment(tenant.uid, request).await?;
    Ok(Json(serde_json::to_value(experiment).unwrap_or_default()))
}

#[derive(Deserialize)]
pub struct ListExperimentsParams {
    pub agent_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    10
}

pub async fn list_experiments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListExperimentsParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let (items, total) = state
        .experiments
        .list_experiments(tenant.uid, params.agent_id.as_deref(), params.limit, params.offset)
        .await?;
    Ok(Json(json!({ "items": items, "total": total })))
}

#[derive(Deserialize)]
pub struct GetExperimentParams {
    pub version_ids: Option<String>,
    pub input_ids: Option<String>,
}

fn split_ids(raw: Option<&String>) -> Option<Vec<String>> {
    raw.map(|raw| raw.split(',').map(str::trim).map(str::to_string).collect())
}

pub async fn get_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(experiment_id): Path<String>,
    Query(params): Query<GetExperimentParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let version_ids = split_ids(params.version_ids.as_ref());
    let input_ids = split_ids(params.input_ids.as_ref());
    let (experiment, completions, annotations) = state
        .experiments
        .get_experiment(
            tenant.uid,
            &experiment_id,
            version_ids.as_deref(),
            input_ids.as_deref(),
        )
        .await?;
    Ok(Json(json!({
        "experiment": experiment,
        "completions": completions,
        "annotations": annotations,
    })))
}

#[derive(Deserialize)]
pub struct WaitExperimentParams {
    #[serde(default = "default_max_wait")]
    pub max_wait_seconds: u64,
    pub version_ids: Option<String>,
    pub input_ids: Option<String>,
}

fn default_max_wait() -> u64 {
    120
}

pub async fn wait_for_experiment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(experiment_id): Path<String>,
    Query(params): Query<WaitExperimentParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let version_ids = split_ids(params.version_ids.as_ref());
    let input_ids = split_ids(params.input_ids.as_ref());
    let (experiment, query) = state
        .experiments
        .wait_for_experiment(
            tenant.uid,
            &experiment_id,
            version_ids.as_deref(),
            input_ids.as_deref(),
            Duration::from_secs(params.max_wait_seconds),
        )
        .await?;
    Ok(Json(json!({ "experiment": experiment, "query": query })))
}

#[derive(Deserialize)]
pub struct AddInputsRequest {
    pub inputs: Vec<AgentInput>,
    #[serde(default)]
    pub use_cache: crate::runner::CacheUsage,
}

pub async fn add_experiment_inputs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(experiment_id): Path<String>,
    Json(request): Json<AddInputsRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let (all_ids, new_ids) = state
        .experiments
        .add_inputs_to_experiment(tenant.uid, &experiment_id, request.inputs)
        .await?;

    // Only newly inserted inputs fan out, across every registered version
    let (experiment, _, _) = state
        .experiments
        .get_experiment(tenant.uid, &experiment_id, None, None)
        .await?;
    let version_ids: Vec<String> = experiment.versions.iter().map(|v| v.id.clone()).collect();
    let enqueued = if new_ids.is_empty() || version_ids.is_empty() {
        0
    } else {
        state
            .experiments
            .start_experiment_completions(
                tenant.uid,
                &experiment_id,
                &version_ids,
                &new_ids,
                request.use_cache,
            )
            .await?
    };
    Ok(Json(json!({ "input_ids": all_ids, "enqueued": enqueued })))
}

#[derive(Deserialize)]
pub struct AddVersionsRequest {
    pub version: Version,
    #[serde(default)]
    pub overrides: Option<Vec<Value>>,
    #[serde(default)]
    pub use_cache: crate::runner::CacheUsage,
}

pub async fn add_experiment_versions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(experiment_id): Path<String>,
    Json(request): Json<AddVersionsRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let new_ids = state
        .experiments
        .add_versions_to_experiment(tenant.uid, &experiment_id, request.version, request.overrides)
        .await?;

    let (experiment, _, _) = state
        .experiments
        .get_experiment(tenant.uid, &experiment_id, None, None)
        .await?;
    let input_ids: Vec<String> = experiment.inputs.iter().map(|i| i.id.clone()).collect();
    let enqueued = if new_ids.is_empty() || input_ids.is_empty() {
        0
    } else {
        state
            .experiments
            .start_experiment_completions(
                tenant.uid,
                &experiment_id,
                &new_ids,
                &input_ids,
                request.use_cache,
            )
            .await?
    };
    Ok(Json(json!({ "version_ids": new_ids, "enqueued": enqueued })))
}

// -- annotations -------------------------------------------------------------

pub async fn create_annotations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(annotations): Json<Vec<Annotation>>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let annotations = annotations.into_iter().map(new_annotation).collect();
    let stored = state
        .annotations
        .create_annotations(tenant.uid, annotations)
        .await?;
    Ok(Json(json!({ "items": stored })))
}

pub async fn delete_annotation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(annotation_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    state
        .annotations
        .delete_annotation(tenant.uid, annotation_id)
        .await?;
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
pub struct ListAnnotationsParams {
    pub experiment_id: Option<String>,
    pub completion_id: Option<Uuid>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_annotation_limit")]
    pub limit: i64,
}

fn default_annotation_limit() -> i64 {
    100
}

pub async fn list_annotations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListAnnotationsParams>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let filter = AnnotationFilter {
        completion_ids: params.completion_id.into_iter().collect(),
        experiment_id: params.experiment_id,
        since: params.since,
        limit: params.limit,
    };
    let items = state.annotations.list_annotations(tenant.uid, filter).await?;
    Ok(Json(json!({ "items": items })))
}

// -- agents / models ---------------------------------------------------------

pub async fn list_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let agents = state.relational.list_agents(tenant.uid).await?;
    Ok(Json(json!({ "items": agents })))
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    // Catalog data adjusted by whichever provider would serve each model
    let items: Vec<Value> = all_models()
        .into_iter()
        .map(|model| {
            let sanitized = state
                .factory
                .sanitized_model_data(&model.id)
                .unwrap_or(model);
            serde_json::to_value(sanitized).unwrap_or_default()
        })
        .collect();
    Json(json!({ "items": items }))
}

pub async fn list_model_ids() -> Json<Value> {
    Json(json!({ "items": model_ids() }))
}

// -- views -------------------------------------------------------------------

pub async fn list_views(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let views = state.relational.list_views(tenant.uid).await?;
    Ok(Json(json!({ "items": views })))
}

pub async fn upsert_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(view): Json<View>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    state.relational.store_view(tenant.uid, &view).await?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

pub async fn patch_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(view_id): Path<String>,
    Json(mut view): Json<View>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    view.id = view_id;
    state.relational.store_view(tenant.uid, &view).await?;
    Ok(Json(serde_json::to_value(view).unwrap_or_default()))
}

pub async fn delete_view(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(view_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    state.relational.delete_view(tenant.uid, &view_id).await?;
    Ok(Json(json!({ "deleted": true })))
}

pub async fn upsert_view_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(folder): Json<ViewFolder>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    state.relational.store_view_folder(tenant.uid, &folder).await?;
    Ok(Json(serde_json::to_value(folder).unwrap_or_default()))
}

pub async fn delete_view_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(folder_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    state
        .relational
        .delete_view_folder(tenant.uid, &folder_id)
        .await?;
    Ok(Json(json!({ "deleted": true })))
}

// -- api keys ----------------------------------------------------------------

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub name: String,
}

pub async fn create_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Json<Value>, ApiError> {
    let tenant = state.tenant(&headers).await?;
    let minted = state.api_keys.create_key(tenant.uid, &request.name).await?;
    // The full key is shown exactly once
    Ok(Json(serde_json::to_value(minted).unwrap_or_default()))
}

// -- plumbing ----------------------------------------------------------------

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn metrics() -> String {
    crate::metrics::gather()
}
