//! Experiment orchestration: fan-out of versions × inputs, polling and
//! assembly

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;

use crate::domain::agent::{Agent, AgentInput};
use crate::domain::annotation::Annotation;
use crate::domain::experiment::Experiment;
use crate::domain::hashing::{is_valid_hash_id, uuid7};
use crate::domain::version::Version;
use crate::error::ApiError;
use crate::events::{CompletionRequest, Event, SystemEventRouter, TenantEventRouter};
use crate::runner::CacheUsage;
use crate::services::previews::assign_input_preview;
use crate::storage::{AnnotationFilter, CompletionStore, RelationalStorage};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CreateExperimentRequest {
    pub id: Option<String>,
    pub agent_id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub metadata: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub use_cache: CacheUsage,
}

/// Recursively merge `patch` into `base`: objects merge key-wise, everything
/// else replaces
pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value.clone(),
    }
}

fn sanitize_ids(ids: &[String], kind: &str) -> Result<Vec<String>, ApiError> {
    for id in ids {
        if !is_valid_hash_id(id) {
            return Err(ApiError::bad_request(format!("Invalid {kind} id '{id}'")));
        }
    }
    Ok(ids.to_vec())
}

pub struct ExperimentService {
    relational: RelationalStorage,
    completions: CompletionStore,
    events: Arc<SystemEventRouter>,
}

impl ExperimentService {
    pub fn new(
        relational: RelationalStorage,
        completions: CompletionStore,
        events: Arc<SystemEventRouter>,
    ) -> Self {
        Self {
            relational,
            completions,
            events,
        }
    }

    pub async fn create_experiment(
        &self,
        tenant_uid: i64,
        request: CreateExperimentRequest,
    ) -> Result<Experiment, ApiError> {
        // Auto-create the agent on first use
        if self.relational.get_agent(tenant_uid, &request.agent_id).await.is_err() {
            self.relational
                .store_agent(tenant_uid, &Agent::new(request.agent_id.clone()))
                .await?;
        }

        let experiment = Experiment {
            id: request.id.unwrap_or_else(|| uuid7().to_string()),
            agent_id: request.agent_id,
            author_name: request.author_name,
            title: request.title,
            description: request.description,
            metadata: request.metadata,
            created_at: chrono::Utc::now(),
            ..Default::default()
        };
        self.relational.create_experiment(tenant_uid, &experiment).await?;
        // Mirror into analytics for SQL joins; best effort
        if let Err(e) = self.completions.store_experiment(tenant_uid, &experiment).await {
            tracing::warn!("error mirroring experiment: {}", e.message);
        }
        Ok(experiment)
    }

    /// Deduplicate by content hash. Returns every input id on the experiment
    /// in order, plus the newly inserted subset that needs completions.
    pub async fn add_inputs_to_experiment(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        mut inputs: Vec<AgentInput>,
    ) -> Result<(Vec<String>, Vec<String>), ApiError> {
        for input in &mut inputs {
            input.reset_id();
            assign_input_preview(input);
        }
        self.relational
            .add_experiment_inputs(tenant_uid, experiment_id, &inputs)
            .await
    }

    /// Materialize one version per override by deep-merging onto the base
    /// version. Returns the newly inserted version ids.
    pub async fn add_versions_to_experiment(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        version: Version,
        overrides: Option<Vec<Value>>,
    ) -> Result<Vec<String>, ApiError> {
        if version.prompt.is_none() {
            return Err(ApiError::bad_request(
                "Experiment versions must have an explicit prompt",
            ));
        }

        let mut versions = Vec::new();
        match overrides {
            None => {
                let mut version = version;
                version.reset_id();
                versions.push(version);
            }
            Some(overrides) => {
                let base = serde_json::to_value(&version)
                    .map_err(|e| ApiError::internal(format!("version serialization: {e}")))?;
                // Serialized versions omit unset fields, so validate against
                // the full field list
                const VERSION_FIELDS: &[&str] = &[
                    "id",
                    "model",
                    "provider",
                    "prompt",
                    "temperature",
                    "top_p",
                    "max_output_tokens",
                    "presence_penalty",
                    "frequency_penalty",
                    "tool_choice",
                    "tools",
                    "enabled_tools",
                    "input_variables_schema",
                    "output_schema",
                    "reasoning_effort",
                    "reasoning_budget",
                    "parallel_tool_calls",
                    "use_structured_generation",
                ];
                let known_keys: Vec<String> =
                    VERSION_FIELDS.iter().map(|k| k.to_string()).collect();

                for patch in overrides {
                    let Some(patch_map) = patch.as_object() else {
                        return Err(ApiError::bad_request("Version overrides must be objects"));
                    };
                    for key in patch_map.keys() {
                        if !known_keys.contains(key) {
                            return Err(ApiError::bad_request(format!(
                                "Unknown version field '{key}' in override"
                            )));
                        }
                    }
                    let mut merged = base.clone();
                    deep_merge(&mut merged, &patch);
                    let mut version: Version = serde_json::from_value(merged).map_err(|e| {
                        ApiError::bad_request(format!("Invalid version override: {e}"))
                    })?;
                    version.reset_id();
                    versions.push(version);
                }
            }
        }

        self.relational
            .add_experiment_versions(tenant_uid, experiment_id, &versions)
            .await
    }

    /// Enqueue one completion per newly-added (version, input) tuple.
    /// Tuples already registered enqueue nothing.
    pub async fn start_experiment_completions(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        version_ids: &[String],
        input_ids: &[String],
        use_cache: CacheUsage,
    ) -> Result<usize, ApiError> {
        let experiment = self.relational.get_experiment(tenant_uid, experiment_id).await?;
        let router = TenantEventRouter::new(tenant_uid, self.events.clone());

        let mut enqueued = 0;
        for version_id in version_ids {
            let Some(version) = experiment.versions.iter().find(|v| &v.id == version_id) else {
                return Err(ApiError::bad_request(format!(
                    "Version {version_id} is not part of experiment {experiment_id}"
                )));
            };
            for input_id in input_ids {
                let Some(input) = experiment.inputs.iter().find(|i| &i.id == input_id) else {
                    return Err(ApiError::bad_request(format!(
                        "Input {input_id} is not part of experiment {experiment_id}"
                    )));
                };
                let completion_id = uuid7();
                let newly_registered = self
                    .relational
                    .register_experiment_completion(
                        tenant_uid,
                        experiment_id,
                        completion_id,
                        version_id,
                        input_id,
                    )
                    .await?;
                if !newly_registered {
                    continue;
                }
                router.route(
                    Event::CompletionRequest(Box::new(CompletionRequest {
                        experiment_id: experiment_id.to_string(),
                        completion_id,
                        agent_id: experiment.agent_id.clone(),
                        version: version.clone(),
                        input: input.clone(),
                        use_cache,
                    })),
                    None,
                );
                enqueued += 1;
            }
        }
        Ok(enqueued)
    }

    /// Poll until every completion in the selected cross-product finished or
    /// the deadline passes. A timeout returns the partial experiment rather
    /// than an error.
    pub async fn wait_for_experiment(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        version_ids: Option<&[String]>,
        input_ids: Option<&[String]>,
        max_wait: Duration,
    ) -> Result<(Experiment, String), ApiError> {
        let version_ids = version_ids
            .map(|ids| sanitize_ids(ids, "version"))
            .transpose()?;
        let input_ids = input_ids.map(|ids| sanitize_ids(ids, "input")).transpose()?;

        let started = Instant::now();
        loop {
            let completions = self
                .relational
                .list_experiment_completions(
                    tenant_uid,
                    experiment_id,
                    version_ids.as_deref(),
                    input_ids.as_deref(),
                )
                .await?;
            if !completions.is_empty() && completions.iter().all(|c| c.completed_at.is_some()) {
                break;
            }
            if started.elapsed() >= max_wait {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL.min(max_wait.saturating_sub(started.elapsed())))
                .await;
        }

        let experiment = self
            .get_experiment(tenant_uid, experiment_id, version_ids.as_deref(), input_ids.as_deref())
            .await?
            .0;
        let query = format!(
            "SELECT id, input_id, version_id, output_id, output_messages, output_error, \
             cost_millionth_usd, duration_ds FROM completions \
             WHERE json_extract(metadata, '$.\"{METADATA_KEY}\"') = '{id}'",
            METADATA_KEY = crate::services::storer::METADATA_EXPERIMENT_ID,
            // Experiment ids are user-supplied; quoting keeps the canonical
            // query copy-pasteable into the raw surface
            id = experiment.id.replace('\'', "''"),
        );
        Ok((experiment, query))
    }

    /// Assemble the experiment with nested completions and the annotations
    /// targeting any of its runs
    pub async fn get_experiment(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        version_ids: Option<&[String]>,
        input_ids: Option<&[String]>,
    ) -> Result<(Experiment, Vec<crate::domain::completion::AgentCompletion>, Vec<Annotation>), ApiError>
    {
        let mut experiment = self.relational.get_experiment(tenant_uid, experiment_id).await?;

        if let Some(ids) = version_ids {
            experiment.versions.retain(|v| ids.contains(&v.id));
        }
        if let Some(ids) = input_ids {
            experiment.inputs.retain(|i| ids.contains(&i.id));
        }

        // Annotation-driven links live on the analytics mirror only
        for id in self
            .completions
            .experiment_completion_ids(tenant_uid, experiment_id)
            .await?
        {
            if !experiment.run_ids.contains(&id) {
                experiment.run_ids.push(id);
            }
        }

        let completions = self
            .completions
            .completions_by_ids(tenant_uid, &experiment.run_ids, true)
            .await?;

        let annotations = self
            .relational
            .list_annotations(
                tenant_uid,
                &AnnotationFilter {
                    completion_ids: experiment.run_ids.clone(),
                    experiment_id: Some(experiment_id.to_string()),
                    since: None,
                    limit: 100,
                },
            )
            .await?;

        Ok((experiment, completions, annotations))
    }

    pub async fn list_experiments(
        &self,
        tenant_uid: i64,
        agent_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Experiment>, i64), ApiError> {
        self.relational
            .list_experiments(tenant_uid, agent_id, limit, offset)
            .await
    }

    pub async fn set_experiment_result(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        result: &str,
    ) -> Result<(), ApiError> {
        self.relational
            .set_experiment_result(tenant_uid, experiment_id, result)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{Message, MessageRole};
    use crate::error::ErrorCode;
    use serde_json::json;

    async fn service() -> (ExperimentService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let analytics_dsn = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("analytics.db").display()
        );
        let completions = CompletionStore::connect(&analytics_dsn).await.unwrap();
        let relational = RelationalStorage::connect("sqlite::memory:").await.unwrap();
        (
            ExperimentService::new(relational, completions, Arc::new(SystemEventRouter::new())),
            dir,
        )
    }

    fn base_version() -> Version {
        Version {
            model: "gpt-4.1".to_string(),
            prompt: Some(vec![Message::with_text(
                MessageRole::User,
                "Hello {{name}}",
            )]),
            ..Default::default()
        }
    }

    fn input(name: &str) -> AgentInput {
        AgentInput {
            variables: Some(json!({"name": name})),
            ..Default::default()
        }
    }

    #[test]
    fn test_deep_merge_nested_objects() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": "keep"});
        deep_merge(&mut base, &json!({"a": {"y": 3}}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "b": "keep"}));
    }

    #[test]
    fn test_deep_merge_replaces_scalars_and_arrays() {
        let mut base = json!({"list": [1, 2], "n": 1});
        deep_merge(&mut base, &json!({"list": [3], "n": 2}));
        assert_eq!(base, json!({"list": [3], "n": 2}));
    }

    #[tokio::test]
    async fn test_create_experiment_auto_creates_agent() {
        let (service, _dir) = service().await;
        let experiment = service
            .create_experiment(
                1,
                CreateExperimentRequest {
                    agent_id: "fresh-agent".to_string(),
                    title: "t".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!experiment.id.is_empty());
        assert!(service.relational.get_agent(1, "fresh-agent").await.is_ok());
    }

    #[tokio::test]
    async fn test_add_versions_with_overrides() {
        let (service, _dir) = service().await;
        service
            .create_experiment(
                1,
                CreateExperimentRequest {
                    id: Some("exp-1".to_string()),
                    agent_id: "assistant".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let new_ids = service
            .add_versions_to_experiment(
                1,
                "exp-1",
                base_version(),
                Some(vec![
                    json!({"temperature": 0.0}),
                    json!({"temperature": 1.0}),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(new_ids.len(), 2);
        assert_ne!(new_ids[0], new_ids[1]);
    }

    #[tokio::test]
    async fn test_add_versions_rejects_unknown_override_keys() {
        let (service, _dir) = service().await;
        service
            .create_experiment(
                1,
                CreateExperimentRequest {
                    id: Some("exp-1".to_string()),
                    agent_id: "assistant".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = service
            .add_versions_to_experiment(
                1,
                "exp-1",
                base_version(),
                Some(vec![json!({"not_a_field": true})]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_add_versions_requires_prompt() {
        let (service, _dir) = service().await;
        let mut version = base_version();
        version.prompt = None;
        let err = service
            .add_versions_to_experiment(1, "exp-1", version, None)
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_fan_out_enqueues_cross_product_once() {
        let (service, _dir) = service().await;
        service
            .create_experiment(
                1,
                CreateExperimentRequest {
                    id: Some("exp-1".to_string()),
                    agent_id: "assistant".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let version_ids = service
            .add_versions_to_experiment(
                1,
                "exp-1",
                base_version(),
                Some(vec![json!({"temperature": 0.0}), json!({"temperature": 1.0})]),
            )
            .await
            .unwrap();
        let (_, input_ids) = service
            .add_inputs_to_experiment(1, "exp-1", vec![input("a"), input("b"), input("c")])
            .await
            .unwrap();

        let enqueued = service
            .start_experiment_completions(1, "exp-1", &version_ids, &input_ids, CacheUsage::Auto)
            .await
            .unwrap();
        assert_eq!(enqueued, 2 * 3);

        // Re-running the same tuples enqueues nothing
        let again = service
            .start_experiment_completions(1, "exp-1", &version_ids, &input_ids, CacheUsage::Auto)
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn test_wait_for_experiment_times_out_with_partial_state() {
        let (service, _dir) = service().await;
        service
            .create_experiment(
                1,
                CreateExperimentRequest {
                    id: Some("exp-1".to_string()),
                    agent_id: "assistant".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let version_ids = service
            .add_versions_to_experiment(1, "exp-1", base_version(), None)
            .await
            .unwrap();
        let (_, input_ids) = service
            .add_inputs_to_experiment(1, "exp-1", vec![input("a")])
            .await
            .unwrap();
        service
            .start_experiment_completions(1, "exp-1", &version_ids, &input_ids, CacheUsage::Never)
            .await
            .unwrap();

        // Nothing will ever complete; the wait returns the partial experiment
        let (experiment, query) = service
            .wait_for_experiment(1, "exp-1", None, None, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(experiment.id, "exp-1");
        assert_eq!(experiment.run_ids.len(), 1);
        assert!(query.contains("FROM completions"));
    }

    #[tokio::test]
    async fn test_wait_rejects_malformed_ids() {
        let (service, _dir) = service().await;
        let err = service
            .wait_for_experiment(
                1,
                "exp-1",
                Some(&["not-a-hash'; DROP TABLE completions;--".to_string()]),
                None,
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }
}
