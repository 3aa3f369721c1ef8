//! Completion execution service: cache gate, runner invocation and
//! fire-and-forget persistence

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentInput};
use crate::domain::completion::{AgentCompletion, CompletionSource, CompletionStatus};
use crate::domain::hashing::uuid7;
use crate::domain::version::Version;
use crate::error::ApiError;
use crate::events::{Event, EventHandler, SystemEventRouter, TenantEventRouter};
use crate::providers::ProviderFactory;
use crate::runner::{CacheUsage, FallbackOption, Runner, StreamEvent};
use crate::services::storer::METADATA_EXPERIMENT_ID;
use crate::storage::{CompletionStore, RelationalStorage};
use crate::streaming::RunnerOutputChunk;
use crate::templates::TemplateManager;

/// Upper bound on the cache lookup; past it the live call goes ahead
const CACHE_LOOKUP_TIMEOUT: Duration = Duration::from_millis(150);

pub struct RunParams {
    pub agent: Agent,
    pub version: Version,
    pub input: AgentInput,
    pub metadata: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub use_cache: CacheUsage,
    pub use_fallback: FallbackOption,
    pub completion_id: Option<Uuid>,
    pub conversation_id: Option<String>,
    pub source: CompletionSource,
}

#[derive(Clone)]
pub struct CompletionRunnerService {
    relational: RelationalStorage,
    completions: CompletionStore,
    factory: Arc<ProviderFactory>,
    templates: Arc<TemplateManager>,
    http: reqwest::Client,
    events: Arc<SystemEventRouter>,
}

impl CompletionRunnerService {
    pub fn new(
        relational: RelationalStorage,
        completions: CompletionStore,
        factory: Arc<ProviderFactory>,
        templates: Arc<TemplateManager>,
        http: reqwest::Client,
        events: Arc<SystemEventRouter>,
    ) -> Self {
        Self {
            relational,
            completions,
            factory,
            templates,
            http,
            events,
        }
    }

    fn should_check_cache(use_cache: CacheUsage, version: &Version) -> bool {
        match use_cache {
            CacheUsage::Always => true,
            CacheUsage::Auto => version.should_use_auto_cache(),
            CacheUsage::Never => false,
        }
    }

    /// Bounded cache lookup. Failures and timeouts degrade to a live call.
    async fn from_cache(
        &self,
        tenant_uid: i64,
        completion_id: Uuid,
        agent: &Agent,
        version: &Version,
        input: &AgentInput,
    ) -> Option<AgentCompletion> {
        let lookup = self
            .completions
            .cached_completion(tenant_uid, &version.id, &input.id);
        let cached = match tokio::time::timeout(CACHE_LOOKUP_TIMEOUT, lookup).await {
            Ok(Ok(cached)) => cached,
            Ok(Err(e)) => {
                tracing::warn!("error fetching cached output: {}", e.message);
                None
            }
            Err(_) => {
                crate::metrics::CACHE_LOOKUPS
                    .with_label_values(&["timeout"])
                    .inc();
                return None;
            }
        };
        let Some(cached) = cached else {
            crate::metrics::CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
            return None;
        };
        crate::metrics::CACHE_LOOKUPS.with_label_values(&["hit"]).inc();

        Some(AgentCompletion {
            id: completion_id,
            agent: agent.clone(),
            agent_input: input.clone(),
            agent_output: cached.output,
            messages: Vec::new(),
            version: version.clone(),
            duration_seconds: cached.duration_seconds,
            cost_usd: cached.cost_usd,
            traces: Vec::new(),
            metadata: BTreeMap::new(),
            source: CompletionSource::Api,
            stream: false,
            from_cache: true,
            status: CompletionStatus::Success,
            conversation_id: None,
        })
    }

    fn runner(&self, params: &RunParams) -> Runner {
        Runner::new(
            self.factory.clone(),
            self.templates.clone(),
            self.http.clone(),
            params.timeout,
            params.use_fallback.clone(),
        )
    }

    /// Execute one completion. The result row is persisted by a background
    /// task whether the run succeeded or failed; cache hits skip both the
    /// provider and the store.
    pub async fn run(
        &self,
        tenant_uid: i64,
        mut params: RunParams,
    ) -> Result<AgentCompletion, ApiError> {
        let completion_id = params.completion_id.unwrap_or_else(uuid7);
        params.version.reset_id();
        params.input.reset_id();

        if Self::should_check_cache(params.use_cache, &params.version) {
            if let Some(completion) = self
                .from_cache(
                    tenant_uid,
                    completion_id,
                    &params.agent,
                    &params.version,
                    &params.input,
                )
                .await
            {
                return Ok(completion);
            }
        }

        let runner = self.runner(&params);
        let mut builder = runner.prepare_completion(
            params.agent,
            params.version,
            params.input,
            completion_id,
            params.metadata,
            params.conversation_id,
            params.source,
            false,
        )?;

        let result = runner.run(&mut builder).await;

        match builder.completion.take() {
            Some(completion) => {
                crate::metrics::COMPLETION_COUNTER
                    .with_label_values(&[
                        completion.source.as_str(),
                        match completion.status {
                            CompletionStatus::Success => "success",
                            CompletionStatus::Failure => "failure",
                        },
                    ])
                    .inc();
                TenantEventRouter::new(tenant_uid, self.events.clone())
                    .route(Event::StoreCompletion(Box::new(completion)), None);
            }
            None => tracing::error!(%completion_id, "no completion to store"),
        }
        result
    }

    /// Streaming variant. Cache hits produce a two-event stream; live runs
    /// relay runner events and persist on the terminal `Completed`.
    pub fn stream(
        &self,
        tenant_uid: i64,
        mut params: RunParams,
    ) -> impl Stream<Item = Result<StreamEvent, ApiError>> {
        let service = self.clone();
        stream! {
            let completion_id = params.completion_id.unwrap_or_else(uuid7);
            params.version.reset_id();
            params.input.reset_id();

            if Self::should_check_cache(params.use_cache, &params.version) {
                if let Some(mut completion) = service
                    .from_cache(tenant_uid, completion_id, &params.agent, &params.version, &params.input)
                    .await
                {
                    completion.stream = true;
                    let text = completion
                        .agent_output
                        .messages
                        .as_ref()
                        .and_then(|m| m.last())
                        .map(|m| m.text_content())
                        .unwrap_or_default();
                    yield Ok(StreamEvent::Chunk(RunnerOutputChunk {
                        delta: Some(text),
                        ..Default::default()
                    }));
                    yield Ok(StreamEvent::Completed(Box::new(completion)));
                    return;
                }
            }

            let runner = Arc::new(service.runner(&params));
            let builder = match runner.prepare_completion(
                params.agent,
                params.version,
                params.input,
                completion_id,
                params.metadata,
                params.conversation_id,
                params.source,
                true,
            ) {
                Ok(builder) => builder,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            let mut inner = Box::pin(runner.stream(builder));
            while let Some(event) = inner.next().await {
                match event {
                    Ok(StreamEvent::Completed(completion)) => {
                        crate::metrics::COMPLETION_COUNTER
                            .with_label_values(&[
                                completion.source.as_str(),
                                match completion.status {
                                    CompletionStatus::Success => "success",
                                    CompletionStatus::Failure => "failure",
                                },
                            ])
                            .inc();
                        TenantEventRouter::new(tenant_uid, service.events.clone())
                            .route(Event::StoreCompletion(completion.clone()), None);
                        yield Ok(StreamEvent::Completed(completion));
                    }
                    other => yield other,
                }
            }
        }
    }

    pub fn relational(&self) -> &RelationalStorage {
        &self.relational
    }
}

/// Executes one experiment-scheduled completion
pub struct CompletionRequestHandler {
    service: Arc<CompletionRunnerService>,
}

impl CompletionRequestHandler {
    pub fn new(service: Arc<CompletionRunnerService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl EventHandler for CompletionRequestHandler {
    fn name(&self) -> &'static str {
        "completion_request"
    }

    async fn handle(&self, tenant_uid: i64, event: Event) -> anyhow::Result<()> {
        let Event::CompletionRequest(request) = event else {
            anyhow::bail!("unexpected event for completion_request handler");
        };

        let mut metadata = BTreeMap::new();
        metadata.insert(
            METADATA_EXPERIMENT_ID.to_string(),
            request.experiment_id.clone(),
        );

        let params = RunParams {
            agent: Agent::new(request.agent_id.clone()),
            version: request.version.clone(),
            input: request.input.clone(),
            metadata,
            timeout: None,
            use_cache: request.use_cache,
            use_fallback: FallbackOption::Never,
            completion_id: Some(request.completion_id),
            conversation_id: None,
            source: CompletionSource::Api,
        };

        // Failures are recorded on the stored completion; the experiment
        // tuple must still resolve either way
        let result = self.service.run(tenant_uid, params).await;
        match result {
            Ok(completion) if completion.from_cache => {
                // Cache hits skip the storer, so the experiment linkage
                // happens here
                self.service
                    .completions
                    .store_completion(tenant_uid, &completion)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.message))?;
                self.service
                    .completions
                    .add_completion_to_experiment(
                        tenant_uid,
                        &request.experiment_id,
                        completion.id,
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e.message))?;
                self.service
                    .relational
                    .mark_experiment_completion_done(tenant_uid, completion.id)
                    .await
                    .map_err(|e| anyhow::anyhow!(e.message))?;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    experiment_id = request.experiment_id,
                    "experiment completion failed: {}",
                    e.message
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentOutput;
    use crate::domain::message::{Message, MessageRole};

    async fn service() -> (CompletionRunnerService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let analytics_dsn = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("analytics.db").display()
        );
        let completions = CompletionStore::connect(&analytics_dsn).await.unwrap();
        let relational = RelationalStorage::connect("sqlite::memory:").await.unwrap();
        let service = CompletionRunnerService::new(
            relational,
            completions,
            Arc::new(ProviderFactory::default()),
            Arc::new(TemplateManager::new()),
            reqwest::Client::new(),
            Arc::new(SystemEventRouter::new()),
        );
        (service, dir)
    }

    fn version() -> Version {
        let mut version = Version {
            model: "gpt-4.1".to_string(),
            temperature: Some(0.0),
            ..Default::default()
        };
        version.reset_id();
        version
    }

    fn params(use_cache: CacheUsage) -> RunParams {
        let mut input = AgentInput {
            variables: Some(serde_json::json!({"name": "Toulouse"})),
            ..Default::default()
        };
        input.reset_id();
        RunParams {
            agent: Agent::new("assistant"),
            version: version(),
            input,
            metadata: BTreeMap::new(),
            timeout: None,
            use_cache,
            use_fallback: FallbackOption::Never,
            completion_id: None,
            conversation_id: None,
            source: CompletionSource::Api,
        }
    }

    async fn seed_cached_completion(service: &CompletionRunnerService, params: &RunParams) {
        let mut stored = AgentCompletion {
            id: uuid7(),
            agent: params.agent.clone(),
            agent_input: params.input.clone(),
            agent_output: AgentOutput {
                messages: Some(vec![Message::with_text(
                    MessageRole::Assistant,
                    "cached answer",
                )]),
                ..Default::default()
            },
            messages: vec![],
            version: params.version.clone(),
            duration_seconds: Some(0.2),
            cost_usd: Some(0.00001),
            traces: vec![],
            metadata: BTreeMap::new(),
            source: CompletionSource::Api,
            stream: false,
            from_cache: false,
            status: CompletionStatus::Success,
            conversation_id: None,
        };
        stored.agent_output.reset_id();
        service.completions.store_completion(1, &stored).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_skips_provider_call() {
        let (service, _dir) = service().await;
        let mut params = params(CacheUsage::Always);
        params.version.reset_id();
        params.input.reset_id();
        seed_cached_completion(&service, &params).await;

        // No providers are registered, so only a cache hit can succeed
        let completion = service.run(1, params).await.unwrap();
        assert!(completion.from_cache);
        assert_eq!(
            completion.agent_output.messages.as_ref().unwrap()[0].text_content(),
            "cached answer"
        );
    }

    #[tokio::test]
    async fn test_auto_cache_requires_deterministic_version() {
        let (service, _dir) = service().await;
        let mut params = params(CacheUsage::Auto);
        params.version.temperature = Some(0.9);
        params.version.reset_id();
        params.input.reset_id();
        seed_cached_completion(&service, &params).await;

        // temperature != 0 means auto cache does not apply; with no provider
        // configured the run fails instead of serving the stored row
        assert!(service.run(1, params).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_never_bypasses_cache() {
        let (service, _dir) = service().await;
        let params_never = params(CacheUsage::Never);
        seed_cached_completion(&service, &params_never).await;
        assert!(service.run(1, params_never).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_run_is_still_persisted() {
        let (service, _dir) = service().await;
        let storer = Arc::new(crate::services::storer::CompletionStorer::new(
            service.completions.clone(),
            service.relational.clone(),
            Arc::new(crate::storage::LocalFileStorage::new(
                std::env::temp_dir(),
                "http://localhost/files",
            )),
        ));
        let events = SystemEventRouter::new();
        events.register(
            crate::events::EventKind::StoreCompletion,
            Arc::new(crate::services::storer::StoreCompletionHandler::new(storer)),
        );
        let events = Arc::new(events);
        let service = CompletionRunnerService::new(
            service.relational.clone(),
            service.completions.clone(),
            Arc::new(ProviderFactory::default()),
            Arc::new(TemplateManager::new()),
            reqwest::Client::new(),
            events.clone(),
        );

        let completion_id = uuid7();
        let mut run_params = params(CacheUsage::Never);
        run_params.completion_id = Some(completion_id);
        // No provider configured: the run fails with no_provider_supporting_model
        assert!(service.run(1, run_params).await.is_err());
        events.drain().await;

        let stored = service
            .completions
            .completion_by_id(1, completion_id)
            .await
            .unwrap();
        assert_eq!(stored.status, CompletionStatus::Failure);
        assert!(stored.agent_output.error.is_some());
    }
}
