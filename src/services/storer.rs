//! Post-completion storage pipeline
//!
//! Runs as a background task: compute previews, materialize files into the
//! blob store, persist the analytics row, link experiments and decrement
//! credits. Nothing here ever propagates back to the request that produced
//! the completion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use crate::domain::completion::AgentCompletion;
use crate::domain::file::File;
use crate::domain::hashing::hash_string;
use crate::error::ApiError;
use crate::events::{Event, EventHandler};
use crate::services::previews::assign_run_previews;
use crate::storage::{CompletionStore, FileStorage, RelationalStorage};

/// Metadata key linking a completion to the experiment that scheduled it
pub const METADATA_EXPERIMENT_ID: &str = "modelgate/experiment_id";

const FILE_FOLDER: &str = "completions";

fn file_cache_key(file: &File) -> String {
    file.url
        .clone()
        .unwrap_or_else(|| hash_string(file.data.as_deref().unwrap_or("")))
}

fn for_each_file(completion: &mut AgentCompletion, mut f: impl FnMut(&mut File)) {
    for message in &mut completion.messages {
        for file in message.file_iterator_mut() {
            f(file);
        }
    }
    if let Some(messages) = completion.agent_input.messages.as_mut() {
        for message in messages {
            for file in message.file_iterator_mut() {
                f(file);
            }
        }
    }
    if let Some(messages) = completion.agent_output.messages.as_mut() {
        for message in messages {
            for file in message.file_iterator_mut() {
                f(file);
            }
        }
    }
}

pub struct CompletionStorer {
    completions: CompletionStore,
    relational: RelationalStorage,
    files: Arc<dyn FileStorage>,
}

impl CompletionStorer {
    pub fn new(
        completions: CompletionStore,
        relational: RelationalStorage,
        files: Arc<dyn FileStorage>,
    ) -> Self {
        Self {
            completions,
            relational,
            files,
        }
    }

    /// Upload file bytes to the blob store and strip inline data. Only URLs
    /// are persisted with the completion.
    async fn store_files(
        &self,
        tenant_uid: i64,
        completion: &mut AgentCompletion,
    ) -> Result<(), ApiError> {
        let mut unique: HashMap<String, File> = HashMap::new();
        for_each_file(completion, |file| {
            if file.storage_url.is_none() && file.data.is_some() {
                unique.insert(file_cache_key(file), file.clone());
            }
        });
        if unique.is_empty() {
            // Still drop any inline data for files that already have a URL
            for_each_file(completion, |file| {
                if file.url.is_some() || file.storage_url.is_some() {
                    file.data = None;
                }
            });
            return Ok(());
        }

        let mut tasks: JoinSet<(String, Result<String, ApiError>)> = JoinSet::new();
        for (key, file) in unique {
            let storage = self.files.clone();
            tasks.spawn(async move {
                let result = storage.store_file(tenant_uid, FILE_FOLDER, &file).await;
                (key, result)
            });
        }

        let mut storage_urls: HashMap<String, String> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(url))) => {
                    storage_urls.insert(key, url);
                }
                Ok((_, Err(e))) => tracing::warn!("error storing file: {}", e.message),
                Err(e) => tracing::warn!("file storage task failed: {e}"),
            }
        }

        for_each_file(completion, |file| {
            if let Some(storage_url) = storage_urls.get(&file_cache_key(file)) {
                file.storage_url = Some(storage_url.clone());
                // Data URLs and missing URLs are replaced by the stored copy
                let replace = match &file.url {
                    None => true,
                    Some(url) => url.starts_with("data:"),
                };
                if replace {
                    file.url = Some(storage_url.clone());
                }
            }
            if file.url.is_some() || file.storage_url.is_some() {
                file.data = None;
            }
        });
        Ok(())
    }

    pub async fn store_completion(
        &self,
        tenant_uid: i64,
        mut completion: AgentCompletion,
    ) -> Result<(), ApiError> {
        if let Err(e) = self.store_files(tenant_uid, &mut completion).await {
            tracing::warn!("error storing completion files: {}", e.message);
        }

        if completion.agent.uid == 0 {
            match self.relational.store_agent(tenant_uid, &completion.agent).await {
                Ok(agent) => completion.agent = agent,
                Err(e) => tracing::warn!("error storing agent: {}", e.message),
            }
        }

        assign_run_previews(&mut completion);
        completion.version.reset_id();
        self.completions
            .store_completion(tenant_uid, &completion)
            .await?;

        if let Some(experiment_id) = completion.metadata.get(METADATA_EXPERIMENT_ID) {
            if let Err(e) = self
                .completions
                .add_completion_to_experiment(tenant_uid, experiment_id, completion.id)
                .await
            {
                tracing::warn!("error linking completion to experiment: {}", e.message);
            }
            if let Err(e) = self
                .relational
                .mark_experiment_completion_done(tenant_uid, completion.id)
                .await
            {
                tracing::warn!("error marking experiment completion: {}", e.message);
            }
        }

        if let Some(cost_usd) = completion.cost_usd {
            // Best-effort credit decrement; accuracy is not a goal here
            if let Err(e) = self.relational.decrement_credits(tenant_uid, cost_usd).await {
                tracing::warn!("error decrementing credits: {}", e.message);
            }
        }
        Ok(())
    }
}

/// `on_store_completion` background job
pub struct StoreCompletionHandler {
    storer: Arc<CompletionStorer>,
}

impl StoreCompletionHandler {
    pub fn new(storer: Arc<CompletionStorer>) -> Self {
        Self { storer }
    }
}

#[async_trait]
impl EventHandler for StoreCompletionHandler {
    fn name(&self) -> &'static str {
        "store_completion"
    }

    async fn handle(&self, tenant_uid: i64, event: Event) -> anyhow::Result<()> {
        let Event::StoreCompletion(completion) = event else {
            anyhow::bail!("unexpected event for store_completion handler");
        };
        self.storer
            .store_completion(tenant_uid, *completion)
            .await
            .map_err(|e| anyhow::anyhow!(e.message))
    }
}

/// `on_user_connected` best-effort attribution
pub struct UserConnectedHandler;

#[async_trait]
impl EventHandler for UserConnectedHandler {
    fn name(&self) -> &'static str {
        "user_connected"
    }

    async fn handle(&self, tenant_uid: i64, event: Event) -> anyhow::Result<()> {
        if let Event::UserConnected { user_id } = event {
            tracing::info!(tenant_uid, user_id, "user connected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::{Agent, AgentInput, AgentOutput};
    use crate::domain::completion::{CompletionSource, CompletionStatus};
    use crate::domain::hashing::uuid7;
    use crate::domain::message::{Message, MessageContent, MessageRole};
    use crate::domain::version::Version;
    use crate::storage::LocalFileStorage;
    use base64::Engine as _;
    use std::collections::BTreeMap;

    async fn storer() -> (CompletionStorer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let analytics_dsn = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("analytics.db").display()
        );
        let completions = CompletionStore::connect(&analytics_dsn).await.unwrap();
        let relational = RelationalStorage::connect("sqlite::memory:").await.unwrap();
        let files = Arc::new(LocalFileStorage::new(
            dir.path().join("blobs"),
            "http://localhost:8000/files",
        ));
        (CompletionStorer::new(completions, relational, files), dir)
    }

    fn completion_with_file() -> AgentCompletion {
        let png = base64::engine::general_purpose::STANDARD
            .encode(b"\x89PNG\r\n\x1a\nrest-of-image");
        let mut version = Version {
            model: "gpt-4.1".to_string(),
            ..Default::default()
        };
        version.reset_id();
        AgentCompletion {
            id: uuid7(),
            agent: Agent::new("assistant"),
            agent_input: AgentInput::default(),
            agent_output: AgentOutput {
                messages: Some(vec![Message::with_text(MessageRole::Assistant, "done")]),
                ..Default::default()
            },
            messages: vec![Message {
                role: MessageRole::User,
                content: vec![MessageContent::file(File {
                    content_type: Some("image/png".to_string()),
                    data: Some(png),
                    ..Default::default()
                })],
                run_id: None,
            }],
            version,
            duration_seconds: Some(0.5),
            cost_usd: Some(0.0001),
            traces: vec![],
            metadata: BTreeMap::new(),
            source: CompletionSource::Api,
            stream: false,
            from_cache: false,
            status: CompletionStatus::Success,
            conversation_id: None,
        }
    }

    #[tokio::test]
    async fn test_store_materializes_files_and_drops_data() {
        let (storer, _dir) = storer().await;
        let completion = completion_with_file();
        let id = completion.id;
        storer.store_completion(1, completion).await.unwrap();

        let stored = storer.completions.completion_by_id(1, id).await.unwrap();
        let file = stored.messages[0].content[0].file.as_ref().unwrap();
        assert!(file.storage_url.as_ref().unwrap().contains("/1/completions/"));
        assert_eq!(file.url, file.storage_url);
        assert!(file.data.is_none());
    }

    #[tokio::test]
    async fn test_store_assigns_previews() {
        let (storer, _dir) = storer().await;
        let mut completion = completion_with_file();
        completion.agent_input = AgentInput {
            variables: Some(serde_json::json!({"q": "life"})),
            ..Default::default()
        };
        completion.agent_input.reset_id();
        let id = completion.id;
        storer.store_completion(1, completion).await.unwrap();

        let stored = storer.completions.completion_by_id(1, id).await.unwrap();
        assert!(!stored.agent_input.preview.is_empty());
        assert_eq!(stored.agent_output.preview, "Assistant: done");
    }

    #[tokio::test]
    async fn test_store_creates_agent_row() {
        let (storer, _dir) = storer().await;
        storer.store_completion(1, completion_with_file()).await.unwrap();
        let agent = storer.relational.get_agent(1, "assistant").await.unwrap();
        assert!(agent.uid > 0);
    }

    #[tokio::test]
    async fn test_store_links_experiment_from_metadata() {
        let (storer, _dir) = storer().await;
        let mut completion = completion_with_file();
        completion.metadata.insert(
            METADATA_EXPERIMENT_ID.to_string(),
            "exp-1".to_string(),
        );
        let id = completion.id;

        storer
            .completions
            .store_experiment(
                1,
                &crate::domain::experiment::Experiment {
                    id: "exp-1".to_string(),
                    agent_id: "assistant".to_string(),
                    created_at: chrono::Utc::now(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        storer.store_completion(1, completion).await.unwrap();

        let ids = storer
            .completions
            .experiment_completion_ids(1, "exp-1")
            .await
            .unwrap();
        assert_eq!(ids, vec![id]);
    }
}
