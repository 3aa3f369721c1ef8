//! Relational store: tenants, agents, experiments, deployments,
//! annotations, API keys and views
//!
//! Every query is scoped by `tenant_uid`; callers obtain the uid through the
//! security service before touching storage.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Executor, Row, SqlitePool};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentInput};
use crate::domain::annotation::{
    Annotation, AnnotationContext, AnnotationTarget, Metric, MetricValue,
};
use crate::domain::experiment::Experiment;
use crate::domain::tenant::{ApiKey, TenantData};
use crate::domain::version::Version;
use crate::error::{ApiError, ErrorCode};

/// A named pin of a version, letting callers reference configuration by name
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub agent_id: String,
    pub version: Version,
    pub created_at: DateTime<Utc>,
}

/// Saved SQL query + visualization config over the completions table
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    pub title: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub graph: Option<serde_json::Value>,
    #[serde(default)]
    pub position: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewFolder {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub position: i64,
}

/// Filters for listing annotations
#[derive(Clone, Debug, Default)]
pub struct AnnotationFilter {
    pub completion_ids: Vec<Uuid>,
    pub experiment_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// A scheduled (version, input) tuple within an experiment
#[derive(Clone, Debug)]
pub struct ExperimentCompletion {
    pub completion_id: Uuid,
    pub version_id: String,
    pub input_id: String,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct RelationalStorage {
    pool: SqlitePool,
}

fn metadata_to_json(metadata: &BTreeMap<String, String>) -> String {
    serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string())
}

fn metadata_from_json(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

impl RelationalStorage {
    pub async fn connect(dsn: &str) -> Result<Self, ApiError> {
        // An in-memory database exists per connection; it must never be
        // shared across a pool
        let in_memory = dsn.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .min_connections(if in_memory { 1 } else { 0 })
            .connect(dsn)
            .await?;
        pool.execute(super::schema::RELATIONAL_SCHEMA).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- tenants ------------------------------------------------------------

    fn tenant_from_row(row: &sqlx::sqlite::SqliteRow) -> TenantData {
        TenantData {
            uid: row.get("uid"),
            slug: row.get("slug"),
            owner_id: row.get("owner_id"),
            org_id: row.get("org_id"),
            current_credits_usd: row.get("current_credits_usd"),
        }
    }

    pub async fn tenant_by_owner_id(&self, owner_id: &str) -> Result<TenantData, ApiError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE owner_id = ?")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::object_not_found("tenant"))?;
        Ok(Self::tenant_from_row(&row))
    }

    pub async fn tenant_by_org_id(&self, org_id: &str) -> Result<TenantData, ApiError> {
        let row = sqlx::query("SELECT * FROM tenants WHERE org_id = ?")
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::object_not_found("tenant"))?;
        Ok(Self::tenant_from_row(&row))
    }

    pub async fn tenant_by_api_key_hash(&self, hashed_key: &str) -> Result<TenantData, ApiError> {
        let row = sqlx::query(
            "SELECT t.* FROM tenants t JOIN api_keys k ON k.tenant_uid = t.uid WHERE k.hashed_key = ?",
        )
        .bind(hashed_key)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::object_not_found("tenant"))?;

        sqlx::query("UPDATE api_keys SET last_used_at = CURRENT_TIMESTAMP WHERE hashed_key = ?")
            .bind(hashed_key)
            .execute(&self.pool)
            .await?;
        Ok(Self::tenant_from_row(&row))
    }

    pub async fn create_tenant(&self, tenant: &TenantData) -> Result<TenantData, ApiError> {
        let result = sqlx::query(
            "INSERT INTO tenants (slug, owner_id, org_id, current_credits_usd) VALUES (?, ?, ?, ?)",
        )
        .bind(&tenant.slug)
        .bind(&tenant.owner_id)
        .bind(&tenant.org_id)
        .bind(tenant.current_credits_usd)
        .execute(&self.pool)
        .await?;
        Ok(TenantData {
            uid: result.last_insert_rowid(),
            ..tenant.clone()
        })
    }

    /// Best-effort credit decrement after a completion
    pub async fn decrement_credits(&self, tenant_uid: i64, cost_usd: f64) -> Result<(), ApiError> {
        sqlx::query("UPDATE tenants SET current_credits_usd = current_credits_usd - ? WHERE uid = ?")
            .bind(cost_usd)
            .bind(tenant_uid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- agents -------------------------------------------------------------

    pub async fn get_agent(&self, tenant_uid: i64, agent_id: &str) -> Result<Agent, ApiError> {
        let row = sqlx::query("SELECT uid, id FROM agents WHERE tenant_uid = ? AND id = ?")
            .bind(tenant_uid)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::object_not_found("agent"))?;
        Ok(Agent {
            id: row.get("id"),
            uid: row.get("uid"),
        })
    }

    /// Get-or-create by id, returning the row uid
    pub async fn store_agent(&self, tenant_uid: i64, agent: &Agent) -> Result<Agent, ApiError> {
        sqlx::query("INSERT OR IGNORE INTO agents (tenant_uid, id) VALUES (?, ?)")
            .bind(tenant_uid)
            .bind(&agent.id)
            .execute(&self.pool)
            .await?;
        self.get_agent(tenant_uid, &agent.id).await
    }

    pub async fn list_agents(&self, tenant_uid: i64) -> Result<Vec<Agent>, ApiError> {
        let rows = sqlx::query("SELECT uid, id FROM agents WHERE tenant_uid = ? ORDER BY id")
            .bind(tenant_uid)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| Agent {
                id: row.get("id"),
                uid: row.get("uid"),
            })
            .collect())
    }

    // -- experiments ----------------------------------------------------------

    pub async fn create_experiment(
        &self,
        tenant_uid: i64,
        experiment: &Experiment,
    ) -> Result<(), ApiError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO experiments (tenant_uid, id, agent_id, author_name, title, description, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant_uid)
        .bind(&experiment.id)
        .bind(&experiment.agent_id)
        .bind(&experiment.author_name)
        .bind(&experiment.title)
        .bind(&experiment.description)
        .bind(metadata_to_json(&experiment.metadata))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::new(
                ErrorCode::DuplicateValue,
                format!("Experiment '{}' already exists", experiment.id),
            ));
        }
        Ok(())
    }

    pub async fn get_experiment(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
    ) -> Result<Experiment, ApiError> {
        let row = sqlx::query("SELECT * FROM experiments WHERE tenant_uid = ? AND id = ?")
            .bind(tenant_uid)
            .bind(experiment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::object_not_found("experiment"))?;

        let mut experiment = Experiment {
            id: row.get("id"),
            agent_id: row.get("agent_id"),
            author_name: row.get("author_name"),
            title: row.get("title"),
            description: row.get("description"),
            result: row.get("result"),
            metadata: metadata_from_json(row.get("metadata")),
            created_at: row.get("created_at"),
            ..Default::default()
        };

        let versions = sqlx::query(
            "SELECT version FROM experiment_versions WHERE tenant_uid = ? AND experiment_id = ? ORDER BY position",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        for row in versions {
            if let Ok(version) = serde_json::from_str::<Version>(row.get("version")) {
                experiment.versions.push(version);
            }
        }

        let inputs = sqlx::query(
            "SELECT input FROM experiment_inputs WHERE tenant_uid = ? AND experiment_id = ? ORDER BY position",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        for row in inputs {
            if let Ok(input) = serde_json::from_str::<AgentInput>(row.get("input")) {
                experiment.inputs.push(input);
            }
        }

        let completions = self
            .list_experiment_completions(tenant_uid, experiment_id, None, None)
            .await?;
        experiment.run_ids = completions.iter().map(|c| c.completion_id).collect();
        Ok(experiment)
    }

    pub async fn list_experiments(
        &self,
        tenant_uid: i64,
        agent_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<Experiment>, i64), ApiError> {
        let rows = match agent_id {
            Some(agent_id) => {
                sqlx::query(
                    "SELECT * FROM experiments WHERE tenant_uid = ? AND agent_id = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(tenant_uid)
                .bind(agent_id)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM experiments WHERE tenant_uid = ?
                     ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(tenant_uid)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let total: i64 = match agent_id {
            Some(agent_id) => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM experiments WHERE tenant_uid = ? AND agent_id = ?",
                )
                .bind(tenant_uid)
                .bind(agent_id)
                .fetch_one(&self.pool)
                .await?
            }
            None => sqlx::query_scalar("SELECT COUNT(*) FROM experiments WHERE tenant_uid = ?")
                .bind(tenant_uid)
                .fetch_one(&self.pool)
                .await?,
        };

        let experiments = rows
            .iter()
            .map(|row| Experiment {
                id: row.get("id"),
                agent_id: row.get("agent_id"),
                author_name: row.get("author_name"),
                title: row.get("title"),
                description: row.get("description"),
                result: row.get("result"),
                metadata: metadata_from_json(row.get("metadata")),
                created_at: row.get("created_at"),
                ..Default::default()
            })
            .collect();
        Ok((experiments, total))
    }

    pub async fn set_experiment_result(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        result: &str,
    ) -> Result<(), ApiError> {
        let updated = sqlx::query(
            "UPDATE experiments SET result = ?, updated_at = CURRENT_TIMESTAMP
             WHERE tenant_uid = ? AND id = ?",
        )
        .bind(result)
        .bind(tenant_uid)
        .bind(experiment_id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(ApiError::object_not_found("experiment"));
        }
        Ok(())
    }

    /// Insert versions, ignoring ones already present. Returns the ids that
    /// were actually inserted.
    pub async fn add_experiment_versions(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        versions: &[Version],
    ) -> Result<Vec<String>, ApiError> {
        let mut inserted = Vec::new();
        for version in versions {
            let payload = serde_json::to_string(version)
                .map_err(|e| ApiError::internal(format!("version serialization: {e}")))?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO experiment_versions (tenant_uid, experiment_id, version_id, version, position)
                 VALUES (?, ?, ?, ?, (SELECT COUNT(*) FROM experiment_versions WHERE tenant_uid = ? AND experiment_id = ?))",
            )
            .bind(tenant_uid)
            .bind(experiment_id)
            .bind(&version.id)
            .bind(payload)
            .bind(tenant_uid)
            .bind(experiment_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                inserted.push(version.id.clone());
            }
        }
        Ok(inserted)
    }

    /// Insert inputs, deduplicated by content hash. Returns (all ordered ids,
    /// newly inserted ids).
    pub async fn add_experiment_inputs(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        inputs: &[AgentInput],
    ) -> Result<(Vec<String>, Vec<String>), ApiError> {
        let mut inserted = Vec::new();
        for input in inputs {
            let payload = serde_json::to_string(input)
                .map_err(|e| ApiError::internal(format!("input serialization: {e}")))?;
            let result = sqlx::query(
                "INSERT OR IGNORE INTO experiment_inputs (tenant_uid, experiment_id, input_id, input, preview, position)
                 VALUES (?, ?, ?, ?, ?, (SELECT COUNT(*) FROM experiment_inputs WHERE tenant_uid = ? AND experiment_id = ?))",
            )
            .bind(tenant_uid)
            .bind(experiment_id)
            .bind(&input.id)
            .bind(payload)
            .bind(&input.preview)
            .bind(tenant_uid)
            .bind(experiment_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                inserted.push(input.id.clone());
            }
        }

        let rows = sqlx::query(
            "SELECT input_id FROM experiment_inputs WHERE tenant_uid = ? AND experiment_id = ? ORDER BY position",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        let all = rows.iter().map(|row| row.get("input_id")).collect();
        Ok((all, inserted))
    }

    /// Register a scheduled (version, input) tuple. Returns false when the
    /// tuple already exists, in which case no completion must be enqueued.
    pub async fn register_experiment_completion(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        completion_id: Uuid,
        version_id: &str,
        input_id: &str,
    ) -> Result<bool, ApiError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO experiment_completions
             (tenant_uid, experiment_id, completion_id, version_id, input_id, started_at)
             VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .bind(completion_id.to_string())
        .bind(version_id)
        .bind(input_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_experiment_completion_done(
        &self,
        tenant_uid: i64,
        completion_id: Uuid,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "UPDATE experiment_completions SET completed_at = CURRENT_TIMESTAMP
             WHERE tenant_uid = ? AND completion_id = ?",
        )
        .bind(tenant_uid)
        .bind(completion_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_experiment_completions(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        version_ids: Option<&[String]>,
        input_ids: Option<&[String]>,
    ) -> Result<Vec<ExperimentCompletion>, ApiError> {
        let rows = sqlx::query(
            "SELECT completion_id, version_id, input_id, completed_at
             FROM experiment_completions WHERE tenant_uid = ? AND experiment_id = ?
             ORDER BY rowid",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;

        let mut completions = Vec::new();
        for row in rows {
            let version_id: String = row.get("version_id");
            let input_id: String = row.get("input_id");
            if let Some(ids) = version_ids {
                if !ids.contains(&version_id) {
                    continue;
                }
            }
            if let Some(ids) = input_ids {
                if !ids.contains(&input_id) {
                    continue;
                }
            }
            let raw_id: String = row.get("completion_id");
            let Ok(completion_id) = Uuid::parse_str(&raw_id) else {
                continue;
            };
            completions.push(ExperimentCompletion {
                completion_id,
                version_id,
                input_id,
                completed_at: row.get("completed_at"),
            });
        }
        Ok(completions)
    }

    // -- annotations ----------------------------------------------------------

    pub async fn store_annotation(
        &self,
        tenant_uid: i64,
        annotation: &Annotation,
    ) -> Result<(), ApiError> {
        let (metric_name, metric_value) = match &annotation.metric {
            Some(metric) => (
                Some(metric.name.clone()),
                serde_json::to_string(&metric.value).ok(),
            ),
            None => (None, None),
        };
        sqlx::query(
            "INSERT OR REPLACE INTO annotations
             (id, tenant_uid, author_name, target_completion_id, target_experiment_id, target_key_path,
              context_experiment_id, context_agent_id, text, metric_name, metric_value, metadata,
              created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(annotation.id.to_string())
        .bind(tenant_uid)
        .bind(&annotation.author_name)
        .bind(
            annotation
                .target
                .as_ref()
                .and_then(|t| t.completion_id.map(|id| id.to_string())),
        )
        .bind(annotation.target.as_ref().and_then(|t| t.experiment_id.clone()))
        .bind(annotation.target.as_ref().and_then(|t| t.key_path.clone()))
        .bind(annotation.context.as_ref().and_then(|c| c.experiment_id.clone()))
        .bind(annotation.context.as_ref().and_then(|c| c.agent_id.clone()))
        .bind(&annotation.text)
        .bind(metric_name)
        .bind(metric_value)
        .bind(metadata_to_json(&annotation.metadata))
        .bind(annotation.created_at)
        .bind(annotation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_annotation(
        &self,
        tenant_uid: i64,
        annotation_id: Uuid,
    ) -> Result<(), ApiError> {
        let result = sqlx::query(
            "UPDATE annotations SET deleted_at = CURRENT_TIMESTAMP
             WHERE tenant_uid = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(tenant_uid)
        .bind(annotation_id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::object_not_found("annotation"));
        }
        Ok(())
    }

    fn annotation_from_row(row: &sqlx::sqlite::SqliteRow) -> Option<Annotation> {
        let id = Uuid::parse_str(&row.get::<String, _>("id")).ok()?;
        let target_completion_id: Option<String> = row.get("target_completion_id");
        let target_experiment_id: Option<String> = row.get("target_experiment_id");
        let target_key_path: Option<String> = row.get("target_key_path");
        let target = if target_completion_id.is_some()
            || target_experiment_id.is_some()
            || target_key_path.is_some()
        {
            Some(AnnotationTarget {
                completion_id: target_completion_id.and_then(|s| Uuid::parse_str(&s).ok()),
                experiment_id: target_experiment_id,
                key_path: target_key_path,
            })
        } else {
            None
        };

        let context_experiment_id: Option<String> = row.get("context_experiment_id");
        let context_agent_id: Option<String> = row.get("context_agent_id");
        let context = if context_experiment_id.is_some() || context_agent_id.is_some() {
            Some(AnnotationContext {
                experiment_id: context_experiment_id,
                agent_id: context_agent_id,
            })
        } else {
            None
        };

        let metric = row
            .get::<Option<String>, _>("metric_name")
            .map(|name| Metric {
                name,
                value: row
                    .get::<Option<String>, _>("metric_value")
                    .and_then(|raw| serde_json::from_str::<MetricValue>(&raw).ok())
                    .unwrap_or(MetricValue::Bool(true)),
            });

        Some(Annotation {
            id,
            author_name: row.get("author_name"),
            target,
            context,
            text: row.get("text"),
            metric,
            metadata: metadata_from_json(row.get("metadata")),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            deleted_at: row.get("deleted_at"),
        })
    }

    pub async fn list_annotations(
        &self,
        tenant_uid: i64,
        filter: &AnnotationFilter,
    ) -> Result<Vec<Annotation>, ApiError> {
        let rows = sqlx::query(
            "SELECT * FROM annotations WHERE tenant_uid = ? AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(tenant_uid)
        .bind(if filter.limit > 0 { filter.limit } else { 100 })
        .fetch_all(&self.pool)
        .await?;

        let completion_ids: Vec<String> =
            filter.completion_ids.iter().map(|id| id.to_string()).collect();
        let mut annotations = Vec::new();
        for row in &rows {
            let Some(annotation) = Self::annotation_from_row(row) else {
                continue;
            };
            if !completion_ids.is_empty() {
                let matches = annotation
                    .target
                    .as_ref()
                    .and_then(|t| t.completion_id)
                    .map(|id| completion_ids.contains(&id.to_string()))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            if let Some(experiment_id) = &filter.experiment_id {
                let in_target = annotation
                    .target
                    .as_ref()
                    .and_then(|t| t.experiment_id.as_ref())
                    == Some(experiment_id);
                let in_context = annotation
                    .context
                    .as_ref()
                    .and_then(|c| c.experiment_id.as_ref())
                    == Some(experiment_id);
                if !in_target && !in_context {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if annotation.created_at < since {
                    continue;
                }
            }
            annotations.push(annotation);
        }
        Ok(annotations)
    }

    // -- deployments ----------------------------------------------------------

    pub async fn store_deployment(
        &self,
        tenant_uid: i64,
        deployment: &Deployment,
    ) -> Result<(), ApiError> {
        let payload = serde_json::to_string(&deployment.version)
            .map_err(|e| ApiError::internal(format!("version serialization: {e}")))?;
        sqlx::query(
            "INSERT INTO deployments (tenant_uid, id, agent_id, version_id, version)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(tenant_uid, id) DO UPDATE SET
                version_id = excluded.version_id,
                version = excluded.version,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(tenant_uid)
        .bind(&deployment.id)
        .bind(&deployment.agent_id)
        .bind(&deployment.version.id)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_deployment(
        &self,
        tenant_uid: i64,
        deployment_id: &str,
    ) -> Result<Deployment, ApiError> {
        let row = sqlx::query("SELECT * FROM deployments WHERE tenant_uid = ? AND id = ?")
            .bind(tenant_uid)
            .bind(deployment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::object_not_found("deployment"))?;
        let version: Version = serde_json::from_str(row.get("version"))
            .map_err(|e| ApiError::internal(format!("stored deployment is corrupt: {e}")))?;
        Ok(Deployment {
            id: row.get("id"),
            agent_id: row.get("agent_id"),
            version,
            created_at: row.get("created_at"),
        })
    }

    // -- api keys -------------------------------------------------------------

    pub async fn store_api_key(&self, key: &ApiKey) -> Result<(), ApiError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO api_keys (id, tenant_uid, name, partial_key, hashed_key)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&key.id)
        .bind(key.tenant_uid)
        .bind(&key.name)
        .bind(&key.partial_key)
        .bind(&key.hashed_key)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::new(
                ErrorCode::DuplicateValue,
                "API key already exists",
            ));
        }
        Ok(())
    }

    pub async fn list_api_keys(&self, tenant_uid: i64) -> Result<Vec<ApiKey>, ApiError> {
        let rows = sqlx::query(
            "SELECT * FROM api_keys WHERE tenant_uid = ? ORDER BY created_at DESC",
        )
        .bind(tenant_uid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| ApiKey {
                id: row.get("id"),
                tenant_uid: row.get("tenant_uid"),
                name: row.get("name"),
                partial_key: row.get("partial_key"),
                hashed_key: row.get("hashed_key"),
                created_at: row.get("created_at"),
                last_used_at: row.get("last_used_at"),
            })
            .collect())
    }

    // -- views ----------------------------------------------------------------

    pub async fn store_view(&self, tenant_uid: i64, view: &View) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO views (tenant_uid, id, folder_id, title, query, graph, position)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(tenant_uid, id) DO UPDATE SET
                folder_id = excluded.folder_id,
                title = excluded.title,
                query = excluded.query,
                graph = excluded.graph,
                position = excluded.position,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(tenant_uid)
        .bind(&view.id)
        .bind(&view.folder_id)
        .bind(&view.title)
        .bind(&view.query)
        .bind(view.graph.as_ref().map(|g| g.to_string()))
        .bind(view.position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_views(&self, tenant_uid: i64) -> Result<Vec<View>, ApiError> {
        let rows = sqlx::query("SELECT * FROM views WHERE tenant_uid = ? ORDER BY position, id")
            .bind(tenant_uid)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| View {
                id: row.get("id"),
                folder_id: row.get("folder_id"),
                title: row.get("title"),
                query: row.get("query"),
                graph: row
                    .get::<Option<String>, _>("graph")
                    .and_then(|raw| serde_json::from_str(&raw).ok()),
                position: row.get("position"),
            })
            .collect())
    }

    pub async fn delete_view(&self, tenant_uid: i64, view_id: &str) -> Result<(), ApiError> {
        let result = sqlx::query("DELETE FROM views WHERE tenant_uid = ? AND id = ?")
            .bind(tenant_uid)
            .bind(view_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::object_not_found("view"));
        }
        Ok(())
    }

    pub async fn store_view_folder(
        &self,
        tenant_uid: i64,
        folder: &ViewFolder,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT INTO view_folders (tenant_uid, id, name, position) VALUES (?, ?, ?, ?)
             ON CONFLICT(tenant_uid, id) DO UPDATE SET
                name = excluded.name,
                position = excluded.position",
        )
        .bind(tenant_uid)
        .bind(&folder.id)
        .bind(&folder.name)
        .bind(folder.position)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_view_folder(
        &self,
        tenant_uid: i64,
        folder_id: &str,
    ) -> Result<(), ApiError> {
        let result = sqlx::query("DELETE FROM view_folders WHERE tenant_uid = ? AND id = ?")
            .bind(tenant_uid)
            .bind(folder_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::object_not_found("view folder"));
        }
        Ok(())
    }
}
