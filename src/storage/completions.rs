//! Analytics store for completions
//!
//! Append-only rows keyed by UUIDv7, with messages serialized as compact
//! JSON strings. The user-facing `raw_query` surface runs on a dedicated
//! read-only connection and sees the base tables only through tenant-scoped
//! CTEs, so no submitted SQL can escape its tenant.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteColumn, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Executor, Row, SqlitePool, TypeInfo, ValueRef};
use uuid::Uuid;

use crate::domain::agent::{Agent, AgentInput, AgentOutput, OutputError};
use crate::domain::annotation::Annotation;
use crate::domain::completion::{AgentCompletion, CompletionSource, CompletionStatus, Trace};
use crate::domain::experiment::Experiment;
use crate::domain::hashing::{is_valid_hash_id, uuid7_generation_time};
use crate::domain::message::Message;
use crate::domain::version::Version;
use crate::error::{ApiError, ErrorCode};

const MAX_UINT_16: u64 = 65_535;
const MAX_UINT_32: u64 = 4_294_967_295;
/// Raw queries are cut off after this long, mirroring the execution-time cap
/// on the analytics cluster
const RAW_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a cache lookup: just enough to rebuild a completion without the
/// provider call
#[derive(Clone, Debug)]
pub struct CachedCompletion {
    pub id: Uuid,
    pub cost_usd: Option<f64>,
    pub duration_seconds: Option<f64>,
    pub output: AgentOutput,
}

/// Heavy columns excluded from list queries unless asked for
pub const DEFAULT_EXCLUDE: &[&str] = &[
    "input_variables",
    "input_messages",
    "output_messages",
    "messages",
    "traces",
];

// -- fixed-width field helpers (analytics columns are integer-encoded) -------

pub fn duration_ds(duration_seconds: Option<f64>) -> i64 {
    let ds = (duration_seconds.unwrap_or(0.0) * 10.0).round();
    (ds.max(0.0) as u64).min(MAX_UINT_16) as i64
}

pub fn from_duration_ds(ds: i64) -> Option<f64> {
    if ds <= 0 {
        None
    } else {
        Some(ds as f64 / 10.0)
    }
}

pub fn cost_millionth_usd(cost_usd: Option<f64>) -> i64 {
    let millionths = (cost_usd.unwrap_or(0.0) * 1_000_000.0).round();
    (millionths.max(0.0) as u64).min(MAX_UINT_32) as i64
}

pub fn from_cost_millionth_usd(millionths: i64) -> Option<f64> {
    if millionths <= 0 {
        None
    } else {
        Some(millionths as f64 / 1_000_000.0)
    }
}

fn dump_messages(messages: Option<&Vec<Message>>) -> String {
    match messages {
        Some(messages) if !messages.is_empty() => {
            serde_json::to_string(messages).unwrap_or_default()
        }
        _ => String::new(),
    }
}

fn parse_messages(raw: &str) -> Option<Vec<Message>> {
    if raw.is_empty() {
        return None;
    }
    serde_json::from_str(raw).ok()
}

/// Rewrite `ORDER BY created_at DESC` onto the UUIDv7 primary index. Ids are
/// time-ordered, so ordering by id is the same ordering without touching the
/// unindexed datetime column.
pub fn sanitize_query(query: &str) -> String {
    static ORDER_BY: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"(?i)ORDER BY created_at DESC").unwrap()
    });
    ORDER_BY.replace_all(query, "ORDER BY id DESC").to_string()
}

/// Refuse SQL that could reach the base tables behind the tenant scoping.
/// The CTEs installed by `scope_query` only shadow unqualified names;
/// schema-qualified references (`main.completions`) resolve straight to the
/// persisted table, so they are rejected outright. `ATTACH` is rejected
/// because it mints new schema names on the cached read-only connection, and
/// multi-statement input is rejected so a guard cannot be smuggled past in a
/// second statement.
pub fn guard_query(query: &str) -> Result<(), ApiError> {
    static SCHEMA_QUALIFIED: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| {
            regex::Regex::new(r#"(?i)["'\[`]?\b(main|temp)\b["'\]`]?\s*\."#).unwrap()
        });
    static ATTACH: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"(?i)\battach\b").unwrap());

    let single = query.trim().trim_end_matches(';');
    if single.contains(';') {
        return Err(ApiError::new(
            ErrorCode::InvalidQuery,
            "Only a single statement is allowed",
        ));
    }
    if SCHEMA_QUALIFIED.is_match(single) {
        return Err(ApiError::new(
            ErrorCode::InvalidQuery,
            "Schema-qualified table references are not allowed",
        ));
    }
    if ATTACH.is_match(single) {
        return Err(ApiError::new(
            ErrorCode::InvalidQuery,
            "ATTACH is not allowed",
        ));
    }
    Ok(())
}

/// Validate a caller-supplied content-hash id before it is ever interpolated
pub fn sanitize_hash_id(id: &str, kind: &str) -> Result<(), ApiError> {
    if is_valid_hash_id(id) {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("Invalid {kind} id '{id}'")))
    }
}

#[derive(Clone)]
pub struct CompletionStore {
    dsn: String,
    pool: SqlitePool,
    /// Per-tenant read-only pools, created on first query
    readonly_pools: std::sync::Arc<DashMap<i64, SqlitePool>>,
}

impl CompletionStore {
    pub async fn connect(dsn: &str) -> Result<Self, ApiError> {
        // An in-memory database exists per connection; it must never be
        // shared across a pool. The read-only query surface also needs its
        // own connections, so a file-backed DSN is required in production.
        let in_memory = dsn.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .min_connections(if in_memory { 1 } else { 0 })
            .connect(dsn)
            .await?;
        pool.execute(super::schema::ANALYTICS_SCHEMA).await?;
        Ok(Self {
            dsn: dsn.to_string(),
            pool,
            readonly_pools: std::sync::Arc::new(DashMap::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- inserts ------------------------------------------------------------

    pub async fn store_completion(
        &self,
        tenant_uid: i64,
        completion: &AgentCompletion,
    ) -> Result<(), ApiError> {
        let output_error = completion
            .agent_output
            .error
            .as_ref()
            .map(|e| serde_json::to_string(e).unwrap_or_default())
            .unwrap_or_default();
        sqlx::query(
            "INSERT OR REPLACE INTO completions
             (tenant_uid, id, created_at, updated_at, agent_id, version_id, version_model, version,
              input_id, input_preview, input_messages, input_variables,
              output_id, output_preview, output_messages, output_error, messages,
              duration_ds, cost_millionth_usd, metadata, source, stream, traces, conversation_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant_uid)
        .bind(completion.id.to_string())
        .bind(completion.created_at())
        .bind(uuid7_generation_time(&completion.id))
        .bind(&completion.agent.id)
        .bind(&completion.version.id)
        .bind(&completion.version.model)
        .bind(serde_json::to_string(&completion.version).unwrap_or_default())
        .bind(&completion.agent_input.id)
        .bind(&completion.agent_input.preview)
        .bind(dump_messages(completion.agent_input.messages.as_ref()))
        .bind(
            completion
                .agent_input
                .variables
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        )
        .bind(&completion.agent_output.id)
        .bind(&completion.agent_output.preview)
        .bind(dump_messages(completion.agent_output.messages.as_ref()))
        .bind(output_error)
        .bind(dump_messages(Some(&completion.messages)))
        .bind(duration_ds(completion.duration_seconds))
        .bind(cost_millionth_usd(completion.cost_usd))
        .bind(serde_json::to_string(&completion.metadata).unwrap_or_default())
        .bind(completion.source.as_str())
        .bind(completion.stream)
        .bind(serde_json::to_string(&completion.traces).unwrap_or_default())
        .bind(&completion.conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_annotation(
        &self,
        tenant_uid: i64,
        annotation: &Annotation,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT OR REPLACE INTO annotations
             (tenant_uid, id, author_name, completion_id, experiment_id, key_path, agent_id,
              text, metric_name, metric_value, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant_uid)
        .bind(annotation.id.to_string())
        .bind(&annotation.author_name)
        .bind(
            annotation
                .target
                .as_ref()
                .and_then(|t| t.completion_id.map(|id| id.to_string()))
                .unwrap_or_default(),
        )
        .bind(
            annotation
                .target
                .as_ref()
                .and_then(|t| t.experiment_id.clone())
                .or_else(|| {
                    annotation
                        .context
                        .as_ref()
                        .and_then(|c| c.experiment_id.clone())
                })
                .unwrap_or_default(),
        )
        .bind(
            annotation
                .target
                .as_ref()
                .and_then(|t| t.key_path.clone())
                .unwrap_or_default(),
        )
        .bind(
            annotation
                .context
                .as_ref()
                .and_then(|c| c.agent_id.clone())
                .unwrap_or_default(),
        )
        .bind(annotation.text.clone().unwrap_or_default())
        .bind(
            annotation
                .metric
                .as_ref()
                .map(|m| m.name.clone())
                .unwrap_or_default(),
        )
        .bind(
            annotation
                .metric
                .as_ref()
                .and_then(|m| serde_json::to_string(&m.value).ok())
                .unwrap_or_default(),
        )
        .bind(serde_json::to_string(&annotation.metadata).unwrap_or_default())
        .bind(annotation.created_at)
        .bind(annotation.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn store_experiment(
        &self,
        tenant_uid: i64,
        experiment: &Experiment,
    ) -> Result<(), ApiError> {
        sqlx::query(
            "INSERT OR REPLACE INTO experiments
             (tenant_uid, id, agent_id, author_name, title, description, result,
              completion_ids, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tenant_uid)
        .bind(&experiment.id)
        .bind(&experiment.agent_id)
        .bind(&experiment.author_name)
        .bind(&experiment.title)
        .bind(&experiment.description)
        .bind(experiment.result.clone().unwrap_or_default())
        .bind(
            serde_json::to_string(
                &experiment
                    .run_ids
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>(),
            )
            .unwrap_or_default(),
        )
        .bind(serde_json::to_string(&experiment.metadata).unwrap_or_default())
        .bind(experiment.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Append a completion id to the experiment's mirrored id list
    pub async fn add_completion_to_experiment(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
        completion_id: Uuid,
    ) -> Result<(), ApiError> {
        let row = sqlx::query(
            "SELECT completion_ids FROM experiments WHERE tenant_uid = ? AND id = ?",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(());
        };
        let mut ids: Vec<String> =
            serde_json::from_str(row.get::<String, _>("completion_ids").as_str())
                .unwrap_or_default();
        let id = completion_id.to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
        sqlx::query(
            "UPDATE experiments SET completion_ids = ?, updated_at = ? WHERE tenant_uid = ? AND id = ?",
        )
        .bind(serde_json::to_string(&ids).unwrap_or_default())
        .bind(Utc::now())
        .bind(tenant_uid)
        .bind(experiment_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completion ids mirrored onto an experiment row
    pub async fn experiment_completion_ids(
        &self,
        tenant_uid: i64,
        experiment_id: &str,
    ) -> Result<Vec<Uuid>, ApiError> {
        let row = sqlx::query(
            "SELECT completion_ids FROM experiments WHERE tenant_uid = ? AND id = ?",
        )
        .bind(tenant_uid)
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let ids: Vec<String> =
            serde_json::from_str(row.get::<String, _>("completion_ids").as_str())
                .unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect())
    }

    // -- reads --------------------------------------------------------------

    fn completion_from_row(row: &SqliteRow) -> Result<AgentCompletion, ApiError> {
        let id = Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| ApiError::internal(format!("stored completion id is corrupt: {e}")))?;

        let version: Version = {
            let raw: String = row.get("version");
            let mut version: Version =
                serde_json::from_str(&raw).unwrap_or_default();
            let version_id: String = row.get("version_id");
            if !version_id.is_empty() {
                version.id = version_id;
            }
            let model: String = row.get("version_model");
            if !model.is_empty() {
                version.model = model;
            }
            version
        };

        let output_error: String = row.get("output_error");
        let error: Option<OutputError> = if output_error.is_empty() {
            None
        } else {
            serde_json::from_str(&output_error).ok().or(Some(OutputError {
                message: output_error.clone(),
                code: None,
            }))
        };

        let traces: Vec<Trace> =
            serde_json::from_str(row.get::<String, _>("traces").as_str()).unwrap_or_default();
        let source = match row.get::<String, _>("source").as_str() {
            "web" => CompletionSource::Web,
            "mcp" => CompletionSource::Mcp,
            _ => CompletionSource::Api,
        };

        let status = if error.is_none() {
            CompletionStatus::Success
        } else {
            CompletionStatus::Failure
        };

        Ok(AgentCompletion {
            id,
            agent: Agent::new(row.get::<String, _>("agent_id")),
            agent_input: AgentInput {
                id: row.get("input_id"),
                variables: serde_json::from_str(row.get::<String, _>("input_variables").as_str())
                    .ok(),
                messages: parse_messages(row.get::<String, _>("input_messages").as_str()),
                preview: row.get("input_preview"),
            },
            agent_output: AgentOutput {
                id: row.get("output_id"),
                messages: parse_messages(row.get::<String, _>("output_messages").as_str()),
                error,
                preview: row.get("output_preview"),
            },
            messages: parse_messages(row.get::<String, _>("messages").as_str()).unwrap_or_default(),
            version,
            duration_seconds: from_duration_ds(row.get("duration_ds")),
            cost_usd: from_cost_millionth_usd(row.get("cost_millionth_usd")),
            traces,
            metadata: serde_json::from_str(row.get::<String, _>("metadata").as_str())
                .unwrap_or_default(),
            source,
            stream: row.get("stream"),
            from_cache: false,
            status,
            conversation_id: row.get("conversation_id"),
        })
    }

    pub async fn completion_by_id(
        &self,
        tenant_uid: i64,
        completion_id: Uuid,
    ) -> Result<AgentCompletion, ApiError> {
        let row = sqlx::query("SELECT * FROM completions WHERE tenant_uid = ? AND id = ?")
            .bind(tenant_uid)
            .bind(completion_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ApiError::object_not_found("completion"))?;
        Self::completion_from_row(&row)
    }

    /// Bulk primary-key lookup. Heavy columns come back empty unless
    /// `include_payloads` is set.
    pub async fn completions_by_ids(
        &self,
        tenant_uid: i64,
        completion_ids: &[Uuid],
        include_payloads: bool,
    ) -> Result<Vec<AgentCompletion>, ApiError> {
        if completion_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; completion_ids.len()].join(", ");
        let columns = if include_payloads {
            "*".to_string()
        } else {
            // Replace heavy columns with empty literals, keeping the shape
            let mut selects = vec![
                "tenant_uid", "id", "created_at", "updated_at", "agent_id", "version_id",
                "version_model", "version", "input_id", "input_preview", "output_id",
                "output_preview", "output_error", "duration_ds", "cost_millionth_usd",
                "metadata", "source", "stream", "conversation_id",
            ]
            .join(", ");
            for heavy in DEFAULT_EXCLUDE {
                selects.push_str(&format!(", '' AS {heavy}"));
            }
            selects
        };
        let sql = format!(
            "SELECT {columns} FROM completions WHERE tenant_uid = ? AND id IN ({placeholders}) ORDER BY id",
        );
        let mut query = sqlx::query(&sql).bind(tenant_uid);
        for id in completion_ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut completions = Vec::new();
        for row in &rows {
            match Self::completion_from_row(row) {
                Ok(completion) => completions.push(completion),
                Err(e) => tracing::warn!("skipping corrupt completion row: {}", e.message),
            }
        }
        Ok(completions)
    }

    /// Find a prior output for the same (version, input) pair. Rows with an
    /// error never qualify.
    pub async fn cached_completion(
        &self,
        tenant_uid: i64,
        version_id: &str,
        input_id: &str,
    ) -> Result<Option<CachedCompletion>, ApiError> {
        sanitize_hash_id(version_id, "version")?;
        sanitize_hash_id(input_id, "input")?;

        let row = sqlx::query(
            "SELECT id, cost_millionth_usd, duration_ds, output_messages
             FROM completions
             WHERE tenant_uid = ? AND input_id = ? AND version_id = ? AND output_error = ''
             LIMIT 1",
        )
        .bind(tenant_uid)
        .bind(input_id)
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id = Uuid::parse_str(&row.get::<String, _>("id"))
            .map_err(|e| ApiError::internal(format!("stored completion id is corrupt: {e}")))?;
        let messages = parse_messages(row.get::<String, _>("output_messages").as_str());
        let mut output = AgentOutput {
            messages,
            ..Default::default()
        };
        output.reset_id();
        Ok(Some(CachedCompletion {
            id,
            cost_usd: from_cost_millionth_usd(row.get("cost_millionth_usd")),
            duration_seconds: from_duration_ds(row.get("duration_ds")),
            output,
        }))
    }

    // -- raw query surface ----------------------------------------------------

    async fn readonly_pool(&self, tenant_uid: i64) -> Result<SqlitePool, ApiError> {
        if let Some(pool) = self.readonly_pools.get(&tenant_uid) {
            return Ok(pool.clone());
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .after_connect(|conn, _| {
                Box::pin(async move {
                    conn.execute("PRAGMA query_only = ON").await?;
                    Ok(())
                })
            })
            .connect(&self.dsn)
            .await?;
        self.readonly_pools.insert(tenant_uid, pool.clone());
        Ok(pool)
    }

    fn drop_readonly_pool(&self, tenant_uid: i64) {
        self.readonly_pools.remove(&tenant_uid);
    }

    /// Wrap the user's SQL so every unqualified base-table reference
    /// resolves to a tenant-scoped CTE. Shadowing does not apply to
    /// schema-qualified names, which is why `guard_query` must have refused
    /// them before the query gets here; the `main.` qualifiers inside the
    /// CTE bodies are what let the CTEs themselves read the base tables.
    fn scope_query(tenant_uid: i64, query: &str) -> String {
        let scoped_tables = ["completions", "annotations", "experiments"]
            .iter()
            .map(|table| {
                format!("{table} AS (SELECT * FROM main.{table} WHERE tenant_uid = {tenant_uid})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        let trimmed = query.trim();
        if trimmed.len() >= 4 && trimmed[..4].eq_ignore_ascii_case("with") {
            format!("WITH {scoped_tables}, {}", &trimmed[4..].trim_start())
        } else {
            format!("WITH {scoped_tables} {trimmed}")
        }
    }

    fn row_to_json(row: &SqliteRow) -> Value {
        let mut object = Map::new();
        for column in row.columns() {
            object.insert(column.name().to_string(), Self::column_to_json(row, column));
        }
        Value::Object(object)
    }

    fn column_to_json(row: &SqliteRow, column: &SqliteColumn) -> Value {
        let index = column.ordinal();
        // Expression columns carry no declared type; the value's storage
        // class is what decides the JSON shape
        let Ok(raw) = row.try_get_raw(index) else {
            return Value::Null;
        };
        if raw.is_null() {
            return Value::Null;
        }
        match raw.type_info().name() {
            "INTEGER" | "BOOLEAN" => row
                .try_get::<i64, _>(index)
                .map(Value::from)
                .unwrap_or(Value::Null),
            "REAL" => row
                .try_get::<f64, _>(index)
                .map(Value::from)
                .unwrap_or(Value::Null),
            _ => row
                .try_get::<String, _>(index)
                .map(Value::from)
                .unwrap_or(Value::Null),
        }
    }

    fn map_query_error(e: sqlx::Error) -> ApiError {
        match e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                // The raw driver message travels in details only, never in
                // the message shown to the caller
                ApiError::new(ErrorCode::InvalidQuery, "Query failed")
                    .with_details(serde_json::json!({
                        "code": code,
                        "error_type": "SQLITE_ERROR",
                        "message": db.message(),
                    }))
            }
            _ => ApiError::new(ErrorCode::InvalidQuery, "Query failed"),
        }
    }

    /// Tenant-scoped read-only SQL. The connection is query-only, qualified
    /// references past the tenant CTEs are refused up front, and a poisoned
    /// connection is rebuilt and retried once.
    pub async fn raw_query(
        &self,
        tenant_uid: i64,
        query: &str,
    ) -> Result<Vec<Value>, ApiError> {
        guard_query(query)?;
        let scoped = Self::scope_query(tenant_uid, &sanitize_query(query));

        let run = |pool: SqlitePool, scoped: String| async move {
            tokio::time::timeout(RAW_QUERY_TIMEOUT, sqlx::query(&scoped).fetch_all(&pool))
                .await
                .map_err(|_| {
                    ApiError::new(ErrorCode::OperationTimeout, "Query timed out")
                })?
                .map_err(Self::map_query_error)
        };

        let pool = self.readonly_pool(tenant_uid).await?;
        let rows = match run(pool, scoped.clone()).await {
            Ok(rows) => rows,
            Err(first_error) => {
                // The readonly pool may predate a schema change; rebuild it
                // and retry once before surfacing
                self.drop_readonly_pool(tenant_uid);
                let pool = self.readonly_pool(tenant_uid).await?;
                match run(pool, scoped).await {
                    Ok(rows) => rows,
                    Err(_) => return Err(first_error),
                }
            }
        };

        Ok(rows.iter().map(Self::row_to_json).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::hashing::uuid7;
    use crate::domain::message::MessageRole;
    use std::collections::BTreeMap;

    async fn store() -> (CompletionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let dsn = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("analytics.db").display()
        );
        (CompletionStore::connect(&dsn).await.unwrap(), dir)
    }

    fn completion(tenant_marker: &str) -> AgentCompletion {
        let mut version = Version {
            model: "gpt-4.1".to_string(),
            temperature: Some(0.0),
            ..Default::default()
        };
        version.reset_id();
        let mut input = AgentInput {
            variables: Some(serde_json::json!({"name": tenant_marker})),
            preview: format!("name: {tenant_marker}"),
            ..Default::default()
        };
        input.reset_id();
        let mut output = AgentOutput {
            messages: Some(vec![Message::with_text(
                MessageRole::Assistant,
                "The meaning of life is 42",
            )]),
            preview: "Assistant: The meaning of life is 42".to_string(),
            ..Default::default()
        };
        output.reset_id();
        AgentCompletion {
            id: uuid7(),
            agent: Agent::new("assistant"),
            agent_input: input,
            agent_output: output,
            messages: vec![Message::with_text(MessageRole::User, "Hello, world!")],
            version,
            duration_seconds: Some(1.5),
            cost_usd: Some(0.000123),
            traces: vec![Trace::Llm {
                model: "gpt-4.1".to_string(),
                provider: "openai".to_string(),
                usage: None,
                duration_seconds: Some(1.4),
                cost_usd: Some(0.000123),
            }],
            metadata: BTreeMap::from([("env".to_string(), "test".to_string())]),
            source: CompletionSource::Api,
            stream: false,
            from_cache: false,
            status: CompletionStatus::Success,
            conversation_id: None,
        }
    }

    #[test]
    fn test_fixed_width_helpers_clamp() {
        assert_eq!(duration_ds(Some(1.26)), 13);
        assert_eq!(duration_ds(Some(1e9)), MAX_UINT_16 as i64);
        assert_eq!(from_duration_ds(0), None);
        assert_eq!(from_duration_ds(13), Some(1.3));

        assert_eq!(cost_millionth_usd(Some(0.000123)), 123);
        assert_eq!(cost_millionth_usd(Some(1e9)), MAX_UINT_32 as i64);
        assert_eq!(from_cost_millionth_usd(123), Some(0.000123));
    }

    #[test]
    fn test_sanitize_query_rewrites_created_at_ordering() {
        assert_eq!(
            sanitize_query("SELECT * FROM completions ORDER BY created_at DESC LIMIT 10"),
            "SELECT * FROM completions ORDER BY id DESC LIMIT 10"
        );
        // Other orderings are untouched
        assert_eq!(
            sanitize_query("SELECT * FROM completions ORDER BY agent_id DESC"),
            "SELECT * FROM completions ORDER BY agent_id DESC"
        );
        // All occurrences are replaced
        let windowed = "SELECT ROW_NUMBER() OVER (ORDER BY created_at DESC) FROM completions ORDER BY created_at DESC";
        assert_eq!(
            sanitize_query(windowed),
            "SELECT ROW_NUMBER() OVER (ORDER BY id DESC) FROM completions ORDER BY id DESC"
        );
    }

    #[tokio::test]
    async fn test_store_and_fetch_roundtrip() {
        let (store, _dir) = store().await;
        let completion = completion("roundtrip");
        store.store_completion(1, &completion).await.unwrap();

        let loaded = store.completion_by_id(1, completion.id).await.unwrap();
        assert_eq!(loaded.id, completion.id);
        assert_eq!(loaded.agent.id, completion.agent.id);
        assert_eq!(loaded.version.id, completion.version.id);
        assert_eq!(loaded.agent_input.variables, completion.agent_input.variables);
        assert_eq!(loaded.agent_output.messages, completion.agent_output.messages);
        assert_eq!(loaded.messages, completion.messages);
        assert_eq!(loaded.duration_seconds, completion.duration_seconds);
        assert_eq!(loaded.cost_usd, completion.cost_usd);
        assert_eq!(loaded.traces, completion.traces);
        assert_eq!(loaded.metadata, completion.metadata);
        assert_eq!(loaded.status, CompletionStatus::Success);
    }

    #[tokio::test]
    async fn test_completion_by_id_scoped_by_tenant() {
        let (store, _dir) = store().await;
        let completion = completion("scoped");
        store.store_completion(1, &completion).await.unwrap();
        assert!(store.completion_by_id(2, completion.id).await.is_err());
    }

    #[tokio::test]
    async fn test_cached_completion_skips_errored_rows() {
        let (store, _dir) = store().await;
        let mut failed = completion("cache");
        failed.agent_output = AgentOutput {
            error: Some(OutputError {
                message: "boom".to_string(),
                code: None,
            }),
            ..Default::default()
        };
        failed.agent_output.reset_id();
        store.store_completion(1, &failed).await.unwrap();

        let miss = store
            .cached_completion(1, &failed.version.id, &failed.agent_input.id)
            .await
            .unwrap();
        assert!(miss.is_none());

        let ok = completion("cache");
        store.store_completion(1, &ok).await.unwrap();
        let hit = store
            .cached_completion(1, &ok.version.id, &ok.agent_input.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, ok.id);
        assert!(hit.output.messages.is_some());
    }

    #[tokio::test]
    async fn test_cached_completion_rejects_malformed_ids() {
        let (store, _dir) = store().await;
        let err = store
            .cached_completion(1, "not-a-hash", "0123456789abcdef0123456789abcdef")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_raw_query_tenant_isolation() {
        let (store, _dir) = store().await;
        store.store_completion(1, &completion("tenant-one")).await.unwrap();
        store.store_completion(2, &completion("tenant-two")).await.unwrap();

        // Even an explicit cross-tenant predicate cannot escape the scope
        let rows = store
            .raw_query(1, "SELECT tenant_uid, input_preview FROM completions WHERE tenant_uid IN (1, 2)")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["tenant_uid"], 1);
        assert!(rows[0]["input_preview"]
            .as_str()
            .unwrap()
            .contains("tenant-one"));
    }

    #[tokio::test]
    async fn test_raw_query_schema_qualified_references_rejected() {
        let (store, _dir) = store().await;
        store.store_completion(1, &completion("tenant-one")).await.unwrap();
        store.store_completion(2, &completion("tenant-two")).await.unwrap();

        // CTE shadowing only covers unqualified names; qualified references
        // would resolve to the base tables and leak other tenants' rows, so
        // they must never execute
        for query in [
            "SELECT * FROM main.completions",
            "SELECT * FROM main.annotations",
            "SELECT * FROM main.experiments",
            "SELECT * FROM \"main\".completions",
            "SELECT * FROM MAIN . completions",
            "SELECT * FROM temp.completions",
            "SELECT c.tenant_uid FROM completions c JOIN main.completions m ON m.id = c.id",
        ] {
            let err = store.raw_query(1, query).await.unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidQuery, "query: {query}");
        }
    }

    #[tokio::test]
    async fn test_raw_query_attach_and_multi_statement_rejected() {
        let (store, _dir) = store().await;

        let err = store
            .raw_query(1, "ATTACH 'other.db' AS other")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidQuery);

        let err = store
            .raw_query(1, "SELECT 1; SELECT tenant_uid FROM completions")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidQuery);

        // A single trailing semicolon is fine
        store.raw_query(1, "SELECT 1 AS one;").await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_query_rejects_writes() {
        let (store, _dir) = store().await;
        store.store_completion(1, &completion("ro")).await.unwrap();
        let err = store
            .raw_query(1, "DELETE FROM completions")
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidQuery);
    }

    #[tokio::test]
    async fn test_raw_query_invalid_sql_is_invalid_query() {
        let (store, _dir) = store().await;
        let err = store.raw_query(1, "SELECT FROM WHERE").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidQuery);
        // The caller-facing message is generic; the driver text only ever
        // appears under details
        assert_eq!(err.message, "Query failed");
        let details = err.details.unwrap();
        assert_eq!(details["error_type"], "SQLITE_ERROR");
        assert!(details.get("message").is_some());
    }

    #[tokio::test]
    async fn test_raw_query_user_with_clause_merges() {
        let (store, _dir) = store().await;
        store.store_completion(1, &completion("cte")).await.unwrap();
        let rows = store
            .raw_query(
                1,
                "WITH recent AS (SELECT * FROM completions) SELECT COUNT(*) AS n FROM recent",
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["n"], 1);
    }

    #[tokio::test]
    async fn test_raw_query_json_extraction() {
        let (store, _dir) = store().await;
        store.store_completion(1, &completion("json")).await.unwrap();
        let rows = store
            .raw_query(
                1,
                "SELECT json_extract(input_variables, '$.name') AS name FROM completions",
            )
            .await
            .unwrap();
        assert_eq!(rows[0]["name"], "json");
    }

    #[tokio::test]
    async fn test_completions_by_ids_excludes_heavy_columns() {
        let (store, _dir) = store().await;
        let completion = completion("bulk");
        store.store_completion(1, &completion).await.unwrap();

        let slim = store
            .completions_by_ids(1, &[completion.id], false)
            .await
            .unwrap();
        assert_eq!(slim.len(), 1);
        assert!(slim[0].agent_output.messages.is_none());
        assert!(slim[0].messages.is_empty());
        assert_eq!(slim[0].agent_output.preview, completion.agent_output.preview);

        let full = store
            .completions_by_ids(1, &[completion.id], true)
            .await
            .unwrap();
        assert!(full[0].agent_output.messages.is_some());
    }

    #[tokio::test]
    async fn test_experiment_mirror_append() {
        let (store, _dir) = store().await;
        let experiment = Experiment {
            id: "exp-1".to_string(),
            agent_id: "assistant".to_string(),
            created_at: Utc::now(),
            ..Default::default()
        };
        store.store_experiment(1, &experiment).await.unwrap();

        let completion_id = uuid7();
        store
            .add_completion_to_experiment(1, "exp-1", completion_id)
            .await
            .unwrap();
        store
            .add_completion_to_experiment(1, "exp-1", completion_id)
            .await
            .unwrap();

        let rows = store
            .raw_query(1, "SELECT completion_ids FROM experiments WHERE id = 'exp-1'")
            .await
            .unwrap();
        let ids: Vec<String> =
            serde_json::from_str(rows[0]["completion_ids"].as_str().unwrap()).unwrap();
        assert_eq!(ids, vec![completion_id.to_string()]);
    }
}
