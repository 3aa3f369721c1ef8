//! SQLite schema definitions for the relational and analytics stores

/// Relational store: tenants, agents, experiments, deployments, annotations,
/// API keys, views
pub const RELATIONAL_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tenants (
    uid INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL DEFAULT '',
    owner_id TEXT,
    org_id TEXT,
    current_credits_usd REAL NOT NULL DEFAULT 0.0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_owner_id
    ON tenants(owner_id) WHERE owner_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_tenants_org_id
    ON tenants(org_id) WHERE org_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS agents (
    uid INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(tenant_uid, id)
);

CREATE TABLE IF NOT EXISTS experiments (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    author_name TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    result TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(tenant_uid, id)
);

CREATE INDEX IF NOT EXISTS idx_experiments_agent
    ON experiments(tenant_uid, agent_id, created_at DESC);

CREATE TABLE IF NOT EXISTS experiment_versions (
    tenant_uid INTEGER NOT NULL,
    experiment_id TEXT NOT NULL,
    version_id TEXT NOT NULL,
    version TEXT NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY(tenant_uid, experiment_id, version_id)
);

CREATE TABLE IF NOT EXISTS experiment_inputs (
    tenant_uid INTEGER NOT NULL,
    experiment_id TEXT NOT NULL,
    input_id TEXT NOT NULL,
    input TEXT NOT NULL,
    preview TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL,
    PRIMARY KEY(tenant_uid, experiment_id, input_id)
);

-- One row per (version, input) tuple scheduled for an experiment
CREATE TABLE IF NOT EXISTS experiment_completions (
    tenant_uid INTEGER NOT NULL,
    experiment_id TEXT NOT NULL,
    completion_id TEXT NOT NULL,
    version_id TEXT NOT NULL,
    input_id TEXT NOT NULL,
    started_at DATETIME,
    completed_at DATETIME,
    PRIMARY KEY(tenant_uid, experiment_id, version_id, input_id)
);

CREATE TABLE IF NOT EXISTS annotations (
    id TEXT NOT NULL,
    tenant_uid INTEGER NOT NULL,
    author_name TEXT NOT NULL DEFAULT '',
    target_completion_id TEXT,
    target_experiment_id TEXT,
    target_key_path TEXT,
    context_experiment_id TEXT,
    context_agent_id TEXT,
    text TEXT,
    metric_name TEXT,
    metric_value TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    deleted_at DATETIME,
    PRIMARY KEY(tenant_uid, id)
);

CREATE INDEX IF NOT EXISTS idx_annotations_completion
    ON annotations(tenant_uid, target_completion_id);
CREATE INDEX IF NOT EXISTS idx_annotations_experiment
    ON annotations(tenant_uid, context_experiment_id);

CREATE TABLE IF NOT EXISTS deployments (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    version_id TEXT NOT NULL,
    version TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(tenant_uid, id)
);

CREATE TABLE IF NOT EXISTS api_keys (
    id TEXT PRIMARY KEY,
    tenant_uid INTEGER NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    partial_key TEXT NOT NULL,
    hashed_key TEXT NOT NULL UNIQUE,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    last_used_at DATETIME
);

CREATE TABLE IF NOT EXISTS view_folders (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    position INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(tenant_uid, id)
);

CREATE TABLE IF NOT EXISTS views (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    folder_id TEXT,
    title TEXT NOT NULL DEFAULT '',
    query TEXT NOT NULL DEFAULT '',
    graph TEXT,
    position INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(tenant_uid, id)
);
"#;

/// Analytics store: append-only completion rows plus mirrored annotations
/// and experiments for SQL joins. Messages are stored as compact JSON
/// strings; ids are UUIDv7 so the primary key doubles as a time index.
pub const ANALYTICS_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS completions (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    version_id TEXT NOT NULL DEFAULT '',
    version_model TEXT NOT NULL DEFAULT '',
    version TEXT NOT NULL DEFAULT '',
    input_id TEXT NOT NULL DEFAULT '',
    input_preview TEXT NOT NULL DEFAULT '',
    input_messages TEXT NOT NULL DEFAULT '',
    input_variables TEXT NOT NULL DEFAULT '',
    output_id TEXT NOT NULL DEFAULT '',
    output_preview TEXT NOT NULL DEFAULT '',
    output_messages TEXT NOT NULL DEFAULT '',
    output_error TEXT NOT NULL DEFAULT '',
    messages TEXT NOT NULL DEFAULT '',
    duration_ds INTEGER NOT NULL DEFAULT 0,
    cost_millionth_usd INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT '{}',
    source TEXT NOT NULL DEFAULT 'api',
    stream INTEGER NOT NULL DEFAULT 0,
    traces TEXT NOT NULL DEFAULT '[]',
    conversation_id TEXT,
    PRIMARY KEY(id)
);

CREATE INDEX IF NOT EXISTS idx_completions_tenant_id
    ON completions(tenant_uid, id DESC);
CREATE INDEX IF NOT EXISTS idx_completions_cache
    ON completions(tenant_uid, input_id, version_id);
CREATE INDEX IF NOT EXISTS idx_completions_agent
    ON completions(tenant_uid, agent_id, id DESC);

CREATE TABLE IF NOT EXISTS annotations (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    author_name TEXT NOT NULL DEFAULT '',
    completion_id TEXT NOT NULL DEFAULT '',
    experiment_id TEXT NOT NULL DEFAULT '',
    key_path TEXT NOT NULL DEFAULT '',
    agent_id TEXT NOT NULL DEFAULT '',
    text TEXT NOT NULL DEFAULT '',
    metric_name TEXT NOT NULL DEFAULT '',
    metric_value TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY(id)
);

CREATE INDEX IF NOT EXISTS idx_annotations_tenant_completion
    ON annotations(tenant_uid, completion_id);

CREATE TABLE IF NOT EXISTS experiments (
    tenant_uid INTEGER NOT NULL,
    id TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    author_name TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    result TEXT NOT NULL DEFAULT '',
    completion_ids TEXT NOT NULL DEFAULT '[]',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    PRIMARY KEY(id)
);
"#;
