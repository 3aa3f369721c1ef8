//! Tenants: the top-level security boundary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One tenant. Every stored row belongs to exactly one tenant; the uid is
/// the relational row id used for analytics row scoping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantData {
    pub uid: i64,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    #[serde(default)]
    pub current_credits_usd: f64,
}

/// One API key row. Only the SHA-256 hash of the key is stored; the full key
/// is shown exactly once, at mint time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub tenant_uid: i64,
    pub name: String,
    /// First 9 characters followed by `****`
    pub partial_key: String,
    pub hashed_key: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}
