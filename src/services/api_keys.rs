//! Organization API keys: minted once, stored hashed

use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::hashing::uuid7;
use crate::domain::tenant::ApiKey;
use crate::error::ApiError;
use crate::services::security::{hash_api_key, API_KEY_PREFIX};
use crate::storage::RelationalStorage;

/// Returned exactly once; the full key is never retrievable again
#[derive(Clone, Debug, Serialize)]
pub struct MintedKey {
    pub id: String,
    pub partial_key: String,
    pub api_key: String,
}

/// Generate a fresh key and its displayable prefix
pub fn mint_api_key() -> (String, String) {
    let entropy = format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    let api_key = format!("{API_KEY_PREFIX}{entropy}");
    let partial: String = api_key.chars().take(9).collect();
    (api_key, format!("{partial}****"))
}

pub struct ApiKeyService {
    relational: RelationalStorage,
}

impl ApiKeyService {
    pub fn new(relational: RelationalStorage) -> Self {
        Self { relational }
    }

    pub async fn create_key(
        &self,
        tenant_uid: i64,
        name: &str,
    ) -> Result<MintedKey, ApiError> {
        let (api_key, partial_key) = mint_api_key();
        let key = ApiKey {
            id: uuid7().to_string(),
            tenant_uid,
            name: name.to_string(),
            partial_key: partial_key.clone(),
            hashed_key: hash_api_key(&api_key),
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.relational.store_api_key(&key).await?;
        Ok(MintedKey {
            id: key.id,
            partial_key,
            api_key,
        })
    }

    pub async fn list_keys(&self, tenant_uid: i64) -> Result<Vec<ApiKey>, ApiError> {
        self.relational.list_api_keys(tenant_uid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_api_key_shape() {
        let (key, partial) = mint_api_key();
        assert!(key.starts_with("aai-"));
        assert_eq!(key.len(), 4 + 64);
        assert_eq!(partial, format!("{}****", &key[..9]));
    }

    #[test]
    fn test_minted_keys_are_unique() {
        let (a, _) = mint_api_key();
        let (b, _) = mint_api_key();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_and_list_never_return_full_key() {
        let relational = RelationalStorage::connect("sqlite::memory:").await.unwrap();
        let service = ApiKeyService::new(relational);

        let minted = service.create_key(1, "ci").await.unwrap();
        let listed = service.list_keys(1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].partial_key, minted.partial_key);
        // Only the hash is stored
        assert_eq!(listed[0].hashed_key, hash_api_key(&minted.api_key));
        assert_ne!(listed[0].hashed_key, minted.api_key);
    }
}
