//! Token to tenant resolution
//!
//! Three paths: no credentials (only when explicitly allowed), `aai-` API
//! keys looked up by hash, and JWT bearer tokens with get-or-create tenant
//! semantics on `org_id` or `sub`.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::domain::tenant::TenantData;
use crate::error::{ApiError, ErrorCode};
use crate::storage::RelationalStorage;

pub const API_KEY_PREFIX: &str = "aai-";

/// SHA-256 hex digest of an API key; only hashes are ever stored
pub fn hash_api_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Keep a short readable prefix, mask the rest
pub fn obfuscate(secret: &str, visible: usize) -> String {
    let prefix: String = secret.chars().take(visible).collect();
    format!("{prefix}****")
}

pub fn is_api_key(token: &str) -> bool {
    token.starts_with(API_KEY_PREFIX)
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    org_id: Option<String>,
    #[serde(default)]
    org_slug: Option<String>,
}

pub struct SecurityService {
    relational: RelationalStorage,
    jwt_secret: Option<String>,
    no_tenant_allowed: bool,
}

impl SecurityService {
    pub fn new(
        relational: RelationalStorage,
        jwt_secret: Option<String>,
        no_tenant_allowed: bool,
    ) -> Self {
        Self {
            relational,
            jwt_secret,
            no_tenant_allowed,
        }
    }

    async fn no_tenant(&self) -> Result<TenantData, ApiError> {
        match self.relational.tenant_by_owner_id("").await {
            Ok(tenant) => Ok(tenant),
            Err(e) if e.code == ErrorCode::ObjectNotFound => {
                self.relational
                    .create_tenant(&TenantData {
                        slug: String::new(),
                        owner_id: Some(String::new()),
                        ..Default::default()
                    })
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn api_key_tenant(&self, token: &str) -> Result<TenantData, ApiError> {
        match self
            .relational
            .tenant_by_api_key_hash(&hash_api_key(token))
            .await
        {
            Ok(tenant) => Ok(tenant),
            Err(e) if e.code == ErrorCode::ObjectNotFound => Err(ApiError::invalid_token(
                format!("Invalid API key provided: {}", obfuscate(token, 9)),
            )),
            Err(e) => Err(e),
        }
    }

    fn verify_claims(&self, token: &str) -> Result<Claims, ApiError> {
        let Some(secret) = &self.jwt_secret else {
            return Err(ApiError::invalid_token(
                "Token verification is not configured",
            ));
        };
        let key = DecodingKey::from_secret(secret.as_bytes());
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                ApiError::invalid_token(format!("Invalid token claims: {e}")).with_capture(true)
            })
    }

    async fn tenant_from_org_id(&self, claims: &Claims) -> Result<TenantData, ApiError> {
        let org_id = claims.org_id.as_deref().unwrap_or_default();
        match self.relational.tenant_by_org_id(org_id).await {
            Ok(tenant) => Ok(tenant),
            Err(e) if e.code == ErrorCode::ObjectNotFound => {
                // Valid claims with an unknown org create the tenant
                self.relational
                    .create_tenant(&TenantData {
                        slug: claims
                            .org_slug
                            .clone()
                            .unwrap_or_else(|| org_id.to_string()),
                        owner_id: Some(claims.sub.clone()),
                        org_id: Some(org_id.to_string()),
                        ..Default::default()
                    })
                    .await
            }
            Err(e) => Err(e),
        }
    }

    async fn tenant_from_owner_id(&self, owner_id: &str) -> Result<TenantData, ApiError> {
        match self.relational.tenant_by_owner_id(owner_id).await {
            Ok(tenant) => Ok(tenant),
            Err(e) if e.code == ErrorCode::ObjectNotFound => {
                self.relational
                    .create_tenant(&TenantData {
                        slug: owner_id.to_string(),
                        owner_id: Some(owner_id.to_string()),
                        ..Default::default()
                    })
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve the tenant for an `Authorization` header
    pub async fn find_tenant(&self, authorization: Option<&str>) -> Result<TenantData, ApiError> {
        let authorization = authorization.unwrap_or_default();
        if authorization.is_empty() || !authorization.starts_with("Bearer ") {
            if self.no_tenant_allowed {
                return self.no_tenant().await;
            }
            return Err(ApiError::invalid_token(
                "Authorization header is missing. A valid authorization header with an API key \
                 looks like 'Bearer aai-****'.",
            ));
        }

        let token = authorization.trim_start_matches("Bearer ").trim();
        if is_api_key(token) {
            return self.api_key_tenant(token).await;
        }

        let claims = self.verify_claims(token)?;
        if claims.sub.is_empty() {
            return Err(ApiError::invalid_token("Invalid token claims").with_capture(true));
        }
        if claims.org_id.is_some() {
            return self.tenant_from_org_id(&claims).await;
        }
        self.tenant_from_owner_id(&claims.sub).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    async fn service(no_tenant_allowed: bool) -> SecurityService {
        let relational = RelationalStorage::connect("sqlite::memory:").await.unwrap();
        SecurityService::new(relational, Some(SECRET.to_string()), no_tenant_allowed)
    }

    fn jwt(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> i64 {
        (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp()
    }

    #[test]
    fn test_hash_and_obfuscate() {
        let hash = hash_api_key("aai-secret");
        assert_eq!(hash.len(), 64);
        assert_eq!(obfuscate("aai-1234567890", 9), "aai-12345****");
    }

    #[tokio::test]
    async fn test_missing_header_with_no_tenant_allowed() {
        let service = service(true).await;
        let first = service.find_tenant(None).await.unwrap();
        let second = service.find_tenant(Some("")).await.unwrap();
        // The synthetic empty tenant is created once
        assert_eq!(first.uid, second.uid);
    }

    #[tokio::test]
    async fn test_missing_header_rejected_when_not_allowed() {
        let service = service(false).await;
        let err = service.find_tenant(None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthenticationFailed);
    }

    #[tokio::test]
    async fn test_unknown_api_key_rejected_with_obfuscation() {
        let service = service(true).await;
        let err = service
            .find_tenant(Some("Bearer aai-123456789abcdef"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthenticationFailed);
        assert!(err.message.contains("aai-12345****"));
        assert!(!err.message.contains("aai-123456789abcdef"));
    }

    #[tokio::test]
    async fn test_known_api_key_resolves_tenant() {
        let service = service(true).await;
        let tenant = service
            .relational
            .create_tenant(&TenantData {
                slug: "acme".to_string(),
                owner_id: Some("user_1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        service
            .relational
            .store_api_key(&crate::domain::tenant::ApiKey {
                id: "key_1".to_string(),
                tenant_uid: tenant.uid,
                name: "default".to_string(),
                partial_key: "aai-12345****".to_string(),
                hashed_key: hash_api_key("aai-1234567890"),
                created_at: chrono::Utc::now(),
                last_used_at: None,
            })
            .await
            .unwrap();

        let resolved = service
            .find_tenant(Some("Bearer aai-1234567890"))
            .await
            .unwrap();
        assert_eq!(resolved.uid, tenant.uid);
    }

    #[tokio::test]
    async fn test_jwt_with_org_creates_tenant() {
        let service = service(false).await;
        let token = jwt(json!({
            "sub": "user_1",
            "org_id": "org_42",
            "org_slug": "acme",
            "exp": exp(),
        }));

        let tenant = service
            .find_tenant(Some(&format!("Bearer {token}")))
            .await
            .unwrap();
        assert_eq!(tenant.org_id.as_deref(), Some("org_42"));
        assert_eq!(tenant.slug, "acme");

        // Second resolution reuses the row
        let again = service
            .find_tenant(Some(&format!("Bearer {token}")))
            .await
            .unwrap();
        assert_eq!(again.uid, tenant.uid);
    }

    #[tokio::test]
    async fn test_jwt_without_org_uses_owner() {
        let service = service(false).await;
        let token = jwt(json!({"sub": "user_7", "exp": exp()}));
        let tenant = service
            .find_tenant(Some(&format!("Bearer {token}")))
            .await
            .unwrap();
        assert_eq!(tenant.owner_id.as_deref(), Some("user_7"));
    }

    #[tokio::test]
    async fn test_invalid_jwt_rejected() {
        let service = service(false).await;
        let err = service
            .find_tenant(Some("Bearer not.a.jwt"))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthenticationFailed);
    }
}
