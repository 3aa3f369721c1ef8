//! Environment configuration
//!
//! Everything is driven by environment variables with CLI flags layered on
//! top by the binary. Missing mandatory configuration fails startup with a
//! non-zero exit.

use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    /// Relational store DSN
    pub database_dsn: String,
    /// Analytics store DSN
    pub analytics_dsn: String,
    /// Root directory of the local blob store
    pub blob_dir: PathBuf,
    /// Public base URL of this API, used for link-back URLs
    pub api_url: String,
    /// Allow requests without credentials, served by a synthetic tenant
    pub no_tenant_allowed: bool,
    /// HS256 secret for bearer-token verification
    pub jwt_secret: Option<String>,
    /// CORS origins; empty means any
    pub allowed_origins: Vec<String>,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, thiserror::Error)]
#[error("Missing environment variables: {}", names.join(", "))]
pub struct MissingEnv {
    pub names: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, MissingEnv> {
        let no_tenant_allowed = env_or("NO_TENANT_ALLOWED", "true") == "true";
        let jwt_secret = std::env::var("JWT_SECRET").ok();

        // Without the anonymous-tenant shortcut, some way to authenticate
        // callers is mandatory
        if !no_tenant_allowed && jwt_secret.is_none() {
            return Err(MissingEnv {
                names: vec!["JWT_SECRET".to_string()],
            });
        }

        Ok(Self {
            database_dsn: env_or("DATABASE_DSN", "sqlite://gateway.db?mode=rwc"),
            analytics_dsn: env_or("ANALYTICS_DSN", "sqlite://analytics.db?mode=rwc"),
            blob_dir: PathBuf::from(env_or("FILE_STORAGE_DIR", "./blobs")),
            api_url: env_or("API_URL", "http://localhost:8000"),
            no_tenant_allowed,
            jwt_secret,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_env_error_names_variables() {
        let err = MissingEnv {
            names: vec!["JWT_SECRET".to_string(), "DATABASE_DSN".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Missing environment variables: JWT_SECRET, DATABASE_DSN"
        );
    }
}
