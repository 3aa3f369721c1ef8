//! Content-addressed blob storage for completion files
//!
//! The driver behind the trait is an external concern; the local-disk
//! implementation keeps the same path contract the cloud drivers use:
//! `{tenant_uid}/{folder}/{sha256}{extension}`.

use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::file::File;
use crate::error::ApiError;

#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Persist the file's bytes and return a stable public URL
    async fn store_file(
        &self,
        tenant_uid: i64,
        folder: &str,
        file: &File,
    ) -> Result<String, ApiError>;
}

/// Blob path for a file's content
pub fn blob_path(tenant_uid: i64, folder: &str, bytes: &[u8], extension: &str) -> String {
    let digest = hex::encode(Sha256::digest(bytes));
    format!("{tenant_uid}/{folder}/{digest}{extension}")
}

pub struct LocalFileStorage {
    root: PathBuf,
    base_url: String,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store_file(
        &self,
        tenant_uid: i64,
        folder: &str,
        file: &File,
    ) -> Result<String, ApiError> {
        let bytes = file
            .content_bytes()?
            .ok_or_else(|| ApiError::invalid_file("File has no data to store", file.url.as_deref()))?;
        let path = blob_path(tenant_uid, folder, &bytes, file.extension());

        let full_path = self.root.join(&path);
        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ApiError::internal(format!("blob mkdir failed: {e}")))?;
        }
        // Content addressing makes rewrites idempotent
        tokio::fs::write(&full_path, &bytes)
            .await
            .map_err(|e| ApiError::internal(format!("blob write failed: {e}")))?;

        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_blob_path_shape() {
        let path = blob_path(42, "completions", b"hello", ".png");
        let parts: Vec<&str> = path.split('/').collect();
        assert_eq!(parts[0], "42");
        assert_eq!(parts[1], "completions");
        assert_eq!(parts[2].len(), 64 + 4);
        assert!(parts[2].ends_with(".png"));
    }

    #[test]
    fn test_blob_path_is_content_addressed() {
        let a = blob_path(1, "f", b"same", "");
        let b = blob_path(1, "f", b"same", "");
        let c = blob_path(1, "f", b"different", "");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_local_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path(), "http://localhost:8000/files");
        let file = File {
            data: Some(base64::engine::general_purpose::STANDARD.encode(b"payload")),
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };

        let url = storage.store_file(7, "completions", &file).await.unwrap();
        assert!(url.starts_with("http://localhost:8000/files/7/completions/"));
        assert!(url.ends_with(".txt"));

        let relative = url.trim_start_matches("http://localhost:8000/files/");
        let stored = tokio::fs::read(dir.path().join(relative)).await.unwrap();
        assert_eq!(stored, b"payload");
    }

    #[tokio::test]
    async fn test_store_without_data_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path(), "http://localhost:8000/files");
        let file = File::from_url("https://example.com/cat.png");
        let err = storage.store_file(7, "completions", &file).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidFile);
    }
}
