//! File attachments: sanitization, content-type inference and download

use base64::Engine as _;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ApiError;

const BASE64: base64::engine::general_purpose::GeneralPurpose =
    base64::engine::general_purpose::STANDARD;

/// A file referenced by a message. Either `data` (base64) or `url` must be
/// set; `storage_url` is populated once the bytes land in the blob store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct File {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Base64 encoded content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_url: Option<String>,
}

impl File {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn is_image(&self) -> Option<bool> {
        if let Some(ct) = &self.content_type {
            return Some(ct.starts_with("image/"));
        }
        self.format.as_deref().map(|f| f == "image")
    }

    pub fn is_audio(&self) -> Option<bool> {
        if let Some(ct) = &self.content_type {
            return Some(ct.starts_with("audio/"));
        }
        self.format.as_deref().map(|f| f == "audio")
    }

    pub fn is_pdf(&self) -> Option<bool> {
        if let Some(ct) = &self.content_type {
            return Some(ct == "application/pdf");
        }
        self.format.as_deref().map(|f| f == "pdf")
    }

    /// Blob-store extension for the content type
    pub fn extension(&self) -> &'static str {
        match self.content_type.as_deref() {
            Some("image/png") => ".png",
            Some("image/jpeg") => ".jpg",
            Some("image/gif") => ".gif",
            Some("image/webp") => ".webp",
            Some("application/pdf") => ".pdf",
            Some("audio/wav") | Some("audio/x-wav") => ".wav",
            Some("audio/mpeg") => ".mp3",
            Some("text/plain") => ".txt",
            Some("text/markdown") => ".md",
            Some("text/csv") => ".csv",
            Some("application/json") => ".json",
            _ => "",
        }
    }

    /// Decoded content, if data is present
    pub fn content_bytes(&self) -> Result<Option<Vec<u8>>, ApiError> {
        match &self.data {
            Some(data) => BASE64
                .decode(data)
                .map(Some)
                .map_err(|_| ApiError::bad_request("Invalid base64 data in file")),
            None => Ok(None),
        }
    }

    /// URL form understood by providers that accept inline data URIs
    pub fn to_url(&self, default_content_type: Option<&str>) -> Result<String, ApiError> {
        if let Some(data) = &self.data {
            if let Some(ct) = self.content_type.as_deref().or(default_content_type) {
                return Ok(format!("data:{ct};base64,{data}"));
            }
        }
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        Err(ApiError::internal("No data or URL provided for file"))
    }

    /// Normalize the file in place: decode `data:` URIs into `data` +
    /// `content_type`, validate base64 payloads and http(s) URLs, and infer
    /// the content type from the URL suffix or a `content_type` query param.
    pub fn sanitize(&mut self) -> Result<(), ApiError> {
        if let Some(data) = &self.data {
            let decoded = BASE64
                .decode(data)
                .map_err(|_| ApiError::bad_request("Invalid base64 data in file"))?;
            if self.content_type.is_none() {
                self.content_type = guess_content_type(&decoded).map(str::to_string);
            }
            return Ok(());
        }

        let Some(url) = self.url.clone() else {
            return Err(ApiError::bad_request("No data or URL provided for file"));
        };

        if let Some(rest) = url.strip_prefix("data:") {
            let (content_type, data) = parse_data_url(rest)?;
            BASE64
                .decode(&data)
                .map_err(|_| ApiError::bad_request("Invalid base64 data in file"))?;
            self.content_type = Some(content_type);
            self.data = Some(data);
            self.url = None;
            return Ok(());
        }

        let parsed = Url::parse(&url)
            .map_err(|e| ApiError::bad_request(format!("Invalid URL provided for file: {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(ApiError::bad_request("URL must have a http or https scheme"));
        }

        if self.content_type.is_some() {
            return Ok(());
        }

        if let Some(ct) = parsed
            .query_pairs()
            .find(|(k, _)| k == "content_type")
            .map(|(_, v)| v.to_string())
        {
            self.content_type = Some(ct);
            return Ok(());
        }

        self.content_type = guess_content_type_from_path(parsed.path()).map(str::to_string);
        Ok(())
    }

    /// Fetch remote content into `data`, with bounded retries on
    /// connection-level failures. Fails with `invalid_file` carrying the URL.
    pub async fn download(&mut self, client: &reqwest::Client, retries: u32) -> Result<(), ApiError> {
        let Some(url) = self.url.clone() else {
            return Err(ApiError::invalid_file(
                "File url is required when data is not provided",
                None,
            ));
        };

        let mut remaining = retries;
        let response = loop {
            match client.get(&url).send().await {
                Ok(response) => break response,
                Err(e) if remaining > 0 && (e.is_connect() || e.is_timeout() || e.is_request()) => {
                    remaining -= 1;
                }
                Err(e) => {
                    return Err(ApiError::invalid_file(
                        format!("Failed to download file: {e}"),
                        Some(&url),
                    ));
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::invalid_file(
                format!("Failed to download file: {status}"),
                Some(&url),
            )
            .with_details(serde_json::json!({
                "file_url": url,
                "response_status_code": status.as_u16(),
                "response_body": body,
            })));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::invalid_file(format!("Failed to read file body: {e}"), Some(&url)))?;

        if self.content_type.is_none() {
            self.content_type = guess_content_type(&bytes).map(str::to_string);
            if self.content_type.is_none() {
                tracing::warn!(url = %url, "could not guess content type of downloaded file");
            }
        }
        self.data = Some(BASE64.encode(&bytes));
        Ok(())
    }
}

fn parse_data_url(data_url: &str) -> Result<(String, String), ApiError> {
    let mut splits = data_url.splitn(2, ";base64,");
    match (splits.next(), splits.next()) {
        (Some(content_type), Some(data)) if !content_type.is_empty() => {
            Ok((content_type.to_string(), data.to_string()))
        }
        _ => Err(ApiError::bad_request("Invalid base64 data URL")),
    }
}

/// Sniff a content type from magic bytes
pub fn guess_content_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("image/png");
    }
    if data.starts_with(b"\xff\xd8\xff") {
        return Some("image/jpeg");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        return Some("audio/wav");
    }
    if data.starts_with(b"%PDF-") {
        return Some("application/pdf");
    }
    None
}

fn guess_content_type_from_path(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "pdf" => Some("application/pdf"),
        "wav" => Some("audio/wav"),
        "mp3" => Some("audio/mpeg"),
        "txt" => Some("text/plain"),
        "md" => Some("text/markdown"),
        "csv" => Some("text/csv"),
        "json" => Some("application/json"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_B64: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    #[test]
    fn test_sanitize_data_uri_into_data_and_content_type() {
        let mut file = File::from_url(format!("data:image/png;base64,{PNG_B64}"));
        file.sanitize().unwrap();
        assert_eq!(file.content_type.as_deref(), Some("image/png"));
        assert_eq!(file.data.as_deref(), Some(PNG_B64));
        assert!(file.url.is_none());
    }

    #[test]
    fn test_sanitize_guesses_content_type_from_data() {
        let mut file = File {
            data: Some(PNG_B64.to_string()),
            ..Default::default()
        };
        file.sanitize().unwrap();
        assert_eq!(file.content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_sanitize_infers_content_type_from_url_suffix() {
        let mut file = File::from_url("https://example.com/cat.jpg");
        file.sanitize().unwrap();
        assert_eq!(file.content_type.as_deref(), Some("image/jpeg"));
    }

    #[test]
    fn test_sanitize_infers_content_type_from_query_param() {
        let mut file = File::from_url("https://example.com/blob?content_type=image%2Fwebp");
        file.sanitize().unwrap();
        assert_eq!(file.content_type.as_deref(), Some("image/webp"));
    }

    #[test]
    fn test_sanitize_rejects_non_http_scheme() {
        let mut file = File::from_url("ftp://example.com/cat.png");
        assert!(file.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_rejects_missing_data_and_url() {
        let mut file = File::default();
        assert!(file.sanitize().is_err());
    }

    #[test]
    fn test_sanitize_rejects_invalid_base64() {
        let mut file = File {
            data: Some("not base64!!!".to_string()),
            ..Default::default()
        };
        assert!(file.sanitize().is_err());
    }

    #[test]
    fn test_to_url_prefers_data_uri() {
        let file = File {
            content_type: Some("image/png".to_string()),
            data: Some(PNG_B64.to_string()),
            url: Some("https://example.com/cat.png".to_string()),
            ..Default::default()
        };
        assert_eq!(
            file.to_url(None).unwrap(),
            format!("data:image/png;base64,{PNG_B64}")
        );
    }

    #[test]
    fn test_guess_content_type_magic_bytes() {
        assert_eq!(guess_content_type(b"%PDF-1.4 ..."), Some("application/pdf"));
        assert_eq!(guess_content_type(b"\xff\xd8\xff\xe0rest"), Some("image/jpeg"));
        assert_eq!(guess_content_type(b"plain text"), None);
    }

    #[tokio::test]
    async fn test_download_without_url_fails_as_invalid_file() {
        let mut file = File::default();
        let client = reqwest::Client::new();
        let err = file.download(&client, 2).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidFile);
    }
}
