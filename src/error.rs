//! Error taxonomy surfaced to API callers and shared across the gateway
//!
//! Two layers:
//! - `ApiError`: the caller-facing error with a stable `code`, an HTTP status
//!   and an optional details payload. Serialized as `{"error": {...}}`.
//! - `ProviderError`: errors raised while talking to an upstream LLM
//!   provider, carrying the raw upstream payload and retry information. They
//!   convert into `ApiError` at the edge.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable error codes surfaced to callers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    AuthenticationFailed,
    ObjectNotFound,
    EntityTooLarge,
    UnsupportedJsonSchema,
    DuplicateValue,
    ProviderDoesNotSupportModel,
    NoProviderSupportingModel,
    InvalidFile,
    InvalidRunProperties,
    InvalidQuery,
    InternalError,
    OperationTimeout,
    ContentModeration,
    MaxTokensExceeded,
}

impl ErrorCode {
    /// HTTP status associated with the code
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::BadRequest
            | ErrorCode::DuplicateValue
            | ErrorCode::ProviderDoesNotSupportModel
            | ErrorCode::NoProviderSupportingModel
            | ErrorCode::InvalidFile
            | ErrorCode::InvalidRunProperties
            | ErrorCode::InvalidQuery
            | ErrorCode::ContentModeration
            | ErrorCode::MaxTokensExceeded => StatusCode::BAD_REQUEST,
            ErrorCode::AuthenticationFailed => StatusCode::UNAUTHORIZED,
            ErrorCode::ObjectNotFound => StatusCode::NOT_FOUND,
            ErrorCode::EntityTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::UnsupportedJsonSchema => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::OperationTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether errors of this code should be captured to telemetry
    pub fn captured(&self) -> bool {
        matches!(
            self,
            ErrorCode::AuthenticationFailed
                | ErrorCode::DuplicateValue
                | ErrorCode::InternalError
                | ErrorCode::OperationTimeout
        )
    }
}

/// Caller-facing error
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Included in the response body
    pub details: Option<Value>,
    /// Overrides the default capture behavior of the code
    capture: Option<bool>,
    /// Forwarded as `Retry-After` on 429-ish responses
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            capture: None,
            retry_after: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn object_not_found(object_type: &str) -> Self {
        Self::new(ErrorCode::ObjectNotFound, format!("{object_type} not found"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn invalid_file(message: impl Into<String>, file_url: Option<&str>) -> Self {
        Self::new(ErrorCode::InvalidFile, message)
            .with_details(serde_json::json!({ "file_url": file_url }))
    }

    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AuthenticationFailed, message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_capture(mut self, capture: bool) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    pub fn captured(&self) -> bool {
        self.capture.unwrap_or_else(|| self.code.captured())
    }

    /// Log the error if its code is marked for capture. Details intended for
    /// the response are included; raw secrets never travel through `details`.
    pub fn capture_if_needed(&self) {
        if self.captured() {
            tracing::error!(
                code = ?self.code,
                details = ?self.details,
                "captured error: {}",
                self.message
            );
        }
    }

    /// Response body of shape `{"error": {...}}`
    pub fn serialized(&self) -> Value {
        serde_json::json!({
            "error": {
                "status_code": self.status_code().as_u16(),
                "code": self.code,
                "message": self.message,
                "details": self.details,
            }
        })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.capture_if_needed();
        let mut response = (self.status_code(), Json(self.serialized())).into_response();
        if let Some(retry_after) = self.retry_after {
            if let Ok(value) = retry_after.as_secs().to_string().parse() {
                response.headers_mut().insert("retry-after", value);
            }
        }
        response
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => ApiError::object_not_found("row"),
            other => ApiError::internal(format!("database error: {other}")),
        }
    }
}

/// Provider-agnostic error kinds, one per upstream failure family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    MaxTokensExceeded,
    ProviderInternal,
    ProviderBadRequest,
    ProviderInvalidFile,
    ModelDoesNotSupportMode,
    StructuredGeneration,
    ContentModeration,
    FailedGeneration,
    InvalidGeneration,
    MissingModel,
    /// The token count for a run cannot be computed locally
    UnpriceableRun,
    RateLimited,
    Connection,
    Timeout,
    InvalidProviderConfig,
    Unknown,
}

/// Error raised while building a request for, calling, or parsing a response
/// from an upstream provider
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Raw upstream response body, kept for triage
    pub raw: Option<String>,
    pub retry_after: Option<Duration>,
    pub capture: bool,
    /// Extra context sent to telemetry, never to the caller
    pub extras: Option<Value>,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            raw: None,
            retry_after: None,
            capture: false,
            extras: None,
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_capture(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn with_extras(mut self, extras: Value) -> Self {
        self.extras = Some(extras);
        self
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unknown, message)
    }

    /// Whether the runner may retry this error on another provider or model.
    /// Rate limits only count when the upstream promises a short retry window.
    pub fn is_recoverable(&self) -> bool {
        match self.kind {
            ProviderErrorKind::ProviderInternal
            | ProviderErrorKind::ModelDoesNotSupportMode
            | ProviderErrorKind::Connection
            | ProviderErrorKind::Timeout
            | ProviderErrorKind::Unknown => true,
            ProviderErrorKind::RateLimited => {
                self.retry_after.map_or(true, |d| d <= Duration::from_secs(10))
            }
            _ => false,
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        let code = match e.kind {
            ProviderErrorKind::MaxTokensExceeded => ErrorCode::MaxTokensExceeded,
            ProviderErrorKind::ContentModeration => ErrorCode::ContentModeration,
            ProviderErrorKind::ProviderBadRequest
            | ProviderErrorKind::ModelDoesNotSupportMode
            | ProviderErrorKind::StructuredGeneration
            | ProviderErrorKind::FailedGeneration
            | ProviderErrorKind::InvalidGeneration
            | ProviderErrorKind::RateLimited => ErrorCode::BadRequest,
            ProviderErrorKind::ProviderInvalidFile => ErrorCode::InvalidFile,
            ProviderErrorKind::MissingModel => ErrorCode::NoProviderSupportingModel,
            ProviderErrorKind::InvalidProviderConfig
            | ProviderErrorKind::ProviderInternal
            | ProviderErrorKind::Connection
            | ProviderErrorKind::UnpriceableRun
            | ProviderErrorKind::Unknown => ErrorCode::InternalError,
            ProviderErrorKind::Timeout => ErrorCode::OperationTimeout,
        };
        let capture = e.capture;
        ApiError::new(code, e.message)
            .with_capture(capture)
            .with_retry_after(e.retry_after)
    }
}
