//! Error types for providers, request validation and the HTTP boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Longest backend error body carried into a frame message.
const MAX_BODY_CHARS: usize = 300;

/// Failure of a single provider call. Always surfaced to the caller as a
/// terminal `error` frame, never re-raised past the provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Backend unreachable, timed out, or the body stream broke.
    #[error("Backend unreachable: {0}")]
    Network(String),

    /// No headers or body bytes for longer than the idle timeout.
    #[error("Backend stream stalled for {0}s")]
    Stalled(u64),

    /// Backend answered with a non-2xx status.
    #[error("Backend rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    /// Accumulated model output held no recoverable JSON.
    #[error("Model response did not contain valid JSON")]
    MalformedOutput,

    /// Local OCR bridge not ready or answered with something unusable.
    #[error("Local OCR bridge error: {0}")]
    Bridge(String),
}

impl ProviderError {
    pub fn rejected(status: reqwest::StatusCode, body: &str) -> Self {
        Self::Rejected {
            status: status.as_u16(),
            body: body.chars().take(MAX_BODY_CHARS).collect(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Network(format!("request timed out: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Inbound request failed schema validation.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Invalid request: {0}")]
    Invalid(String),
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RequestError> for ApiError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Invalid(msg) => ApiError::BadRequest(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Other(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_body_is_truncated() {
        let body = "x".repeat(1000);
        let err = ProviderError::rejected(reqwest::StatusCode::BAD_GATEWAY, &body);
        match err {
            ProviderError::Rejected { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body.len(), MAX_BODY_CHARS);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_request_error_maps_to_bad_request() {
        let api: ApiError = RequestError::Invalid("model is required".into()).into();
        assert_eq!(api.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
