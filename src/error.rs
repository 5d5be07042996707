use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("too many concurrent runs")]
    RateLimited,

    #[error("no runner capacity available")]
    RunnerUnavailable,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Stable machine-readable code used in the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound => "not_found",
            ApiError::RateLimited => "rate_limited",
            ApiError::RunnerUnavailable => "runner_unavailable",
            ApiError::Store(StoreError::NotFound) => "not_found",
            ApiError::Store(_) | ApiError::Io(_) | ApiError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RunnerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Store(_) | ApiError::Io(_) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Attach structured details (field names, offending values).
    pub fn with_details(self, details: serde_json::Value) -> DetailedError {
        DetailedError {
            error: self,
            details: Some(details),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        DetailedError {
            error: self,
            details: None,
        }
        .into_response()
    }
}

/// An ApiError plus optional structured details for the envelope.
#[derive(Debug)]
pub struct DetailedError {
    pub error: ApiError,
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for DetailedError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let body = serde_json::json!({
            "error": {
                "code": self.error.code(),
                "message": self.error.to_string(),
                "details": self.details.unwrap_or_else(|| serde_json::json!({})),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

impl From<ApiError> for DetailedError {
    fn from(error: ApiError) -> Self {
        DetailedError {
            error,
            details: None,
        }
    }
}
