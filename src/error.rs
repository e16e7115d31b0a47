use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::rate_limit::LimiterError;

/// Errors surfaced to clients. Formatting lives here, so middleware and
/// handlers only classify and return them.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    RateLimited { message: String, retry_after: u64 },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::RateLimited {
                message,
                retry_after,
            } => ErrorBody {
                success: false,
                message,
                retry_after: Some(retry_after),
            },
            ApiError::BadRequest(message) => ErrorBody {
                success: false,
                message,
                retry_after: None,
            },
            // don't leak internals to clients
            ApiError::Upstream(_) => ErrorBody {
                success: false,
                message: "Upstream service unavailable".to_string(),
                retry_after: None,
            },
            ApiError::Internal(_) => ErrorBody {
                success: false,
                message: "Internal server error".to_string(),
                retry_after: None,
            },
        };
        (status, Json(body)).into_response()
    }
}
