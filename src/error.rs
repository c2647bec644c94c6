//! Error types shared by the CLI and the HTTP trigger

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a collection run could not start or finish
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("no GitHub token configured (set GITHUB_TOKEN or run `gh auth login`)")]
    MissingToken,

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Error body returned by the HTTP surface
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Collect(CollectError::MissingToken) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "MISSING_TOKEN")
            }
            ApiError::Collect(CollectError::Store(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR")
            }
            ApiError::Other(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": self.to_string(),
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
