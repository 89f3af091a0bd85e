use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum EmbedditError {
    /// Token endpoint returned a non-success response or the exchange failed
    #[error("Access token request failed: {0}")]
    AuthError(String),

    /// Upstream HTTP request failed (network error or non-2xx)
    #[error("Upstream request failed: {0}")]
    UpstreamError(#[from] reqwest::Error),

    /// External transcoder exited non-zero or could not be spawned
    #[error("Video conversion failed: {0}")]
    TranscodeError(String),

    /// A path segment contained characters outside the allowed media id set
    #[error("Invalid media id: {0}")]
    InvalidMediaId(String),

    /// Disk I/O while serving a cached file
    #[error("Cache I/O error: {0}")]
    CacheIoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EmbedditError>;

impl EmbedditError {
    /// HTTP status this error surfaces as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            EmbedditError::AuthError(_) | EmbedditError::UpstreamError(_) => {
                StatusCode::BAD_GATEWAY
            }
            EmbedditError::TranscodeError(_) | EmbedditError::CacheIoError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EmbedditError::InvalidMediaId(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for EmbedditError {
    fn into_response(self) -> Response {
        let message = match &self {
            EmbedditError::AuthError(_) | EmbedditError::UpstreamError(_) => {
                "Upstream request failed"
            }
            EmbedditError::TranscodeError(_) => "Video conversion failed",
            EmbedditError::InvalidMediaId(_) => "Invalid media id",
            EmbedditError::CacheIoError(_) => "Internal server error",
        };

        error!("Request failed: {}", self);
        (self.status_code(), message).into_response()
    }
}
