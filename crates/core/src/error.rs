use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::envelope::error_envelope;

/// Unified error type for all proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("no available channels")]
    NoAvailableChannel,

    #[error("{0}")]
    Network(String),

    #[error("upstream stream ended before first byte")]
    StreamEnded,

    #[error("failed to parse upstream response")]
    UpstreamParse(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NoAvailableChannel => StatusCode::SERVICE_UNAVAILABLE,
            Self::Network(_) | Self::StreamEnded | Self::UpstreamParse(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = error_envelope(&self.to_string());
        (
            self.status_code(),
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::Network(format!("connection failed: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}
