use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while handling a report request
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("recording size {size_bytes} exceeds maximum handleable size {ceiling_bytes}")]
    PayloadTooLarge { size_bytes: u64, ceiling_bytes: u64 },

    #[error("request deadline exhausted before generation could start")]
    DeadlineExceeded,

    #[error("report generation did not complete within the remaining deadline")]
    GenerationTimedOut,

    #[error("report generation failed")]
    GenerationExecutionFailed(#[source] anyhow::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl ReportError {
    /// Short machine-readable code included in error responses
    pub fn code(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::GenerationTimedOut => "GENERATION_TIMED_OUT",
            Self::GenerationExecutionFailed(_) => "GENERATION_FAILED",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::DeadlineExceeded | Self::GenerationTimedOut => StatusCode::GATEWAY_TIMEOUT,
            Self::GenerationExecutionFailed(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ReportError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
