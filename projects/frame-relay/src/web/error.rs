use crate::error::{PipelineError, QueueError, ReassemblyError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error type for HTTP handlers. Renders as `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError::Internal(format!("background task failed: {}", e))
    }
}

fn classify(err: &PipelineError) -> (StatusCode, &'static str) {
    match err {
        PipelineError::Source(_) => (StatusCode::UNPROCESSABLE_ENTITY, "SOURCE_ERROR"),
        PipelineError::Queue(QueueError::Unavailable(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_UNAVAILABLE")
        }
        PipelineError::Reassembly(ReassemblyError::NoFrames) => {
            (StatusCode::BAD_REQUEST, "NO_FRAMES")
        }
        PipelineError::Reassembly(ReassemblyError::DimensionMismatch { .. }) => {
            (StatusCode::UNPROCESSABLE_ENTITY, "DIMENSION_MISMATCH")
        }
        PipelineError::Config(_) => (StatusCode::BAD_REQUEST, "INVALID_CONFIG"),
        PipelineError::NotReady(_) => (StatusCode::NOT_FOUND, "NOT_READY"),
        PipelineError::NoActiveRun => (StatusCode::CONFLICT, "NO_ACTIVE_RUN"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Pipeline(err) => {
                let (status, code) = classify(err);
                if status.is_server_error() {
                    tracing::error!(error = %err, "Pipeline error");
                }
                (status, code, err.to_string())
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}
