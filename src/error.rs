use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors reported synchronously to HTTP callers.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("failed to fetch audio: {0}")]
    Fetch(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("other: {0}")]
    Other(String),
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::UnknownJob(_) | ServiceError::FileNotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Fetch(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Errors raised inside a background separation job. They never reach the
/// HTTP layer directly; the orchestrator records their text on the task.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("unknown model key: {0}")]
    UnknownModelKey(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("audio decode failed: {0}")]
    Decode(String),
    #[error("invalid time window: {0}")]
    InvalidWindow(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("stem reconciliation failed: {0}")]
    Reconcile(String),
    #[error("audio encode failed: {0}")]
    Encode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by the inference capability.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
