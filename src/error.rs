use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubwardenError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid authentication credentials")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Job not cancellable: {job_id} (current state: {current_state})")]
    JobNotCancellable {
        job_id: String,
        current_state: String,
    },

    #[error("Job not retriable: {job_id} (current state: {current_state})")]
    JobNotRetriable {
        job_id: String,
        current_state: String,
    },

    #[error("Folder outside allowed media folders: {0}")]
    UnauthorizedPath(String),

    #[error("Folder not found: {0}")]
    PathNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Log bus error: {0}")]
    LogBus(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Translation error: {0}")]
    Translation(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Cancellation error: {0}")]
    Cancellation(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubwardenError {
    /// Stable machine-readable code used in the HTTP error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            SubwardenError::Validation(_) => "INVALID_INPUT",
            SubwardenError::Unauthorized => "UNAUTHORIZED",
            SubwardenError::Forbidden(_) => "FORBIDDEN",
            SubwardenError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SubwardenError::JobNotCancellable { .. } => "JOB_NOT_CANCELLABLE",
            SubwardenError::JobNotRetriable { .. } => "JOB_NOT_RETRIABLE",
            SubwardenError::UnauthorizedPath(_) => "UNAUTHORIZED_PATH",
            SubwardenError::PathNotFound(_) => "PATH_NOT_FOUND",
            SubwardenError::Database(_) => "DATABASE_ERROR",
            SubwardenError::Broker(_) => "BROKER_ERROR",
            SubwardenError::LogBus(_) => "LOG_BUS_ERROR",
            SubwardenError::Process(_) => "PROCESS_ERROR",
            SubwardenError::Provider(_) => "PROVIDER_ERROR",
            SubwardenError::Translation(_) => "TRANSLATION_ERROR",
            SubwardenError::Sync(_) => "SYNC_ERROR",
            SubwardenError::Timeout(_) => "TIMEOUT",
            SubwardenError::Cancellation(_) => "CANCELLED",
            SubwardenError::Io(_) => "IO_ERROR",
            SubwardenError::Serialization(_) => "SERIALIZATION_ERROR",
            SubwardenError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            SubwardenError::Validation(_) => StatusCode::BAD_REQUEST,
            SubwardenError::Unauthorized => StatusCode::UNAUTHORIZED,
            SubwardenError::Forbidden(_) => StatusCode::FORBIDDEN,
            SubwardenError::JobNotFound { .. } => StatusCode::NOT_FOUND,
            SubwardenError::JobNotCancellable { .. } => StatusCode::BAD_REQUEST,
            SubwardenError::JobNotRetriable { .. } => StatusCode::BAD_REQUEST,
            SubwardenError::UnauthorizedPath(_) => StatusCode::FORBIDDEN,
            SubwardenError::PathNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for SubwardenError {
    fn from(err: std::io::Error) -> Self {
        SubwardenError::Io(err.to_string())
    }
}

impl From<sqlx::Error> for SubwardenError {
    fn from(err: sqlx::Error) -> Self {
        SubwardenError::Database(err.to_string())
    }
}

impl IntoResponse for SubwardenError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SubwardenError>;
