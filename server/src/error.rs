use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pipeline_core::PipelineError;
use serde::Serialize;
use thiserror::Error;

/// API Error types
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The chapter cannot be produced as asked, e.g. some chunks failed.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    EngineUnavailable(String),

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidInput(msg) => ApiError::InvalidInput(msg),
            PipelineError::NotFound(what) => ApiError::NotFound(what),
            PipelineError::Chunking { .. } | PipelineError::AssemblyIncomplete { .. } => {
                ApiError::Conflict(err.to_string())
            }
            PipelineError::Cancelled => ApiError::Conflict(err.to_string()),
            PipelineError::EngineUnavailable { .. } => ApiError::EngineUnavailable(err.to_string()),
            PipelineError::EngineRejected(_) | PipelineError::EngineFailed(_) => {
                ApiError::EngineError(err.to_string())
            }
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

/// Error response structure
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::EngineError(_) => StatusCode::BAD_GATEWAY,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_errors_map_to_statuses() {
        let unavailable = ApiError::from(PipelineError::EngineUnavailable {
            endpoint: "http://127.0.0.1:50021".into(),
            reason: "connection refused".into(),
        });
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let missing = ApiError::from(PipelineError::NotFound("book x".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let incomplete = ApiError::from(PipelineError::AssemblyIncomplete {
            chapter: "01.txt".into(),
            missing: 1,
            total: 4,
        });
        assert_eq!(incomplete.status(), StatusCode::CONFLICT);
    }
}
