use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::domain::{FactError, RunId};
use crate::error::EngineError;
use crate::rules::ValidationError;

use super::response::ErrorResponse;

/// Errors returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A run was created but did not produce a decision
    #[error("{source}")]
    Run { run_id: RunId, source: EngineError },

    #[error("invalid facts: {0}")]
    Facts(#[from] FactError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    fn engine_status(err: &EngineError) -> (StatusCode, &'static str) {
        match err {
            EngineError::Validation(ValidationError::VersionConflict { .. }) => {
                (StatusCode::CONFLICT, "VERSION_CONFLICT")
            }
            EngineError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_FAILED"),
            EngineError::MissingFact { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "MISSING_FACT"),
            EngineError::Evaluation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "EVALUATION_FAILED"),
            EngineError::CapacityExceeded { .. } => {
                (StatusCode::TOO_MANY_REQUESTS, "CAPACITY_EXCEEDED")
            }
            EngineError::Cancelled { .. } => (StatusCode::ACCEPTED, "PENDING"),
            EngineError::Persistence(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "PERSISTENCE_UNAVAILABLE")
            }
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        }
    }

    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Engine(err) => Self::engine_status(err),
            ApiError::Run { source, .. } => Self::engine_status(source),
            ApiError::Facts(_) => (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_FACTS"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();

        let mut body = ErrorResponse::new(self.to_string(), code);
        if let ApiError::Run { run_id, .. } = &self {
            body.run_id = Some(*run_id);
        }

        (status, Json(body)).into_response()
    }
}
