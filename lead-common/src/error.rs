use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::RawRecord;
use crate::store::StoreError;

/// Enumeration of errors returned to callers of pipeline operations.
///
/// Per-record failures (`RowError`) and per-endpoint failures (`DeliveryError`) never show
/// up here: they are captured into the audit log instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    /// A run was aborted before it could classify its records. `log_id` is the ImportJob
    /// the failure was recorded against, if one had been created.
    #[error("import aborted: {reason}")]
    Aborted { log_id: Option<Uuid>, reason: String },
    /// The request clashes with work already recorded, e.g. retrying a log twice.
    #[error("{0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        PipelineError::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// A single record that could not be mapped or persisted, as kept in `details.errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub record: RawRecord,
    pub error: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound { .. } | PipelineError::Store(StoreError::Missing { .. }) => {
                StatusCode::NOT_FOUND
            }
            PipelineError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Conflict(_) | PipelineError::Store(StoreError::Conflict(_)) => {
                StatusCode::CONFLICT
            }
            PipelineError::Aborted { .. } | PipelineError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (PipelineError::validation("rows must not be empty"), StatusCode::BAD_REQUEST),
            (
                PipelineError::not_found("lead source", Uuid::nil()),
                StatusCode::NOT_FOUND,
            ),
            (
                PipelineError::Store(StoreError::Unavailable("down".to_owned())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                PipelineError::Conflict("already retried".to_owned()),
                StatusCode::CONFLICT,
            ),
            (
                PipelineError::Aborted {
                    log_id: None,
                    reason: "boom".to_owned(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }

    #[test]
    fn test_not_found_message() {
        let error = PipelineError::not_found("webhook", Uuid::nil());
        assert_eq!(
            error.to_string(),
            "webhook 00000000-0000-0000-0000-000000000000 not found"
        );
    }
}
