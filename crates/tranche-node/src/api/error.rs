//! Mapping of domain errors onto HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use tranche_core::{ErrorCategory, TrancheError};

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub category: ErrorCategory,
}

/// A [`TrancheError`] on its way to the client.
#[derive(Debug)]
pub struct ApiError(pub TrancheError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<TrancheError> for ApiError {
    fn from(err: TrancheError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            TrancheError::NotFound { .. } => StatusCode::NOT_FOUND,
            TrancheError::CircularDependency { .. }
            | TrancheError::DependencyNotSatisfied { .. }
            | TrancheError::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            TrancheError::Validation { .. } => StatusCode::BAD_REQUEST,
            TrancheError::Conflict { .. } => StatusCode::CONFLICT,
            err => match err.category() {
                ErrorCategory::Policy | ErrorCategory::Exhausted => StatusCode::CONFLICT,
                ErrorCategory::Transient => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            category: self.0.category(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tranche_core::LedgerError;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (TrancheError::validation("bad"), StatusCode::BAD_REQUEST),
            (TrancheError::not_found("milestone", id), StatusCode::NOT_FOUND),
            (
                TrancheError::DependencyNotSatisfied {
                    milestone_id: id,
                    predecessor_id: id,
                },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (TrancheError::RequestExpired { request_id: id }, StatusCode::CONFLICT),
            (
                TrancheError::Conflict {
                    entity: "execution",
                    id,
                },
                StatusCode::CONFLICT,
            ),
            (LedgerError::timeout("slow").into(), StatusCode::SERVICE_UNAVAILABLE),
            (
                TrancheError::RetriesExhausted {
                    execution_id: id,
                    retries: 3,
                    last_error: "busy".into(),
                },
                StatusCode::CONFLICT,
            ),
            (TrancheError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError(err).status(), expected);
        }
    }
}
