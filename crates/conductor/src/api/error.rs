//! Unified API error handling with structured responses.
//!
//! Semantic failures carry a stable `error` discriminator; everything else
//! surfaces as a 500 with a correlation ID and no partial state.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::error::CoordinatorError;
use crate::ids;

/// API error type with structured responses.
#[derive(Debug)]
pub enum ApiError {
    /// A typed coordinator failure with a stable discriminator.
    Coordinator(CoordinatorError),
    Unauthorized(String),
    /// Anything unexpected: logged, surfaced with a correlation ID.
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Coordinator(err) => match err {
                CoordinatorError::AgentNotFound(_)
                | CoordinatorError::SessionNotFound(_)
                | CoordinatorError::RunNotFound(_)
                | CoordinatorError::RunnerNotFound(_) => StatusCode::NOT_FOUND,
                CoordinatorError::AgentNameCollision { .. }
                | CoordinatorError::SessionConflict(_) => StatusCode::CONFLICT,
                CoordinatorError::ParameterValidationFailed { .. }
                | CoordinatorError::PlaceholderUnresolved { .. }
                | CoordinatorError::InvalidRequest(_)
                | CoordinatorError::InvalidBlueprint(_) => StatusCode::BAD_REQUEST,
            },
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> Value {
        match self {
            Self::Coordinator(err) => match err {
                CoordinatorError::ParameterValidationFailed {
                    agent_name,
                    validation_errors,
                    parameters_schema,
                } => json!({
                    "error": err.discriminator(),
                    "agent_name": agent_name,
                    "validation_errors": validation_errors,
                    "parameters_schema": parameters_schema,
                }),
                CoordinatorError::AgentNameCollision { names } => json!({
                    "error": err.discriminator(),
                    "message": err.to_string(),
                    "agent_names": names,
                }),
                CoordinatorError::PlaceholderUnresolved { references } => json!({
                    "error": err.discriminator(),
                    "message": err.to_string(),
                    "references": references,
                }),
                other => json!({
                    "error": other.discriminator(),
                    "message": other.to_string(),
                }),
            },
            Self::Unauthorized(msg) => json!({
                "error": "unauthorized",
                "message": msg,
            }),
            Self::Internal { correlation_id, .. } => json!({
                "error": "internal_error",
                "message": "internal server error",
                "correlation_id": correlation_id,
            }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match &self {
            ApiError::Internal {
                correlation_id,
                message,
            } => {
                error!(correlation_id = %correlation_id, message = %message, "API error");
            }
            other => {
                debug!(status = %status, "Client error: {:?}", other);
            }
        }

        (status, Json(self.body())).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CoordinatorError>() {
            Ok(coord) => ApiError::Coordinator(coord),
            Err(err) => ApiError::Internal {
                correlation_id: ids::correlation_id(),
                message: format!("{:#}", err),
            },
        }
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(err: CoordinatorError) -> Self {
        ApiError::Coordinator(err)
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_error_mapping() {
        let err: ApiError = anyhow::Error::from(CoordinatorError::RunNotFound("run_x".into())).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.body()["error"], "run_not_found");
    }

    #[test]
    fn test_collision_is_conflict() {
        let err: ApiError = CoordinatorError::AgentNameCollision {
            names: vec!["web-crawler".into()],
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.body()["agent_names"][0], "web-crawler");
    }

    #[test]
    fn test_validation_body_echoes_schema() {
        let err: ApiError = CoordinatorError::ParameterValidationFailed {
            agent_name: "researcher".into(),
            validation_errors: vec![],
            parameters_schema: json!({"type": "object"}),
        }
        .into();
        let body = err.body();
        assert_eq!(body["error"], "parameter_validation_failed");
        assert_eq!(body["parameters_schema"]["type"], "object");
    }

    #[test]
    fn test_unexpected_error_gets_correlation_id() {
        let err: ApiError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = err.body();
        assert_eq!(body["error"], "internal_error");
        assert!(body["correlation_id"].as_str().unwrap().starts_with("corr_"));
        // The raw message never leaks to the client.
        assert_eq!(body["message"], "internal server error");
    }
}
