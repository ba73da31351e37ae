//! Coordinator error taxonomy.
//!
//! Services return `anyhow::Result`; semantic failures are wrapped
//! `CoordinatorError` values so the API layer can downcast and map them onto
//! the stable wire discriminators instead of sniffing message strings.

use serde_json::Value;

use crate::agent::schema::ValidationErrorDetail;

/// Run failure messages with a fixed wire form.
pub const ERR_RUNNER_DISCONNECTED: &str = "Runner disconnected during execution";
pub const ERR_NO_RUNNER_AVAILABLE: &str = "No matching runner available within timeout";
pub const ERR_LEASE_EXPIRED: &str = "Run lease expired before runner confirmed execution";

/// Semantic coordinator failures. Each variant maps onto one stable `error`
/// discriminator at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("runner not found: {0}")]
    RunnerNotFound(String),

    #[error("agent names already declared by another runner: {}", names.join(", "))]
    AgentNameCollision { names: Vec<String> },

    #[error("parameters for agent '{agent_name}' failed validation")]
    ParameterValidationFailed {
        agent_name: String,
        validation_errors: Vec<ValidationErrorDetail>,
        parameters_schema: Value,
    },

    #[error("unresolved blueprint placeholders: {}", references.join(", "))]
    PlaceholderUnresolved { references: Vec<String> },

    #[error("session conflict: {0}")]
    SessionConflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),
}

impl CoordinatorError {
    /// Stable wire discriminator for this error.
    pub fn discriminator(&self) -> &'static str {
        match self {
            Self::AgentNotFound(_) => "agent_not_found",
            Self::SessionNotFound(_) => "session_not_found",
            Self::RunNotFound(_) => "run_not_found",
            Self::RunnerNotFound(_) => "runner_not_found",
            Self::AgentNameCollision { .. } => "agent_name_collision",
            Self::ParameterValidationFailed { .. } => "parameter_validation_failed",
            Self::PlaceholderUnresolved { .. } => "placeholder_unresolved",
            Self::SessionConflict(_) => "session_conflict",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidBlueprint(_) => "invalid_blueprint",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discriminators_are_stable() {
        let err = CoordinatorError::AgentNotFound("researcher".to_string());
        assert_eq!(err.discriminator(), "agent_not_found");

        let err = CoordinatorError::AgentNameCollision {
            names: vec!["web-crawler".to_string()],
        };
        assert_eq!(err.discriminator(), "agent_name_collision");
        assert!(err.to_string().contains("web-crawler"));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = CoordinatorError::RunNotFound("run_x".to_string()).into();
        let coord = err.downcast_ref::<CoordinatorError>().unwrap();
        assert_eq!(coord.discriminator(), "run_not_found");
    }
}
