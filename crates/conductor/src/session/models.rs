//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::run::RunStatus;

/// Session status, derived from the session's latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No run has started executing yet.
    Pending,
    /// A non-terminal run exists.
    Running,
    /// Latest run completed.
    Finished,
    /// Latest run failed.
    Failed,
    /// Latest run was stopped.
    Stopped,
}

impl SessionStatus {
    /// Project a run's status onto its session.
    pub fn from_run_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending => SessionStatus::Pending,
            RunStatus::Claimed | RunStatus::Running | RunStatus::Stopping => SessionStatus::Running,
            RunStatus::Completed => SessionStatus::Finished,
            RunStatus::Failed => SessionStatus::Failed,
            RunStatus::Stopped => SessionStatus::Stopped,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Finished => "finished",
            SessionStatus::Failed => "failed",
            SessionStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionStatus::Pending),
            "running" => Ok(SessionStatus::Running),
            "finished" => Ok(SessionStatus::Finished),
            "failed" => Ok(SessionStatus::Failed),
            "stopped" => Ok(SessionStatus::Stopped),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

impl TryFrom<String> for SessionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// How a session's terminal runs report back to a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Fire-and-forget; no callback.
    #[default]
    Detached,
    /// On terminal child runs, synthesize a resume run on the parent.
    AsyncCallback,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionMode::Detached => write!(f, "detached"),
            ExecutionMode::AsyncCallback => write!(f, "async_callback"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "detached" => Ok(ExecutionMode::Detached),
            "async_callback" => Ok(ExecutionMode::AsyncCallback),
            _ => Err(format!("unknown execution mode: {}", s)),
        }
    }
}

impl TryFrom<String> for ExecutionMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A conversational container for 1..N runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub agent_name: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub execution_mode: ExecutionMode,
    /// Filled in from the claiming runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_projection() {
        assert_eq!(
            SessionStatus::from_run_status(RunStatus::Claimed),
            SessionStatus::Running
        );
        assert_eq!(
            SessionStatus::from_run_status(RunStatus::Stopping),
            SessionStatus::Running
        );
        assert_eq!(
            SessionStatus::from_run_status(RunStatus::Completed),
            SessionStatus::Finished
        );
        assert_eq!(
            SessionStatus::from_run_status(RunStatus::Failed),
            SessionStatus::Failed
        );
        assert_eq!(
            SessionStatus::from_run_status(RunStatus::Stopped),
            SessionStatus::Stopped
        );
    }

    #[test]
    fn test_execution_mode_wire_names() {
        assert_eq!(
            "async_callback".parse::<ExecutionMode>().unwrap(),
            ExecutionMode::AsyncCallback
        );
        assert_eq!(ExecutionMode::AsyncCallback.to_string(), "async_callback");
        assert_eq!(ExecutionMode::default(), ExecutionMode::Detached);
    }
}
