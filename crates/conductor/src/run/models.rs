//! Run data models and the run state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Run status. Transitions are enforced by [`RunStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, waiting for an eligible runner.
    Pending,
    /// Leased to a runner, execution not yet confirmed.
    Claimed,
    /// Executing on a runner.
    Running,
    /// Cancellation requested, waiting for the runner to acknowledge.
    Stopping,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Terminal cancellation.
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Non-terminal: occupies the session's single active slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Legal state machine edges:
    ///
    /// ```text
    /// pending ──► claimed ──► running ──► {completed|failed|stopping}
    ///                                         │
    ///                                    stopping ──► stopped
    /// pending ──► failed            (dispatch timeout)
    /// pending ──► stopped           (stopped before claim)
    /// claimed ──► failed            (runner disconnect, lease expired)
    /// claimed ──► stopping
    /// running ──► failed            (runner disconnect)
    /// ```
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Pending => matches!(next, Claimed | Failed | Stopped),
            Claimed => matches!(next, Running | Failed | Stopping),
            Running => matches!(next, Completed | Failed | Stopping),
            Stopping => matches!(next, Stopped | Failed),
            Completed | Failed | Stopped => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Claimed => "claimed",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "claimed" => Ok(RunStatus::Claimed),
            "running" => Ok(RunStatus::Running),
            "stopping" => Ok(RunStatus::Stopping),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "stopped" => Ok(RunStatus::Stopped),
            _ => Err(format!("unknown run status: {}", s)),
        }
    }
}

impl TryFrom<String> for RunStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Whether a run starts a new session or resumes an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    StartSession,
    ResumeSession,
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunType::StartSession => write!(f, "start_session"),
            RunType::ResumeSession => write!(f, "resume_session"),
        }
    }
}

impl std::str::FromStr for RunType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "start_session" => Ok(RunType::StartSession),
            "resume_session" => Ok(RunType::ResumeSession),
            _ => Err(format!("unknown run type: {}", s)),
        }
    }
}

impl TryFrom<String> for RunType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single unit of work within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub session_id: String,
    /// 1-based, contiguous and monotonic within the session.
    pub run_number: i64,
    #[serde(rename = "type")]
    pub run_type: RunType,
    pub parameters: Value,
    /// Opaque string map propagated to the executor environment and to
    /// child runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<HashMap<String, String>>,
    /// Caller-provided context passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub status: RunStatus,
    /// False while an `on_run_start` hook gates dispatch.
    #[serde(skip)]
    pub dispatchable: bool,
    #[serde(skip)]
    pub dispatch_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
    /// Blueprint snapshot resolved at creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_blueprint: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
        assert!(RunStatus::Stopping.is_active());
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Claimed));
        assert!(RunStatus::Claimed.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_failure_edges() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Claimed.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Failed));
        assert!(RunStatus::Stopping.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn test_stop_edges() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Stopped));
        assert!(RunStatus::Claimed.can_transition_to(RunStatus::Stopping));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Stopping));
        assert!(RunStatus::Stopping.can_transition_to(RunStatus::Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Stopped.can_transition_to(RunStatus::Stopping));
        assert!(!RunStatus::Stopping.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(RunType::StartSession.to_string(), "start_session");
        assert_eq!(
            serde_json::to_value(RunStatus::Stopping).unwrap(),
            serde_json::json!("stopping")
        );
    }
}
