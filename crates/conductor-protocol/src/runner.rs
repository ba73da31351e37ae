//! Runner wire protocol types.
//!
//! Runners register with the coordinator, heartbeat to stay alive, long-poll
//! for claimable runs, report state transitions, and stream events through
//! the ingress endpoint. All of it is plain HTTP + JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::agent::AgentBlueprint;
use crate::events::EventPayload;

/// Runner lifecycle as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Active,
    /// Missed at least one heartbeat window; warning only.
    Stale,
    /// Purged from the registry; its runs were failed.
    Removed,
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerStatus::Active => write!(f, "active"),
            RunnerStatus::Stale => write!(f, "stale"),
            RunnerStatus::Removed => write!(f, "removed"),
        }
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(RunnerStatus::Active),
            "stale" => Ok(RunnerStatus::Stale),
            "removed" => Ok(RunnerStatus::Removed),
            _ => Err(format!("unknown runner status: {}", s)),
        }
    }
}

impl TryFrom<String> for RunnerStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Runner registration (sent on connect and on re-register).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunnerRequest {
    /// Present on re-registration; replaces the declared agents atomically.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,

    /// Hostname of the machine running the runner.
    pub hostname: String,

    /// Project directory the runner executes in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,

    /// Capability tags.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Executor profile this runner provides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_profile: Option<String>,

    /// Executor descriptor. Opaque to the coordinator except for profile
    /// matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<Value>,

    /// When true, a run is eligible only if its tags intersect this
    /// runner's tags.
    #[serde(default)]
    pub require_matching_tags: bool,

    /// Blueprints this runner declares. Name collisions with other runners
    /// reject the whole registration.
    #[serde(default)]
    pub agents: Vec<AgentBlueprint>,
}

/// Coordinator acknowledgment of a registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRunnerResponse {
    /// Assigned (or echoed) registration ID, `lnch_` prefixed.
    pub runner_id: String,

    /// How often the runner must heartbeat to stay active.
    pub heartbeat_interval_seconds: u64,
}

/// Periodic liveness report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub runner_id: String,
}

/// A claimed run handed to a runner, with the resolved blueprint snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedRun {
    pub run_id: String,
    pub session_id: String,
    pub run_number: i64,
    #[serde(rename = "type")]
    pub run_type: String,
    pub parameters: Value,
    /// Opaque key-value map propagated to the executor environment and to
    /// child runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<HashMap<String, String>>,
    /// Caller-provided context passthrough.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub blueprint: crate::agent::ResolvedBlueprint,
}

/// Terminal success report. When the runner has not already emitted a
/// `result` event through the ingress, the coordinator synthesizes one from
/// this body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompleteRunRequest {
    pub runner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
}

/// Terminal failure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailRunRequest {
    pub runner_id: String,
    pub error: String,
}

/// Transition-to-running report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerReport {
    pub runner_id: String,
}

/// One event to ingest, with an optional runner-side timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Batch event ingress for one session, appended in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEventsRequest {
    pub session_id: String,
    pub events: Vec<IngestEvent>,
}
