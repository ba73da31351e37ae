//! Hook invocation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_protocol::HookOutcome;

/// Which hook point fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    OnRunStart,
    OnRunFinish,
}

impl std::fmt::Display for HookPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookPoint::OnRunStart => write!(f, "on_run_start"),
            HookPoint::OnRunFinish => write!(f, "on_run_finish"),
        }
    }
}

impl std::str::FromStr for HookPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "on_run_start" => Ok(HookPoint::OnRunStart),
            "on_run_finish" => Ok(HookPoint::OnRunFinish),
            _ => Err(format!("unknown hook point: {}", s)),
        }
    }
}

/// One record per hook invocation, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRecord {
    pub id: String,
    pub run_id: String,
    pub hook_type: HookPoint,
    pub target_agent: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<HookOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
