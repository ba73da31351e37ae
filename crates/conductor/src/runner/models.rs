//! Runner registration data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use conductor_protocol::RunnerStatus;

/// A registered runner, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_profile: Option<String>,
    /// Opaque executor descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<Value>,
    #[serde(default)]
    pub require_matching_tags: bool,
    pub status: RunnerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

/// In-memory registry projection of a runner, including its declared agent
/// names.
#[derive(Debug, Clone)]
pub struct RunnerInfo {
    pub runner: Runner,
    pub agent_names: HashSet<String>,
}

impl RunnerInfo {
    pub fn declares(&self, agent_name: &str) -> bool {
        self.agent_names.contains(agent_name)
    }
}
