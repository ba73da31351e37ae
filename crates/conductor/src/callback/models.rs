//! Callback bookkeeping models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::RunStatus;

/// Delivery state of a callback record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackStatus {
    Pending,
    Delivered,
}

impl std::fmt::Display for CallbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackStatus::Pending => write!(f, "pending"),
            CallbackStatus::Delivered => write!(f, "delivered"),
        }
    }
}

impl std::str::FromStr for CallbackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(CallbackStatus::Pending),
            "delivered" => Ok(CallbackStatus::Delivered),
            _ => Err(format!("unknown callback status: {}", s)),
        }
    }
}

/// Snapshot of a child run's terminal result, captured when the callback is
/// enqueued so delivery does not depend on re-reading the child.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChildResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One callback record per terminal child run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRecord {
    pub id: String,
    pub parent_session_id: String,
    pub child_session_id: String,
    pub child_run_id: String,
    pub child_status: RunStatus,
    pub child_result: ChildResult,
    pub status: CallbackStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    /// The resume run this callback produced on the parent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_run_id: Option<String>,
}
