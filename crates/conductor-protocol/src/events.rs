//! Canonical event types.
//!
//! Events are the coordinator's observability backbone. Every event is
//! appended to its session's durable log with a monotonically increasing
//! sequence number, then fanned out to live subscribers. Consumers that fall
//! behind receive a `gap` marker and replay from the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Event envelope
// ============================================================================

/// A sequenced event with routing metadata, as persisted and as pushed on the
/// live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Position in the session's append-only log (1-based, no gaps).
    pub sequence: i64,

    /// Which session this event belongs to.
    pub session_id: String,

    /// When the coordinator sequenced the event (ISO-8601 UTC).
    pub timestamp: DateTime<Utc>,

    /// The event payload.
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

// ============================================================================
// Event payloads
// ============================================================================

/// All event types, tagged by `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    // -- Run lifecycle --
    /// Run began executing on a runner.
    RunStart {
        run_id: String,
        run_number: i64,
        agent_name: String,
    },

    /// Run finished successfully.
    RunCompleted { run_id: String },

    /// Run failed.
    RunFailed { run_id: String, error: String },

    /// Run was stopped before completion.
    RunStopped { run_id: String },

    // -- Execution observability (relayed from runners) --
    /// Executor is about to invoke a tool.
    PreTool {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
    },

    /// Tool invocation finished.
    PostTool {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_output: Option<Value>,
    },

    /// Conversational message produced during execution.
    Message {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        role: MessageRole,
        text: String,
    },

    /// Authoritative terminal result of a run. Exactly one of `result_text`
    /// and `result_data` is non-null.
    Result {
        run_id: String,
        result_text: Option<String>,
        result_data: Option<Value>,
    },

    // -- Hook lifecycle --
    /// A hook invocation started.
    HookStart {
        run_id: String,
        hook_type: String,
        agent_name: String,
    },

    /// A hook invocation finished without blocking.
    HookComplete {
        run_id: String,
        hook_type: String,
        agent_name: String,
    },

    /// A hook invocation errored.
    HookFailed {
        run_id: String,
        hook_type: String,
        agent_name: String,
        error: String,
    },

    /// An `on_run_start` hook blocked the run.
    HookBlocked {
        run_id: String,
        hook_type: String,
        agent_name: String,
        block_reason: String,
    },

    // -- Stream control --
    /// Subscriber overflow marker. Never persisted; pushed as the final
    /// message to a dropped subscriber so it can replay from the log.
    Gap { last_sequence: i64 },
}

impl EventPayload {
    /// Stable wire name of this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunStopped { .. } => "run_stopped",
            Self::PreTool { .. } => "pre_tool",
            Self::PostTool { .. } => "post_tool",
            Self::Message { .. } => "message",
            Self::Result { .. } => "result",
            Self::HookStart { .. } => "hook_start",
            Self::HookComplete { .. } => "hook_complete",
            Self::HookFailed { .. } => "hook_failed",
            Self::HookBlocked { .. } => "hook_blocked",
            Self::Gap { .. } => "gap",
        }
    }

    /// The run this event belongs to, when it is run-scoped.
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunStart { run_id, .. }
            | Self::RunCompleted { run_id }
            | Self::RunFailed { run_id, .. }
            | Self::RunStopped { run_id }
            | Self::Result { run_id, .. }
            | Self::HookStart { run_id, .. }
            | Self::HookComplete { run_id, .. }
            | Self::HookFailed { run_id, .. }
            | Self::HookBlocked { run_id, .. } => Some(run_id),
            Self::PreTool { run_id, .. }
            | Self::PostTool { run_id, .. }
            | Self::Message { run_id, .. } => run_id.as_deref(),
            Self::Gap { .. } => None,
        }
    }

    /// Whether this event may be appended to the durable log. Stream-control
    /// markers are push-only.
    pub fn is_persistable(&self) -> bool {
        !matches!(self, Self::Gap { .. })
    }
}
