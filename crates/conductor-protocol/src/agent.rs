//! Agent blueprint types.
//!
//! A blueprint is the static definition of a task: its name, type, schemas,
//! system prompt, capability demands, and hooks. Blueprints are either
//! admin-owned (materialised as files by the coordinator) or declared by a
//! runner at registration time. Runners and admin clients both ship this
//! shape over the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;

/// Agent execution style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Interprets free-form intent; input defaults to `{prompt: string}`.
    Autonomous,
    /// Follows a fixed procedure with structured parameters and a declared
    /// output schema.
    Procedural,
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentType::Autonomous => write!(f, "autonomous"),
            AgentType::Procedural => write!(f, "procedural"),
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "autonomous" => Ok(AgentType::Autonomous),
            "procedural" => Ok(AgentType::Procedural),
            _ => Err(format!("unknown agent type: {}", s)),
        }
    }
}

impl TryFrom<String> for AgentType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Capability requirements a run inherits from its blueprint. A runner is
/// eligible only if it satisfies every present demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentDemands {
    /// Exact hostname match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Exact project directory match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_dir: Option<String>,
    /// Exact executor profile match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_profile: Option<String>,
    /// Required tags; must be a subset of the runner's tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl AgentDemands {
    pub fn is_empty(&self) -> bool {
        self.hostname.is_none()
            && self.project_dir.is_none()
            && self.executor_profile.is_none()
            && self.tags.is_empty()
    }
}

/// How a hook is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    /// Invoke another agent as a nested synchronous coordinator run.
    Agent,
    /// Reserved: outbound webhook. Rejected at registration until supported.
    Http,
}

/// What happens when a hook invocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookOnError {
    /// The run fails with `hook_failed`.
    Block,
    /// The error is logged and the run proceeds unchanged.
    #[default]
    Ignore,
}

/// A single hook declaration on a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookSpec {
    #[serde(rename = "type")]
    pub kind: HookKind,
    /// Target agent for `type="agent"` hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// Target URL for `type="http"` hooks (reserved).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub on_error: HookOnError,
}

/// Hook points on a blueprint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentHooks {
    /// May transform parameters or block the run before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_run_start: Option<HookSpec>,
    /// Observation only; cannot change an already-emitted result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_run_finish: Option<HookSpec>,
}

impl AgentHooks {
    pub fn is_empty(&self) -> bool {
        self.on_run_start.is_none() && self.on_run_finish.is_none()
    }
}

/// The static definition of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBlueprint {
    /// Globally unique agent name.
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub description: String,
    /// JSON-Schema draft-7 for run `parameters`. Autonomous agents without
    /// one get the implicit `{prompt: string}` schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<Value>,
    /// JSON-Schema draft-7 for `result_data`. Presence forces structured
    /// results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// IDs of MCP server definitions the executor should mount.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<AgentHooks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demands: Option<AgentDemands>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_profile: Option<String>,
}

impl AgentBlueprint {
    /// Effective parameters schema: the explicit one, or the implicit
    /// `{prompt: string}` schema for autonomous agents.
    pub fn effective_parameters_schema(&self) -> Option<Value> {
        match (&self.parameters_schema, self.agent_type) {
            (Some(schema), _) => Some(schema.clone()),
            (None, AgentType::Autonomous) => Some(implicit_parameters_schema()),
            (None, AgentType::Procedural) => None,
        }
    }

    /// Whether terminal results must be structured (`result_data`).
    pub fn expects_structured_result(&self) -> bool {
        self.agent_type == AgentType::Procedural || self.output_schema.is_some()
    }

    /// Executor profile demand, preferring the explicit demand over the
    /// blueprint-level profile.
    pub fn demanded_executor_profile(&self) -> Option<&str> {
        self.demands
            .as_ref()
            .and_then(|d| d.executor_profile.as_deref())
            .or(self.executor_profile.as_deref())
    }
}

/// Implicit input contract for autonomous agents without an explicit schema.
pub fn implicit_parameters_schema() -> Value {
    json!({
        "type": "object",
        "required": ["prompt"],
        "properties": {
            "prompt": { "type": "string", "minLength": 1 }
        }
    })
}

/// A blueprint snapshot with all coordinator-side placeholders resolved for a
/// specific run. `{runner.*}` placeholders pass through opaque and are
/// resolved by the claiming runner at dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedBlueprint {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Inline MCP server definitions (dereferenced from their IDs).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demands: Option<AgentDemands>,
}

/// Parsed output of an `on_run_start` hook run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum HookAction {
    /// Proceed with (possibly enriched) parameters.
    Continue {
        parameters: HashMap<String, Value>,
    },
    /// Fail the run with `hook_blocked`; no execution occurs.
    Block { block_reason: String },
}

/// Outcome recorded for a hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookOutcome {
    Continue,
    Block,
    Failed,
}

impl std::fmt::Display for HookOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookOutcome::Continue => write!(f, "continue"),
            HookOutcome::Block => write!(f, "block"),
            HookOutcome::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for HookOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(HookOutcome::Continue),
            "block" => Ok(HookOutcome::Block),
            "failed" => Ok(HookOutcome::Failed),
            _ => Err(format!("unknown hook outcome: {}", s)),
        }
    }
}

impl TryFrom<String> for HookOutcome {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
