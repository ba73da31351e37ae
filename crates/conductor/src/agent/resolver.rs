//! Blueprint placeholder resolution.
//!
//! Blueprints may reference `{params.X}`, `{scope.X}`, `{env.X}` and
//! `{runtime.X}` in their string-valued fields. Resolution is a single pure
//! pass over the blueprint producing either a fully resolved snapshot or an
//! error naming every unresolved reference. `{runner.X}` placeholders pass
//! through opaque; the claiming runner substitutes them at dispatch.
//!
//! Schemas (`parameters_schema`, `output_schema`) and demands are never
//! templated.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

use conductor_protocol::{AgentBlueprint, ResolvedBlueprint};

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{(params|scope|env|runtime|runner)\.([A-Za-z0-9_][A-Za-z0-9_.\-]*)\}")
        .expect("placeholder regex")
});

/// Per-run variables available under `runtime.*`.
#[derive(Debug, Clone)]
pub struct RuntimeVars {
    pub run_id: String,
    pub session_id: String,
    pub agent_name: String,
    pub parent_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Everything a resolution pass may read. Environment is captured by the
/// caller so the pass itself stays pure.
pub struct ResolutionInput<'a> {
    pub parameters: &'a Value,
    pub scope: Option<&'a HashMap<String, String>>,
    pub env: &'a HashMap<String, String>,
    pub runtime: &'a RuntimeVars,
}

/// Resolution failure listing every unresolved reference.
#[derive(Debug, thiserror::Error)]
#[error("unresolved blueprint placeholders: {}", references.join(", "))]
pub struct UnresolvedPlaceholders {
    pub references: Vec<String>,
}

/// Resolve a blueprint into the snapshot handed to the claiming runner.
///
/// `mcp_servers` are the dereferenced server definitions for the blueprint's
/// server IDs; their string values are templated like the system prompt.
pub fn resolve_blueprint(
    blueprint: &AgentBlueprint,
    mcp_servers: Vec<Value>,
    input: &ResolutionInput<'_>,
) -> Result<ResolvedBlueprint, UnresolvedPlaceholders> {
    let mut unresolved = Vec::new();

    let system_prompt = blueprint
        .system_prompt
        .as_ref()
        .map(|p| resolve_string(p, input, &mut unresolved));

    let description = resolve_string(&blueprint.description, input, &mut unresolved);

    let mcp_servers = mcp_servers
        .into_iter()
        .map(|server| resolve_value(server, input, &mut unresolved))
        .collect();

    if !unresolved.is_empty() {
        unresolved.sort();
        unresolved.dedup();
        return Err(UnresolvedPlaceholders {
            references: unresolved,
        });
    }

    Ok(ResolvedBlueprint {
        name: blueprint.name.clone(),
        agent_type: blueprint.agent_type,
        description,
        parameters_schema: blueprint.effective_parameters_schema(),
        output_schema: blueprint.output_schema.clone(),
        system_prompt,
        mcp_servers,
        executor_profile: blueprint.executor_profile.clone(),
        demands: blueprint.demands.clone(),
    })
}

/// Substitute placeholders in one string, collecting unresolved references.
fn resolve_string(
    template: &str,
    input: &ResolutionInput<'_>,
    unresolved: &mut Vec<String>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let source = &caps[1];
        let key = &caps[2];

        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        match lookup(source, key, input) {
            Lookup::Found(text) => out.push_str(&text),
            Lookup::Opaque => out.push_str(whole.as_str()),
            Lookup::Missing => {
                unresolved.push(format!("{}.{}", source, key));
                out.push_str(whole.as_str());
            }
        }
    }

    out.push_str(&template[last..]);
    out
}

/// Recursively substitute placeholders in every string of a JSON value.
fn resolve_value(value: Value, input: &ResolutionInput<'_>, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => Value::String(resolve_string(&s, input, unresolved)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve_value(item, input, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, resolve_value(v, input, unresolved)))
                .collect(),
        ),
        other => other,
    }
}

enum Lookup {
    Found(String),
    /// Runner-resolved; leave the placeholder intact.
    Opaque,
    Missing,
}

fn lookup(source: &str, key: &str, input: &ResolutionInput<'_>) -> Lookup {
    match source {
        "params" => match dotted_lookup(input.parameters, key) {
            Some(value) => Lookup::Found(render(value)),
            None => Lookup::Missing,
        },
        "scope" => match input.scope.and_then(|s| s.get(key)) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::Missing,
        },
        "env" => match input.env.get(key) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::Missing,
        },
        "runtime" => {
            let rt = input.runtime;
            match key {
                "run_id" => Lookup::Found(rt.run_id.clone()),
                "session_id" => Lookup::Found(rt.session_id.clone()),
                "agent_name" => Lookup::Found(rt.agent_name.clone()),
                "parent_session_id" => match &rt.parent_session_id {
                    Some(id) => Lookup::Found(id.clone()),
                    None => Lookup::Missing,
                },
                "created_at" => Lookup::Found(rt.created_at.to_rfc3339()),
                _ => Lookup::Missing,
            }
        }
        "runner" => Lookup::Opaque,
        _ => Lookup::Missing,
    }
}

/// Walk a dotted path into a JSON value.
fn dotted_lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Render a parameter value for string substitution. Strings embed raw;
/// everything else embeds as compact JSON.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_protocol::AgentType;
    use serde_json::json;

    fn runtime() -> RuntimeVars {
        RuntimeVars {
            run_id: "run_1".to_string(),
            session_id: "ses_1".to_string(),
            agent_name: "researcher".to_string(),
            parent_session_id: None,
            created_at: Utc::now(),
        }
    }

    fn blueprint(system_prompt: &str) -> AgentBlueprint {
        AgentBlueprint {
            name: "researcher".to_string(),
            agent_type: AgentType::Autonomous,
            description: String::new(),
            parameters_schema: None,
            output_schema: None,
            system_prompt: Some(system_prompt.to_string()),
            mcp_servers: Vec::new(),
            hooks: None,
            demands: None,
            executor_profile: None,
        }
    }

    #[test]
    fn test_resolves_params_scope_env_runtime() {
        let params = json!({"prompt": "Research X", "depth": 3});
        let scope: HashMap<String, String> =
            [("tenant".to_string(), "acme".to_string())].into_iter().collect();
        let env: HashMap<String, String> =
            [("REGION".to_string(), "eu-west".to_string())].into_iter().collect();
        let rt = runtime();
        let input = ResolutionInput {
            parameters: &params,
            scope: Some(&scope),
            env: &env,
            runtime: &rt,
        };

        let bp = blueprint(
            "Task: {params.prompt} (depth {params.depth}) for {scope.tenant} in {env.REGION}, run {runtime.run_id}",
        );
        let resolved = resolve_blueprint(&bp, Vec::new(), &input).unwrap();

        assert_eq!(
            resolved.system_prompt.unwrap(),
            "Task: Research X (depth 3) for acme in eu-west, run run_1"
        );
    }

    #[test]
    fn test_runner_placeholders_pass_through() {
        let params = json!({});
        let env = HashMap::new();
        let rt = runtime();
        let input = ResolutionInput {
            parameters: &params,
            scope: None,
            env: &env,
            runtime: &rt,
        };

        let bp = blueprint("Connect to {runner.orchestrator_mcp_url}");
        let resolved = resolve_blueprint(&bp, Vec::new(), &input).unwrap();
        assert_eq!(
            resolved.system_prompt.unwrap(),
            "Connect to {runner.orchestrator_mcp_url}"
        );
    }

    #[test]
    fn test_unresolved_references_are_all_reported() {
        let params = json!({});
        let env = HashMap::new();
        let rt = runtime();
        let input = ResolutionInput {
            parameters: &params,
            scope: None,
            env: &env,
            runtime: &rt,
        };

        let bp = blueprint("{params.missing} and {scope.tenant} and {env.NOPE}");
        let err = resolve_blueprint(&bp, Vec::new(), &input).unwrap_err();

        assert_eq!(
            err.references,
            vec!["env.NOPE", "params.missing", "scope.tenant"]
        );
    }

    #[test]
    fn test_mcp_server_values_are_templated() {
        let params = json!({"token": "abc123"});
        let env = HashMap::new();
        let rt = runtime();
        let input = ResolutionInput {
            parameters: &params,
            scope: None,
            env: &env,
            runtime: &rt,
        };

        let server = json!({
            "id": "search",
            "env": {"API_TOKEN": "{params.token}"},
            "args": ["--session", "{runtime.session_id}"]
        });

        let bp = blueprint("prompt");
        let resolved = resolve_blueprint(&bp, vec![server], &input).unwrap();
        assert_eq!(resolved.mcp_servers[0]["env"]["API_TOKEN"], "abc123");
        assert_eq!(resolved.mcp_servers[0]["args"][1], "ses_1");
    }

    #[test]
    fn test_nested_parameter_lookup() {
        let params = json!({"target": {"url": "https://example.com"}});
        let env = HashMap::new();
        let rt = runtime();
        let input = ResolutionInput {
            parameters: &params,
            scope: None,
            env: &env,
            runtime: &rt,
        };

        let bp = blueprint("Crawl {params.target.url}");
        let resolved = resolve_blueprint(&bp, Vec::new(), &input).unwrap();
        assert_eq!(resolved.system_prompt.unwrap(), "Crawl https://example.com");
    }
}
