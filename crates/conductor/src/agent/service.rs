//! Agent blueprint service.
//!
//! Owns blueprint registration (admin and runner-declared), the lookup
//! precedence between them, MCP server definitions, and the registration-time
//! hook sanity checks.

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use conductor_protocol::{AgentBlueprint, HookKind, HookSpec};

use crate::error::CoordinatorError;

use super::files::BlueprintFiles;
use super::repository::{AgentRepository, StoredBlueprint};
use super::schema;

/// Agent name shape: path- and URL-safe.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Blueprint registry with file materialisation for admin-owned entries.
pub struct AgentService {
    repo: AgentRepository,
    files: BlueprintFiles,
    /// MCP server definitions, keyed by ID. Loaded at startup, written
    /// through on admin mutation.
    mcp_servers: DashMap<String, Value>,
}

impl AgentService {
    pub fn new(repo: AgentRepository, files: BlueprintFiles) -> Self {
        Self {
            repo,
            files,
            mcp_servers: DashMap::new(),
        }
    }

    /// Load file-backed blueprints and MCP servers into the store. Called
    /// once at startup; file contents win over stale admin rows.
    pub async fn load_from_disk(&self) -> Result<()> {
        for (id, definition) in self.files.load_mcp_servers()? {
            self.mcp_servers.insert(id, definition);
        }

        let blueprints = self.files.load_agents()?;
        let count = blueprints.len();
        for blueprint in blueprints {
            if let Err(err) = self.validate_blueprint(&blueprint).await {
                warn!(
                    "Skipping invalid blueprint file for '{}': {}",
                    blueprint.name, err
                );
                continue;
            }
            self.repo.upsert_admin(&blueprint).await?;
        }

        info!(
            "Loaded {} agent blueprint(s) and {} MCP server(s) from disk",
            count,
            self.mcp_servers.len()
        );
        Ok(())
    }

    /// Create or update an admin-owned blueprint: validate, persist, then
    /// materialise to disk.
    pub async fn upsert_admin(&self, blueprint: AgentBlueprint) -> Result<StoredBlueprint> {
        self.validate_blueprint(&blueprint).await?;
        self.repo.upsert_admin(&blueprint).await?;
        self.files.write_agent(&blueprint)?;
        debug!("Upserted admin blueprint '{}'", blueprint.name);

        self.repo
            .get_admin(&blueprint.name)
            .await?
            .context("blueprint missing after upsert")
    }

    /// Delete an admin-owned blueprint (store and file).
    pub async fn delete_admin(&self, name: &str) -> Result<()> {
        if !self.repo.delete_admin(name).await? {
            return Err(CoordinatorError::AgentNotFound(name.to_string()).into());
        }
        self.files.delete_agent(name)?;
        info!("Deleted admin blueprint '{}'", name);
        Ok(())
    }

    /// Effective blueprint for a name, admin-owned winning over
    /// runner-declared.
    pub async fn get_effective(&self, name: &str) -> Result<StoredBlueprint> {
        self.repo
            .get_effective(name)
            .await?
            .ok_or_else(|| CoordinatorError::AgentNotFound(name.to_string()).into())
    }

    pub async fn get_admin(&self, name: &str) -> Result<Option<StoredBlueprint>> {
        self.repo.get_admin(name).await
    }

    /// Effective blueprint list: one entry per name, precedence applied.
    pub async fn list_effective(&self) -> Result<Vec<StoredBlueprint>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for stored in self.repo.list().await? {
            if seen.insert(stored.blueprint.name.clone()) {
                out.push(stored);
            }
        }
        Ok(out)
    }

    // -- MCP servers ---------------------------------------------------------

    pub fn upsert_mcp_server(&self, id: &str, definition: Value) -> Result<()> {
        if !valid_name(id) {
            return Err(
                CoordinatorError::InvalidRequest(format!("invalid MCP server id: {}", id)).into(),
            );
        }
        self.files.write_mcp_server(id, &definition)?;
        self.mcp_servers.insert(id.to_string(), definition);
        Ok(())
    }

    pub fn delete_mcp_server(&self, id: &str) -> Result<()> {
        self.mcp_servers.remove(id);
        self.files.delete_mcp_server(id)
    }

    pub fn list_mcp_servers(&self) -> HashMap<String, Value> {
        self.mcp_servers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Dereference a blueprint's MCP server IDs into inline definitions.
    /// IDs were validated at registration, but a server may have been deleted
    /// since; that is a hard error at run creation.
    pub fn mcp_definitions(&self, blueprint: &AgentBlueprint) -> Result<Vec<Value>> {
        blueprint
            .mcp_servers
            .iter()
            .map(|id| {
                self.mcp_servers
                    .get(id)
                    .map(|entry| {
                        let mut definition = entry.value().clone();
                        if let Value::Object(map) = &mut definition {
                            map.entry("id".to_string())
                                .or_insert_with(|| Value::String(id.clone()));
                        }
                        definition
                    })
                    .ok_or_else(|| {
                        CoordinatorError::InvalidBlueprint(format!(
                            "blueprint '{}' references unknown MCP server '{}'",
                            blueprint.name, id
                        ))
                        .into()
                    })
            })
            .collect()
    }

    // -- Validation ----------------------------------------------------------

    /// Registration-time blueprint checks: name shape, schema compilation,
    /// MCP references, and the hook rules.
    pub(crate) async fn validate_blueprint(&self, blueprint: &AgentBlueprint) -> Result<()> {
        if !valid_name(&blueprint.name) {
            return Err(CoordinatorError::InvalidBlueprint(format!(
                "invalid agent name: '{}'",
                blueprint.name
            ))
            .into());
        }

        if let Some(params_schema) = &blueprint.parameters_schema {
            schema::compile(params_schema).map_err(|err| {
                CoordinatorError::InvalidBlueprint(format!(
                    "parameters_schema does not compile: {}",
                    err
                ))
            })?;
        }
        if let Some(output_schema) = &blueprint.output_schema {
            schema::compile(output_schema).map_err(|err| {
                CoordinatorError::InvalidBlueprint(format!(
                    "output_schema does not compile: {}",
                    err
                ))
            })?;
        }

        for id in &blueprint.mcp_servers {
            if !self.mcp_servers.contains_key(id) {
                return Err(CoordinatorError::InvalidBlueprint(format!(
                    "unknown MCP server reference: '{}'",
                    id
                ))
                .into());
            }
        }

        if let Some(hooks) = &blueprint.hooks {
            for (point, spec) in [
                ("on_run_start", hooks.on_run_start.as_ref()),
                ("on_run_finish", hooks.on_run_finish.as_ref()),
            ] {
                if let Some(spec) = spec {
                    self.validate_hook_spec(&blueprint.name, point, spec).await?;
                }
            }

            if !hooks.is_empty() {
                // An agent that carries hooks may not itself be a hook
                // target: hook chains do not recurse.
                if let Some(referrer) = self.find_hook_referrer(&blueprint.name).await? {
                    return Err(CoordinatorError::InvalidBlueprint(format!(
                        "agent '{}' is a hook target of '{}' and may not declare hooks itself",
                        blueprint.name, referrer
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }

    async fn validate_hook_spec(&self, owner: &str, point: &str, spec: &HookSpec) -> Result<()> {
        match spec.kind {
            HookKind::Http => Err(CoordinatorError::InvalidBlueprint(format!(
                "{} hook on '{}': http hooks are not supported yet",
                point, owner
            ))
            .into()),
            HookKind::Agent => {
                let target = spec.agent_name.as_deref().ok_or_else(|| {
                    CoordinatorError::InvalidBlueprint(format!(
                        "{} hook on '{}' is missing agent_name",
                        point, owner
                    ))
                })?;

                if target == owner {
                    return Err(CoordinatorError::InvalidBlueprint(format!(
                        "{} hook on '{}' may not target itself",
                        point, owner
                    ))
                    .into());
                }

                // If the target already exists it must not declare hooks of
                // its own.
                if let Some(stored) = self.repo.get_effective(target).await?
                    && stored
                        .blueprint
                        .hooks
                        .as_ref()
                        .is_some_and(|h| !h.is_empty())
                {
                    return Err(CoordinatorError::InvalidBlueprint(format!(
                        "{} hook on '{}' targets '{}', which declares hooks itself; \
                         hooks do not recurse",
                        point, owner, target
                    ))
                    .into());
                }

                Ok(())
            }
        }
    }

    /// Name of any existing blueprint whose hooks target the given agent.
    async fn find_hook_referrer(&self, target: &str) -> Result<Option<String>> {
        for stored in self.repo.list().await? {
            if let Some(hooks) = &stored.blueprint.hooks {
                let targets = [&hooks.on_run_start, &hooks.on_run_finish];
                if targets.iter().any(|spec| {
                    spec.as_ref()
                        .is_some_and(|s| s.agent_name.as_deref() == Some(target))
                }) {
                    return Ok(Some(stored.blueprint.name));
                }
            }
        }
        Ok(None)
    }
}
