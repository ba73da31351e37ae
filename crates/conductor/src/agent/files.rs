//! File materialisation of admin-owned blueprints and MCP server definitions.
//!
//! Operators can edit these by hand between restarts:
//!
//! ```text
//! <config-dir>/agents/<name>/agent.json
//! <config-dir>/mcp-servers/<id>/mcp-server.json
//! ```
//!
//! Files are read at startup and written through on every admin mutation.
//! There is no watcher; a restart (or admin write) picks up manual edits.

use anyhow::{Context, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use conductor_protocol::AgentBlueprint;

/// File-backed blueprint and MCP server store.
#[derive(Debug, Clone)]
pub struct BlueprintFiles {
    config_dir: PathBuf,
}

impl BlueprintFiles {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    fn agents_dir(&self) -> PathBuf {
        self.config_dir.join("agents")
    }

    fn mcp_dir(&self) -> PathBuf {
        self.config_dir.join("mcp-servers")
    }

    fn agent_path(&self, name: &str) -> PathBuf {
        self.agents_dir().join(name).join("agent.json")
    }

    fn mcp_path(&self, id: &str) -> PathBuf {
        self.mcp_dir().join(id).join("mcp-server.json")
    }

    /// Load every agent.json under the config directory.
    pub fn load_agents(&self) -> Result<Vec<AgentBlueprint>> {
        let dir = self.agents_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut blueprints = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading agents directory: {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path().join("agent.json");
            if !path.is_file() {
                continue;
            }
            let blueprint = read_json::<AgentBlueprint>(&path)?;
            blueprints.push(blueprint);
        }

        blueprints.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(blueprints)
    }

    /// Write (or overwrite) a blueprint file.
    pub fn write_agent(&self, blueprint: &AgentBlueprint) -> Result<()> {
        write_json(&self.agent_path(&blueprint.name), blueprint)
    }

    /// Remove a blueprint file and its directory. Missing files are fine.
    pub fn delete_agent(&self, name: &str) -> Result<()> {
        let dir = self.agents_dir().join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing agent directory: {}", dir.display()))?;
        }
        Ok(())
    }

    /// Load every mcp-server.json, keyed by ID.
    pub fn load_mcp_servers(&self) -> Result<HashMap<String, Value>> {
        let dir = self.mcp_dir();
        if !dir.exists() {
            return Ok(HashMap::new());
        }

        let mut servers = HashMap::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading mcp-servers directory: {}", dir.display()))?
        {
            let entry = entry?;
            let id = entry.file_name().to_string_lossy().into_owned();
            let path = entry.path().join("mcp-server.json");
            if !path.is_file() {
                continue;
            }
            servers.insert(id, read_json::<Value>(&path)?);
        }

        Ok(servers)
    }

    pub fn write_mcp_server(&self, id: &str, definition: &Value) -> Result<()> {
        write_json(&self.mcp_path(id), definition)
    }

    pub fn delete_mcp_server(&self, id: &str) -> Result<()> {
        let dir = self.mcp_dir().join(id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing mcp-server directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory: {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value).context("serializing config file")?;
    std::fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_protocol::AgentType;
    use serde_json::json;

    fn blueprint(name: &str) -> AgentBlueprint {
        AgentBlueprint {
            name: name.to_string(),
            agent_type: AgentType::Autonomous,
            description: String::new(),
            parameters_schema: None,
            output_schema: None,
            system_prompt: None,
            mcp_servers: Vec::new(),
            hooks: None,
            demands: None,
            executor_profile: None,
        }
    }

    #[test]
    fn test_agent_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = BlueprintFiles::new(dir.path());

        files.write_agent(&blueprint("researcher")).unwrap();
        files.write_agent(&blueprint("crawler")).unwrap();

        let loaded = files.load_agents().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "crawler");
        assert_eq!(loaded[1].name, "researcher");

        files.delete_agent("crawler").unwrap();
        assert_eq!(files.load_agents().unwrap().len(), 1);
    }

    #[test]
    fn test_mcp_server_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = BlueprintFiles::new(dir.path());

        files
            .write_mcp_server("search", &json!({"command": "search-mcp"}))
            .unwrap();
        let servers = files.load_mcp_servers().unwrap();
        assert_eq!(servers["search"]["command"], "search-mcp");

        files.delete_mcp_server("search").unwrap();
        assert!(files.load_mcp_servers().unwrap().is_empty());
    }

    #[test]
    fn test_missing_directories_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = BlueprintFiles::new(dir.path().join("nope"));
        assert!(files.load_agents().unwrap().is_empty());
        assert!(files.load_mcp_servers().unwrap().is_empty());
    }
}
