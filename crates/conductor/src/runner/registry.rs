//! Runner registry: registration, heartbeat lifecycle, and the dispatch
//! eligibility predicate.
//!
//! The registry keeps an in-memory projection (rebuilt from durable rows on
//! restart) for cheap eligibility checks; every mutation writes through to
//! the store. Runner removal is one transaction: mark removed, purge the
//! declared blueprints, fail the orphaned runs.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use dashmap::DashMap;
use log::{info, warn};
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::sync::Arc;

use conductor_protocol::{
    AgentDemands, RegisterRunnerRequest, RegisterRunnerResponse, RunnerStatus,
};

use crate::agent::{AgentRepository, AgentService};
use crate::error::{CoordinatorError, ERR_RUNNER_DISCONNECTED};
use crate::ids;
use crate::run::{Run, RunRepository};

use super::models::{Runner, RunnerInfo};
use super::repository::RunnerRepository;

/// Heartbeat thresholds (seconds).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Missed-heartbeat warning threshold.
    pub stale_seconds: u64,
    /// Removal threshold: agents purged, runs failed.
    pub remove_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stale_seconds: 120,
            remove_seconds: 600,
        }
    }
}

impl HeartbeatConfig {
    /// Interval runners are told to heartbeat at.
    pub fn interval_seconds(&self) -> u64 {
        (self.stale_seconds / 3).max(5)
    }
}

/// A removed runner together with the runs it orphaned, for post-commit
/// finalization (events, callbacks).
pub struct RemovedRunner {
    pub runner_id: String,
    pub orphaned_runs: Vec<Run>,
    pub purged_agents: u64,
}

/// Registry of worker processes.
pub struct RunnerRegistry {
    pool: SqlitePool,
    repo: RunnerRepository,
    agent_repo: AgentRepository,
    agents: Arc<AgentService>,
    runs: RunRepository,
    projection: DashMap<String, RunnerInfo>,
    config: HeartbeatConfig,
}

impl RunnerRegistry {
    pub fn new(
        pool: SqlitePool,
        repo: RunnerRepository,
        agent_repo: AgentRepository,
        agents: Arc<AgentService>,
        runs: RunRepository,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            pool,
            repo,
            agent_repo,
            agents,
            runs,
            projection: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> HeartbeatConfig {
        self.config
    }

    /// Rebuild the in-memory projection from durable rows (startup).
    pub async fn load_from_db(&self) -> Result<()> {
        for runner in self.repo.list_live().await? {
            let agent_names: HashSet<String> = self
                .agent_repo
                .list_by_runner(&runner.id)
                .await?
                .into_iter()
                .map(|stored| stored.blueprint.name)
                .collect();
            self.projection
                .insert(runner.id.clone(), RunnerInfo { runner, agent_names });
        }

        info!("Loaded {} runner(s) from store", self.projection.len());
        Ok(())
    }

    /// Register (or re-register) a runner with its declared agents.
    ///
    /// Name collisions with other runners reject the whole registration and
    /// leave the existing declarations intact. Re-registration by the same
    /// runner replaces its declared agents atomically and is idempotent.
    pub async fn register(
        &self,
        request: RegisterRunnerRequest,
    ) -> Result<RegisterRunnerResponse> {
        for blueprint in &request.agents {
            self.agents.validate_blueprint(blueprint).await?;
        }

        let runner_id = request.runner_id.clone().unwrap_or_else(ids::runner_id);
        let names: Vec<String> = request.agents.iter().map(|b| b.name.clone()).collect();

        // Fast precise check for the error body; the transaction below
        // re-checks so a concurrent registration still cannot slip through.
        let collisions = self
            .agent_repo
            .names_declared_elsewhere(&names, &runner_id)
            .await?;
        if !collisions.is_empty() {
            return Err(CoordinatorError::AgentNameCollision { names: collisions }.into());
        }

        let now = Utc::now();
        let runner = Runner {
            id: runner_id.clone(),
            hostname: request.hostname,
            project_dir: request.project_dir,
            tags: request.tags,
            executor_profile: request.executor_profile,
            executor: request.executor,
            require_matching_tags: request.require_matching_tags,
            status: RunnerStatus::Active,
            registered_at: now,
            last_heartbeat_at: now,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting registration transaction")?;
        self.repo.upsert_tx(&mut tx, &runner).await?;
        self.agent_repo
            .replace_runner_agents_tx(&mut tx, &runner_id, &request.agents)
            .await
            .map_err(|err| {
                if err.to_string().contains("already declared") {
                    anyhow::Error::from(CoordinatorError::AgentNameCollision {
                        names: names.clone(),
                    })
                } else {
                    err
                }
            })?;
        tx.commit().await.context("committing registration")?;

        self.projection.insert(
            runner_id.clone(),
            RunnerInfo {
                runner,
                agent_names: names.into_iter().collect(),
            },
        );

        info!("Registered runner {}", runner_id);
        Ok(RegisterRunnerResponse {
            runner_id,
            heartbeat_interval_seconds: self.config.interval_seconds(),
        })
    }

    /// Record a heartbeat. Stale runners return to active; removed runners
    /// must re-register.
    pub async fn heartbeat(&self, runner_id: &str) -> Result<()> {
        let now = Utc::now();
        if !self.repo.touch_heartbeat(runner_id, now).await? {
            return Err(CoordinatorError::RunnerNotFound(runner_id.to_string()).into());
        }

        if let Some(mut entry) = self.projection.get_mut(runner_id) {
            entry.runner.last_heartbeat_at = now;
            entry.runner.status = RunnerStatus::Active;
        }

        Ok(())
    }

    /// Remove a runner: one transaction marks it removed, purges its
    /// declared blueprints and fails its active runs. The caller finalizes
    /// the orphaned runs (events, session status, callbacks) afterwards.
    pub async fn remove(&self, runner_id: &str) -> Result<RemovedRunner> {
        if self.repo.get(runner_id).await?.is_none() {
            return Err(CoordinatorError::RunnerNotFound(runner_id.to_string()).into());
        }

        let orphaned_runs = self.runs.list_active_for_runner(runner_id).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting removal transaction")?;
        self.repo.mark_removed_tx(&mut tx, runner_id).await?;
        let purged_agents = self.agent_repo.delete_by_runner_tx(&mut tx, runner_id).await?;
        self.runs
            .fail_active_for_runner_tx(&mut tx, runner_id, ERR_RUNNER_DISCONNECTED)
            .await?;
        tx.commit().await.context("committing removal")?;

        self.projection.remove(runner_id);
        info!(
            "Removed runner {} ({} agent(s) purged, {} run(s) orphaned)",
            runner_id,
            purged_agents,
            orphaned_runs.len()
        );

        Ok(RemovedRunner {
            runner_id: runner_id.to_string(),
            orphaned_runs,
            purged_agents,
        })
    }

    /// One reaper tick: mark stale runners, remove expired ones. Returns the
    /// removal batches for post-commit finalization.
    pub async fn sweep(&self) -> Result<Vec<RemovedRunner>> {
        let now = Utc::now();
        let stale_cutoff = now - Duration::seconds(self.config.stale_seconds as i64);
        let remove_cutoff = now - Duration::seconds(self.config.remove_seconds as i64);

        let mut to_remove = Vec::new();
        let mut to_stale = Vec::new();
        for entry in self.projection.iter() {
            let runner = &entry.value().runner;
            if runner.last_heartbeat_at < remove_cutoff {
                to_remove.push(runner.id.clone());
            } else if runner.last_heartbeat_at < stale_cutoff
                && runner.status == RunnerStatus::Active
            {
                to_stale.push(runner.id.clone());
            }
        }

        for runner_id in to_stale {
            warn!("Runner {} missed its heartbeat window, marking stale", runner_id);
            self.repo.set_status(&runner_id, RunnerStatus::Stale).await?;
            if let Some(mut entry) = self.projection.get_mut(&runner_id) {
                entry.runner.status = RunnerStatus::Stale;
            }
        }

        let mut removed = Vec::new();
        for runner_id in to_remove {
            warn!("Runner {} exceeded the removal threshold, purging", runner_id);
            removed.push(self.remove(&runner_id).await?);
        }

        Ok(removed)
    }

    pub fn get_info(&self, runner_id: &str) -> Option<RunnerInfo> {
        self.projection.get(runner_id).map(|entry| entry.clone())
    }

    pub fn list(&self) -> Vec<RunnerInfo> {
        let mut runners: Vec<RunnerInfo> =
            self.projection.iter().map(|entry| entry.clone()).collect();
        runners.sort_by(|a, b| a.runner.id.cmp(&b.runner.id));
        runners
    }
}

/// Dispatch predicate between a run and a runner (spec order):
/// 1. the runner declares the run's agent;
/// 2. every demand is satisfied (`hostname`, `project_dir`,
///    `executor_profile` exact; required tags a subset of the runner's);
/// 3. tagged-only runners additionally require a non-empty tag
///    intersection.
pub fn run_matches_runner(
    info: &RunnerInfo,
    agent_name: &str,
    demands: Option<&AgentDemands>,
    executor_profile: Option<&str>,
) -> bool {
    if info.runner.status == RunnerStatus::Removed {
        return false;
    }

    if !info.declares(agent_name) {
        return false;
    }

    let empty: [String; 0] = [];
    let run_tags: &[String] = demands.map(|d| d.tags.as_slice()).unwrap_or(&empty);

    if let Some(demands) = demands {
        if let Some(hostname) = &demands.hostname
            && hostname != &info.runner.hostname
        {
            return false;
        }
        if let Some(project_dir) = &demands.project_dir
            && info.runner.project_dir.as_deref() != Some(project_dir.as_str())
        {
            return false;
        }
        if !run_tags.iter().all(|tag| info.runner.tags.contains(tag)) {
            return false;
        }
    }

    if let Some(profile) = executor_profile
        && info.runner.executor_profile.as_deref() != Some(profile)
    {
        return false;
    }

    if info.runner.require_matching_tags
        && !run_tags.iter().any(|tag| info.runner.tags.contains(tag))
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::BlueprintFiles;
    use crate::db::Database;
    use conductor_protocol::{AgentBlueprint, AgentType};

    async fn registry_with(config: HeartbeatConfig) -> (RunnerRegistry, tempfile::TempDir) {
        let db = Database::in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let agent_repo = AgentRepository::new(db.pool().clone());
        let agents = Arc::new(AgentService::new(
            agent_repo.clone(),
            BlueprintFiles::new(dir.path()),
        ));
        let registry = RunnerRegistry::new(
            db.pool().clone(),
            RunnerRepository::new(db.pool().clone()),
            agent_repo,
            agents,
            RunRepository::new(db.pool().clone()),
            config,
        );
        (registry, dir)
    }

    async fn registry() -> (RunnerRegistry, tempfile::TempDir) {
        registry_with(HeartbeatConfig::default()).await
    }

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

    fn register_request(agents: Vec<AgentBlueprint>) -> RegisterRunnerRequest {
        RegisterRunnerRequest {
            runner_id: None,
            hostname: "host-a".to_string(),
            project_dir: None,
            tags: Vec::new(),
            executor_profile: None,
            executor: None,
            require_matching_tags: false,
            agents,
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (registry, _dir) = registry().await;
        let response = registry
            .register(register_request(vec![blueprint("web-crawler")]))
            .await
            .unwrap();

        assert!(response.runner_id.starts_with("lnch_"));
        let info = registry.get_info(&response.runner_id).unwrap();
        assert!(info.declares("web-crawler"));
        assert_eq!(info.runner.status, RunnerStatus::Active);
    }

    #[tokio::test]
    async fn test_collision_rejects_second_runner() {
        let (registry, _dir) = registry().await;
        let first = registry
            .register(register_request(vec![blueprint("web-crawler")]))
            .await
            .unwrap();

        let err = registry
            .register(register_request(vec![blueprint("web-crawler")]))
            .await
            .unwrap_err();
        let coord = err.downcast_ref::<CoordinatorError>().unwrap();
        assert_eq!(coord.discriminator(), "agent_name_collision");

        // First runner's declaration survives intact.
        assert!(registry.get_info(&first.runner_id).unwrap().declares("web-crawler"));
    }

    #[tokio::test]
    async fn test_reregistration_is_idempotent() {
        let (registry, _dir) = registry().await;
        let first = registry
            .register(register_request(vec![blueprint("a"), blueprint("b")]))
            .await
            .unwrap();

        let mut again = register_request(vec![blueprint("a"), blueprint("b")]);
        again.runner_id = Some(first.runner_id.clone());
        let second = registry.register(again).await.unwrap();

        assert_eq!(first.runner_id, second.runner_id);
        let info = registry.get_info(&first.runner_id).unwrap();
        assert_eq!(info.agent_names.len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_then_reregister_round_trip() {
        let (registry, _dir) = registry().await;
        let first = registry
            .register(register_request(vec![blueprint("a")]))
            .await
            .unwrap();

        let removed = registry.remove(&first.runner_id).await.unwrap();
        assert_eq!(removed.purged_agents, 1);
        assert!(registry.get_info(&first.runner_id).is_none());

        let mut again = register_request(vec![blueprint("a")]);
        again.runner_id = Some(first.runner_id.clone());
        registry.register(again).await.unwrap();
        assert!(registry.get_info(&first.runner_id).unwrap().declares("a"));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_runner() {
        // Zero thresholds: any registered runner is instantly expired.
        let (registry, _dir) = registry_with(HeartbeatConfig {
            stale_seconds: 0,
            remove_seconds: 0,
        })
        .await;
        let response = registry
            .register(register_request(vec![blueprint("a")]))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let removed = registry.sweep().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].runner_id, response.runner_id);
        assert_eq!(removed[0].purged_agents, 1);
        assert!(registry.get_info(&response.runner_id).is_none());

        // A second sweep is a no-op.
        assert!(registry.sweep().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_marks_stale_within_window() {
        // Stale instantly, but removal far away.
        let (registry, _dir) = registry_with(HeartbeatConfig {
            stale_seconds: 0,
            remove_seconds: 3600,
        })
        .await;
        let response = registry
            .register(register_request(vec![blueprint("a")]))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        registry.sweep().await.unwrap();
        let info = registry.get_info(&response.runner_id).unwrap();
        assert_eq!(info.runner.status, RunnerStatus::Stale);

        // A heartbeat brings it back to active.
        registry.heartbeat(&response.runner_id).await.unwrap();
        assert_eq!(
            registry.get_info(&response.runner_id).unwrap().runner.status,
            RunnerStatus::Active
        );
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_runner() {
        let (registry, _dir) = registry().await;
        let err = registry.heartbeat("lnch_missing").await.unwrap_err();
        let coord = err.downcast_ref::<CoordinatorError>().unwrap();
        assert_eq!(coord.discriminator(), "runner_not_found");
    }

    fn info(
        hostname: &str,
        project_dir: Option<&str>,
        tags: &[&str],
        profile: Option<&str>,
        require_matching_tags: bool,
        declares: &[&str],
    ) -> RunnerInfo {
        RunnerInfo {
            runner: Runner {
                id: "lnch_t".to_string(),
                hostname: hostname.to_string(),
                project_dir: project_dir.map(String::from),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                executor_profile: profile.map(String::from),
                executor: None,
                require_matching_tags,
                status: RunnerStatus::Active,
                registered_at: Utc::now(),
                last_heartbeat_at: Utc::now(),
            },
            agent_names: declares.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_match_requires_declared_agent() {
        let runner = info("host-a", None, &[], None, false, &["crawler"]);
        assert!(run_matches_runner(&runner, "crawler", None, None));
        assert!(!run_matches_runner(&runner, "other", None, None));
    }

    #[test]
    fn test_match_demands() {
        let runner = info(
            "host-a",
            Some("/work/proj"),
            &["gpu", "fast"],
            Some("docker"),
            false,
            &["crawler"],
        );

        let demands = AgentDemands {
            hostname: Some("host-a".to_string()),
            project_dir: Some("/work/proj".to_string()),
            executor_profile: None,
            tags: vec!["gpu".to_string()],
        };
        assert!(run_matches_runner(&runner, "crawler", Some(&demands), Some("docker")));

        let wrong_host = AgentDemands {
            hostname: Some("host-b".to_string()),
            ..demands.clone()
        };
        assert!(!run_matches_runner(&runner, "crawler", Some(&wrong_host), None));

        let wrong_tags = AgentDemands {
            hostname: None,
            project_dir: None,
            executor_profile: None,
            tags: vec!["tpu".to_string()],
        };
        assert!(!run_matches_runner(&runner, "crawler", Some(&wrong_tags), None));

        assert!(!run_matches_runner(&runner, "crawler", None, Some("podman")));
    }

    #[test]
    fn test_tagged_only_mode() {
        let runner = info("host-a", None, &["gpu"], None, true, &["crawler"]);

        // No intersecting tag: rejected.
        assert!(!run_matches_runner(&runner, "crawler", None, None));

        let tagged = AgentDemands {
            tags: vec!["gpu".to_string()],
            ..AgentDemands::default()
        };
        assert!(run_matches_runner(&runner, "crawler", Some(&tagged), None));
    }
}
