//! Run queue and dispatcher.
//!
//! Pending runs wait in the store; eligible runners long-poll for the oldest
//! run they match. The claim itself is a guarded UPDATE, so two runners
//! polling concurrently cannot take the same run.

use anyhow::{Context, Result};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use conductor_protocol::{ClaimedRun, ResolvedBlueprint};

use crate::error::CoordinatorError;
use crate::run::{Run, RunRepository};
use crate::runner::{RunnerRegistry, run_matches_runner};
use crate::session::SessionService;

/// Demand/capability matching plus lease handout.
pub struct Dispatcher {
    runs: RunRepository,
    registry: Arc<RunnerRegistry>,
    service: Arc<SessionService>,
    notify: Arc<Notify>,
    long_poll: Duration,
}

impl Dispatcher {
    pub fn new(
        runs: RunRepository,
        registry: Arc<RunnerRegistry>,
        service: Arc<SessionService>,
        notify: Arc<Notify>,
        long_poll_seconds: u64,
    ) -> Self {
        Self {
            runs,
            registry,
            service,
            notify,
            long_poll: Duration::from_secs(long_poll_seconds),
        }
    }

    /// Try to claim the oldest eligible pending run for a runner.
    pub async fn claim_next(&self, runner_id: &str) -> Result<Option<ClaimedRun>> {
        let info = self
            .registry
            .get_info(runner_id)
            .ok_or_else(|| CoordinatorError::RunnerNotFound(runner_id.to_string()))?;

        for run in self.runs.list_claimable().await? {
            let Some(snapshot) = parse_snapshot(&run) else {
                continue;
            };

            let profile_demand = snapshot
                .demands
                .as_ref()
                .and_then(|d| d.executor_profile.as_deref())
                .or(snapshot.executor_profile.as_deref());

            if !run_matches_runner(&info, &snapshot.name, snapshot.demands.as_ref(), profile_demand)
            {
                continue;
            }

            if !self.runs.try_claim(&run.id, runner_id).await? {
                // Another runner won this one; keep scanning.
                continue;
            }

            debug!("Run {} claimed by runner {}", run.id, runner_id);
            let claimed = self
                .service
                .get_run(&run.id)
                .await
                .context("reloading claimed run")?;
            self.service.note_claimed(&claimed, &info).await?;

            return Ok(Some(ClaimedRun {
                run_id: claimed.id.clone(),
                session_id: claimed.session_id.clone(),
                run_number: claimed.run_number,
                run_type: claimed.run_type.to_string(),
                parameters: claimed.parameters.clone(),
                scope: claimed.scope.clone(),
                context: claimed.context.clone(),
                blueprint: snapshot,
            }));
        }

        Ok(None)
    }

    /// Long-poll variant of [`claim_next`]: waits for new work up to the
    /// configured window.
    pub async fn long_poll(&self, runner_id: &str) -> Result<Option<ClaimedRun>> {
        let deadline = tokio::time::Instant::now() + self.long_poll;

        loop {
            if let Some(claimed) = self.claim_next(runner_id).await? {
                return Ok(Some(claimed));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(deadline - now) => return Ok(None),
            }
        }
    }

    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

fn parse_snapshot(run: &Run) -> Option<ResolvedBlueprint> {
    run.resolved_blueprint
        .clone()
        .and_then(|value| serde_json::from_value(value).ok())
}
