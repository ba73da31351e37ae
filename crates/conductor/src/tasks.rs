//! Long-running background tasks: the heartbeat reaper and the run
//! timeout sweeper. The callback processor lives in [`crate::callback`].

use chrono::{Duration, Utc};
use log::error;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::error::{ERR_LEASE_EXPIRED, ERR_NO_RUNNER_AVAILABLE, ERR_RUNNER_DISCONNECTED};
use crate::run::RunRepository;
use crate::runner::RunnerRegistry;
use crate::session::SessionService;

/// Periodic heartbeat reaper: marks stale runners and removes expired ones,
/// finalizing the runs they orphaned.
pub fn spawn_heartbeat_reaper(
    registry: Arc<RunnerRegistry>,
    service: Arc<SessionService>,
    interval_seconds: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match registry.sweep().await {
                Ok(removed) => {
                    for removal in removed {
                        for run in &removal.orphaned_runs {
                            if let Err(err) = service
                                .finalize_orphaned_run(run, ERR_RUNNER_DISCONNECTED)
                                .await
                            {
                                error!(
                                    "Failed to finalize orphaned run {}: {:#}",
                                    run.id, err
                                );
                            }
                        }
                    }
                }
                Err(err) => error!("Heartbeat sweep failed: {:#}", err),
            }
        }
    })
}

/// Periodic run sweeper: dispatch timeouts, expired claim leases, and
/// unacknowledged stop requests.
pub fn spawn_run_sweeper(
    runs: RunRepository,
    service: Arc<SessionService>,
    interval_seconds: u64,
    heartbeat_stale_seconds: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = Utc::now();
            let heartbeat_window = Duration::seconds(heartbeat_stale_seconds as i64);

            match runs.list_dispatch_expired(now).await {
                Ok(expired) => {
                    for run in expired {
                        if let Err(err) = service
                            .fail_dispatch_expired(&run, ERR_NO_RUNNER_AVAILABLE)
                            .await
                        {
                            error!("Failed to time out run {}: {:#}", run.id, err);
                        }
                    }
                }
                Err(err) => error!("Dispatch timeout scan failed: {:#}", err),
            }

            match runs.list_lease_expired(now - heartbeat_window).await {
                Ok(expired) => {
                    for run in expired {
                        if let Err(err) = service.fail_lease_expired(&run, ERR_LEASE_EXPIRED).await
                        {
                            error!("Failed to expire lease on run {}: {:#}", run.id, err);
                        }
                    }
                }
                Err(err) => error!("Lease scan failed: {:#}", err),
            }

            match runs.list_stop_expired(now - heartbeat_window).await {
                Ok(expired) => {
                    for run in expired {
                        if let Err(err) = service.force_stop_expired(&run).await {
                            error!("Failed to force-stop run {}: {:#}", run.id, err);
                        }
                    }
                }
                Err(err) => error!("Stop acknowledgement scan failed: {:#}", err),
            }
        }
    })
}
