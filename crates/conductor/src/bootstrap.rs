//! Application assembly: wire repositories, services and background tasks
//! into a ready-to-serve router. Shared between the server binary and the
//! integration tests.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::agent::{AgentRepository, AgentService, BlueprintFiles};
use crate::api::{AppState, create_router};
use crate::auth::AuthState;
use crate::callback::{CallbackProcessor, CallbackRepository};
use crate::config::CoordinatorConfig;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::event::{EventHub, EventLog, EventRepository};
use crate::hook::{HookEngine, HookRepository};
use crate::run::RunRepository;
use crate::runner::{HeartbeatConfig, RunnerRegistry, RunnerRepository};
use crate::session::{SessionRepository, SessionService};
use crate::tasks;

/// A fully wired coordinator, background tasks not yet started.
pub struct App {
    pub state: AppState,
    pub service: Arc<SessionService>,
    pub registry: Arc<RunnerRegistry>,
    pub runs: RunRepository,
    pub config: CoordinatorConfig,
    callback_rx: Option<mpsc::UnboundedReceiver<String>>,
}

impl App {
    /// Build the coordinator over an opened database.
    pub async fn build(db: &Database, config: CoordinatorConfig) -> Result<App> {
        let pool = db.pool().clone();

        let agent_repo = AgentRepository::new(pool.clone());
        let agents = Arc::new(AgentService::new(
            agent_repo.clone(),
            BlueprintFiles::new(config.config_dir()),
        ));
        agents.load_from_disk().await?;

        let hub = Arc::new(EventHub::new());
        let log = EventLog::new(EventRepository::new(pool.clone()), hub);

        let hooks = Arc::new(HookEngine::new(
            log.clone(),
            HookRepository::new(pool.clone()),
            config.hook_timeout_seconds,
        ));

        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let dispatch_notify = Arc::new(Notify::new());

        let service = Arc::new(SessionService::new(
            SessionRepository::new(pool.clone()),
            RunRepository::new(pool.clone()),
            agents.clone(),
            log,
            CallbackRepository::new(pool.clone()),
            callback_tx,
            hooks,
            dispatch_notify.clone(),
            config.dispatch_timeout_seconds,
        ));
        service.install_self();

        let registry = Arc::new(RunnerRegistry::new(
            pool.clone(),
            RunnerRepository::new(pool.clone()),
            agent_repo,
            agents.clone(),
            RunRepository::new(pool.clone()),
            HeartbeatConfig {
                stale_seconds: config.heartbeat_stale_seconds,
                remove_seconds: config.heartbeat_remove_seconds,
            },
        ));
        registry.load_from_db().await?;

        let dispatcher = Arc::new(Dispatcher::new(
            RunRepository::new(pool.clone()),
            registry.clone(),
            service.clone(),
            dispatch_notify,
            config.long_poll_seconds,
        ));

        let auth = AuthState::new(config.auth_enabled, config.auth_verifier_url.clone());

        let state = AppState {
            sessions: service.clone(),
            agents,
            registry: registry.clone(),
            dispatcher,
            auth,
        };

        Ok(App {
            state,
            service,
            registry,
            runs: RunRepository::new(pool),
            config,
            callback_rx: Some(callback_rx),
        })
    }

    /// The HTTP router over this app's state.
    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    /// Start the callback processor alone (integration tests drive the
    /// sweepers by hand).
    pub fn spawn_callback_processor(&mut self) -> Option<JoinHandle<()>> {
        self.callback_rx
            .take()
            .map(|rx| CallbackProcessor::spawn(self.service.clone(), rx))
    }

    /// Start the callback processor, heartbeat reaper and run sweeper.
    pub fn spawn_background_tasks(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(handle) = self.spawn_callback_processor() {
            handles.push(handle);
        }
        handles.push(tasks::spawn_heartbeat_reaper(
            self.registry.clone(),
            self.service.clone(),
            self.config.sweep_interval_seconds,
        ));
        handles.push(tasks::spawn_run_sweeper(
            self.runs.clone(),
            self.service.clone(),
            self.config.sweep_interval_seconds,
            self.config.heartbeat_stale_seconds,
        ));
        handles
    }
}
