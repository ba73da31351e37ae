//! Session and run orchestration.
//!
//! This service owns the run state machine end to end: creation through the
//! validation gate and placeholder resolution, the start-hook pipeline that
//! gates dispatch, runner-reported transitions, terminal finalization with
//! lifecycle events, and callback enqueueing for parent sessions.
//!
//! Every mutating operation on a session happens under its serial lane,
//! which is what keeps run numbers contiguous and terminal states race-free.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};

use conductor_protocol::{
    AgentBlueprint, CompleteRunRequest, EventPayload, IngestEventsRequest, ResolvedBlueprint,
};

use crate::agent::{AgentService, ResolutionInput, RuntimeVars, resolve_blueprint, schema};
use crate::callback::{
    CallbackRecord, CallbackRepository, CallbackStatus, ChildResult, render_callback_prompt,
};
use crate::error::CoordinatorError;
use crate::event::EventLog;
use crate::hook::{HookEngine, StartHookDecision};
use crate::ids;
use crate::run::{Run, RunRepository, RunStatus, RunType};
use crate::runner::RunnerInfo;

use super::lanes::SessionLanes;
use super::models::{ExecutionMode, Session, SessionStatus};
use super::repository::SessionRepository;

/// Inputs for creating a run, already parsed from the wire.
#[derive(Debug, Clone)]
pub struct CreateRunParams {
    pub run_type: RunType,
    /// Required for `start_session`; must match the session's agent when
    /// given for `resume_session`.
    pub agent_name: Option<String>,
    pub parameters: Value,
    /// Required for `resume_session`.
    pub session_id: Option<String>,
    pub scope: Option<HashMap<String, String>>,
    pub context: Option<Value>,
    pub execution_mode: Option<ExecutionMode>,
    pub session_name: Option<String>,
}

/// The session/run state machine and everything that hangs off it.
pub struct SessionService {
    sessions: SessionRepository,
    runs: RunRepository,
    agents: Arc<AgentService>,
    log: EventLog,
    lanes: SessionLanes,
    callbacks: CallbackRepository,
    callback_tx: mpsc::UnboundedSender<String>,
    hooks: Arc<HookEngine>,
    dispatch_notify: Arc<Notify>,
    dispatch_timeout: Duration,
    /// Weak back-reference for tasks spawned from `&self` contexts.
    self_ref: std::sync::RwLock<std::sync::Weak<SessionService>>,
}

impl SessionService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: SessionRepository,
        runs: RunRepository,
        agents: Arc<AgentService>,
        log: EventLog,
        callbacks: CallbackRepository,
        callback_tx: mpsc::UnboundedSender<String>,
        hooks: Arc<HookEngine>,
        dispatch_notify: Arc<Notify>,
        dispatch_timeout_seconds: u64,
    ) -> Self {
        Self {
            sessions,
            runs,
            agents,
            log,
            lanes: SessionLanes::new(),
            callbacks,
            callback_tx,
            hooks,
            dispatch_notify,
            dispatch_timeout: Duration::seconds(dispatch_timeout_seconds as i64),
            self_ref: std::sync::RwLock::new(std::sync::Weak::new()),
        }
    }

    pub fn events(&self) -> &EventLog {
        &self.log
    }

    pub fn callback_sender(&self) -> mpsc::UnboundedSender<String> {
        self.callback_tx.clone()
    }

    // ------------------------------------------------------------------
    // Run creation
    // ------------------------------------------------------------------

    /// Create a run: schema gate, placeholder resolution, session/run row
    /// creation under the session lane, then either open the dispatch gate
    /// or kick off the start-hook pipeline.
    pub fn create_run(
        self: &Arc<Self>,
        params: CreateRunParams,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Run>> + Send + '_>> {
        Box::pin(self.create_run_inner(params))
    }

    async fn create_run_inner(self: &Arc<Self>, params: CreateRunParams) -> Result<Run> {
        let (session, creating_session, agent_name) = self.resolve_target(&params).await?;

        let stored = self.agents.get_effective(&agent_name).await?;
        let blueprint = stored.blueprint.clone();

        if let Some(schema_value) = blueprint.effective_parameters_schema() {
            let errors = schema::validate(&schema_value, &params.parameters)?;
            if !errors.is_empty() {
                return Err(CoordinatorError::ParameterValidationFailed {
                    agent_name: agent_name.clone(),
                    validation_errors: errors,
                    parameters_schema: schema_value,
                }
                .into());
            }
        }

        let run_id = ids::run_id();
        let now = Utc::now();

        // Resume runs inherit the previous run's scope unless one is given.
        let scope = match (&params.scope, params.run_type) {
            (Some(scope), _) => Some(scope.clone()),
            (None, RunType::ResumeSession) => self
                .runs
                .latest_for_session(&session.id)
                .await?
                .and_then(|run| run.scope),
            (None, RunType::StartSession) => None,
        };

        let resolved = self.resolve_snapshot(
            &blueprint,
            &params.parameters,
            scope.as_ref(),
            &RuntimeVars {
                run_id: run_id.clone(),
                session_id: session.id.clone(),
                agent_name: agent_name.clone(),
                parent_session_id: session.parent_session_id.clone(),
                created_at: now,
            },
        )?;

        let has_start_hook = blueprint
            .hooks
            .as_ref()
            .is_some_and(|h| h.on_run_start.is_some());

        let _guard = self.lanes.lock(&session.id).await;

        if !creating_session
            && let Some(active) = self.runs.active_for_session(&session.id).await?
        {
            return Err(CoordinatorError::SessionConflict(format!(
                "session {} already has a non-terminal run {}",
                session.id, active.id
            ))
            .into());
        }

        let run_number = self.runs.max_run_number(&session.id).await? + 1;
        let run = Run {
            id: run_id,
            session_id: session.id.clone(),
            run_number,
            run_type: params.run_type,
            parameters: params.parameters.clone(),
            scope,
            context: params.context.clone(),
            status: RunStatus::Pending,
            dispatchable: !has_start_hook,
            dispatch_deadline: (!has_start_hook).then(|| now + self.dispatch_timeout),
            runner_id: None,
            resolved_blueprint: Some(serde_json::to_value(&resolved)?),
            error: None,
            created_at: now,
            claimed_at: None,
            started_at: None,
            stop_requested_at: None,
            completed_at: None,
        };

        if creating_session {
            self.sessions.create(&session).await?;
        }
        self.runs.insert(&run).await?;
        drop(_guard);

        info!(
            "Created run {} (#{} on session {}, agent {})",
            run.id, run.run_number, run.session_id, agent_name
        );

        if has_start_hook {
            let svc = self.clone();
            let run_for_hook = run.clone();
            tokio::spawn(async move {
                svc.start_hook_pipeline(run_for_hook, blueprint).await;
            });
        } else {
            self.dispatch_notify.notify_waiters();
        }

        Ok(run)
    }

    /// Work out which session the run lands on, creating a new one for
    /// `start_session`.
    async fn resolve_target(
        &self,
        params: &CreateRunParams,
    ) -> Result<(Session, bool, String)> {
        match params.run_type {
            RunType::StartSession => {
                if params.session_id.is_some() {
                    return Err(CoordinatorError::InvalidRequest(
                        "session_id is not allowed for start_session runs".to_string(),
                    )
                    .into());
                }
                let agent_name = params.agent_name.clone().ok_or_else(|| {
                    CoordinatorError::InvalidRequest(
                        "agent_name is required for start_session runs".to_string(),
                    )
                })?;

                let parent_session_id = params
                    .context
                    .as_ref()
                    .and_then(|c| c.get("parent_session_id"))
                    .and_then(|v| v.as_str())
                    .map(String::from);
                if let Some(parent) = &parent_session_id
                    && self.sessions.get(parent).await?.is_none()
                {
                    return Err(CoordinatorError::SessionNotFound(parent.clone()).into());
                }

                let session = Session {
                    id: ids::session_id(),
                    name: params.session_name.clone(),
                    agent_name: agent_name.clone(),
                    status: SessionStatus::Pending,
                    parent_session_id,
                    execution_mode: params.execution_mode.unwrap_or_default(),
                    project_dir: None,
                    hostname: None,
                    created_at: Utc::now(),
                };
                Ok((session, true, agent_name))
            }
            RunType::ResumeSession => {
                let session_id = params.session_id.clone().ok_or_else(|| {
                    CoordinatorError::InvalidRequest(
                        "session_id is required for resume_session runs".to_string(),
                    )
                })?;
                let session = self
                    .sessions
                    .get(&session_id)
                    .await?
                    .ok_or(CoordinatorError::SessionNotFound(session_id))?;

                if let Some(agent_name) = &params.agent_name
                    && agent_name != &session.agent_name
                {
                    return Err(CoordinatorError::InvalidRequest(format!(
                        "agent_name '{}' does not match session agent '{}'",
                        agent_name, session.agent_name
                    ))
                    .into());
                }

                let agent_name = session.agent_name.clone();
                Ok((session, false, agent_name))
            }
        }
    }

    fn resolve_snapshot(
        &self,
        blueprint: &AgentBlueprint,
        parameters: &Value,
        scope: Option<&HashMap<String, String>>,
        runtime: &RuntimeVars,
    ) -> Result<ResolvedBlueprint> {
        let mcp_servers = self.agents.mcp_definitions(blueprint)?;
        let env: HashMap<String, String> = std::env::vars().collect();
        let input = ResolutionInput {
            parameters,
            scope,
            env: &env,
            runtime,
        };

        resolve_blueprint(blueprint, mcp_servers, &input).map_err(|err| {
            CoordinatorError::PlaceholderUnresolved {
                references: err.references,
            }
            .into()
        })
    }

    // ------------------------------------------------------------------
    // Start-hook pipeline
    // ------------------------------------------------------------------

    /// Runs detached after creation for runs whose blueprint declares an
    /// `on_run_start` hook. Decides whether the run becomes dispatchable.
    async fn start_hook_pipeline(self: Arc<Self>, run: Run, blueprint: AgentBlueprint) {
        let hook = match blueprint.hooks.as_ref().and_then(|h| h.on_run_start.clone()) {
            Some(hook) => hook,
            None => return,
        };

        let decision = self
            .hooks
            .execute_start_hook(&self, &run, &blueprint.name, &hook)
            .await;

        let outcome = match decision {
            StartHookDecision::Continue(new_parameters) => {
                self.apply_hook_parameters(&run, &blueprint, new_parameters)
                    .await
            }
            StartHookDecision::Block(reason) => {
                let error = format!("hook_blocked: {}", reason);
                self.fail_gated_run(&run, &error).await
            }
            StartHookDecision::Failed(err) => match hook.on_error {
                conductor_protocol::HookOnError::Block => {
                    let error = format!("hook_failed: {}", err);
                    self.fail_gated_run(&run, &error).await
                }
                conductor_protocol::HookOnError::Ignore => {
                    warn!(
                        "Start hook on run {} failed ({}); proceeding with original parameters",
                        run.id, err
                    );
                    self.open_dispatch_gate(&run).await
                }
            },
        };

        if let Err(err) = outcome {
            error!("Start-hook pipeline for run {} errored: {:#}", run.id, err);
        }
    }

    /// Validate and persist hook-enriched parameters, re-resolve the
    /// blueprint snapshot against them, then open the dispatch gate.
    async fn apply_hook_parameters(
        &self,
        run: &Run,
        blueprint: &AgentBlueprint,
        new_parameters: Value,
    ) -> Result<()> {
        if let Some(schema_value) = blueprint.effective_parameters_schema() {
            let errors = schema::validate(&schema_value, &new_parameters)?;
            if !errors.is_empty() {
                let detail: Vec<String> = errors.iter().map(|e| e.path.clone()).collect();
                let error = format!(
                    "hook_failed: hook returned parameters that do not validate ({})",
                    detail.join(", ")
                );
                return self.fail_gated_run(run, &error).await;
            }
        }

        let session = self
            .sessions
            .get(&run.session_id)
            .await?
            .ok_or_else(|| CoordinatorError::SessionNotFound(run.session_id.clone()))?;

        let resolved = self.resolve_snapshot(
            blueprint,
            &new_parameters,
            run.scope.as_ref(),
            &RuntimeVars {
                run_id: run.id.clone(),
                session_id: run.session_id.clone(),
                agent_name: blueprint.name.clone(),
                parent_session_id: session.parent_session_id,
                created_at: run.created_at,
            },
        );
        let resolved = match resolved {
            Ok(resolved) => resolved,
            Err(err) => {
                let error = format!("hook_failed: {}", err);
                return self.fail_gated_run(run, &error).await;
            }
        };

        self.runs
            .update_enriched(&run.id, &new_parameters, &serde_json::to_value(&resolved)?)
            .await?;
        self.open_dispatch_gate(run).await
    }

    async fn open_dispatch_gate(&self, run: &Run) -> Result<()> {
        self.runs
            .mark_dispatchable(&run.id, Utc::now() + self.dispatch_timeout)
            .await?;
        self.dispatch_notify.notify_waiters();
        debug!("Run {} is dispatchable", run.id);
        Ok(())
    }

    /// Fail a run that never left the hook gate.
    async fn fail_gated_run(&self, run: &Run, error: &str) -> Result<()> {
        let _guard = self.lanes.lock(&run.session_id).await;
        let moved = self
            .runs
            .set_terminal(&run.id, RunStatus::Failed, Some(error), &[RunStatus::Pending])
            .await?;
        drop(_guard);

        if moved {
            self.after_terminal(&run.id, RunStatus::Failed, Some(error), false)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Runner-reported transitions
    // ------------------------------------------------------------------

    /// Record that a claimed run landed on a runner (dispatch side).
    pub async fn note_claimed(&self, run: &Run, runner: &RunnerInfo) -> Result<()> {
        self.sessions
            .set_location(
                &run.session_id,
                Some(&runner.runner.hostname),
                runner.runner.project_dir.as_deref(),
            )
            .await?;
        self.sessions
            .set_status(&run.session_id, SessionStatus::Running)
            .await
    }

    /// claimed -> running, with the `run_start` event.
    pub async fn mark_running(&self, run_id: &str, runner_id: &str) -> Result<Run> {
        let run = self.get_run(run_id).await?;
        self.ensure_owner(&run, runner_id)?;

        if !self.runs.set_running(run_id).await? {
            return Err(CoordinatorError::InvalidRequest(format!(
                "run {} is {}, not claimed",
                run_id, run.status
            ))
            .into());
        }

        let agent_name = run
            .resolved_blueprint
            .as_ref()
            .and_then(|b| b.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or_default()
            .to_string();

        self.log
            .append(
                &run.session_id,
                EventPayload::RunStart {
                    run_id: run.id.clone(),
                    run_number: run.run_number,
                    agent_name,
                },
            )
            .await?;
        self.sessions
            .set_status(&run.session_id, SessionStatus::Running)
            .await?;

        self.get_run(run_id).await
    }

    /// Terminal success report. Synthesizes the `result` event when the
    /// runner did not emit one through the ingress.
    pub async fn complete_run(self: &Arc<Self>, run_id: &str, report: CompleteRunRequest) -> Result<Run> {
        let _guard = self.lanes.lock_for_run(&self.runs, run_id).await?;

        let run = self.get_run(run_id).await?;
        self.ensure_owner(&run, &report.runner_id)?;
        if !matches!(run.status, RunStatus::Running | RunStatus::Stopping) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "run {} is {}, not running",
                run_id, run.status
            ))
            .into());
        }

        let existing = self
            .log
            .repo()
            .result_for_run(&run.session_id, &run.id)
            .await?;

        if existing.is_none() && (report.result_text.is_some() || report.result_data.is_some()) {
            self.check_result_contract(&run, report.result_text.as_ref(), report.result_data.as_ref())?;
            self.log
                .append(
                    &run.session_id,
                    EventPayload::Result {
                        run_id: run.id.clone(),
                        result_text: report.result_text.clone(),
                        result_data: report.result_data.clone(),
                    },
                )
                .await?;
        }

        // A cancelled run that finished anyway still ends as stopped.
        let final_status = if run.status == RunStatus::Stopping {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };

        let moved = self
            .runs
            .set_terminal(run_id, final_status, None, &[RunStatus::Running, RunStatus::Stopping])
            .await?;
        drop(_guard);
        if !moved {
            return Err(CoordinatorError::InvalidRequest(format!(
                "run {} was finalized concurrently",
                run_id
            ))
            .into());
        }

        self.after_terminal(run_id, final_status, None, true).await?;
        self.get_run(run_id).await
    }

    /// Terminal failure report.
    pub async fn fail_run(self: &Arc<Self>, run_id: &str, runner_id: &str, error: &str) -> Result<Run> {
        let _guard = self.lanes.lock_for_run(&self.runs, run_id).await?;

        let run = self.get_run(run_id).await?;
        self.ensure_owner(&run, runner_id)?;
        if !matches!(
            run.status,
            RunStatus::Claimed | RunStatus::Running | RunStatus::Stopping
        ) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "run {} is {}, not active",
                run_id, run.status
            ))
            .into());
        }

        // A failure report while stopping acknowledges the cancellation.
        let final_status = if run.status == RunStatus::Stopping {
            RunStatus::Stopped
        } else {
            RunStatus::Failed
        };

        let moved = self
            .runs
            .set_terminal(
                run_id,
                final_status,
                Some(error),
                &[RunStatus::Claimed, RunStatus::Running, RunStatus::Stopping],
            )
            .await?;
        drop(_guard);
        if !moved {
            return Err(CoordinatorError::InvalidRequest(format!(
                "run {} was finalized concurrently",
                run_id
            ))
            .into());
        }

        self.after_terminal(run_id, final_status, Some(error), true)
            .await?;
        self.get_run(run_id).await
    }

    /// External cancellation request.
    pub async fn stop_run(self: &Arc<Self>, run_id: &str) -> Result<Run> {
        let _guard = self.lanes.lock_for_run(&self.runs, run_id).await?;
        let run = self.get_run(run_id).await?;

        match run.status {
            RunStatus::Pending => {
                let moved = self
                    .runs
                    .set_terminal(run_id, RunStatus::Stopped, None, &[RunStatus::Pending])
                    .await?;
                drop(_guard);
                if moved {
                    self.after_terminal(run_id, RunStatus::Stopped, None, false)
                        .await?;
                }
            }
            RunStatus::Claimed | RunStatus::Running => {
                self.runs.set_stopping(run_id).await?;
            }
            RunStatus::Stopping => {}
            status => {
                return Err(CoordinatorError::InvalidRequest(format!(
                    "run {} is already {}",
                    run_id, status
                ))
                .into());
            }
        }

        self.get_run(run_id).await
    }

    // ------------------------------------------------------------------
    // Sweeper entry points
    // ------------------------------------------------------------------

    /// Fail a pending run whose dispatch window expired.
    pub async fn fail_dispatch_expired(&self, run: &Run, error: &str) -> Result<()> {
        let _guard = self.lanes.lock(&run.session_id).await;
        let moved = self
            .runs
            .set_terminal(&run.id, RunStatus::Failed, Some(error), &[RunStatus::Pending])
            .await?;
        drop(_guard);

        if moved {
            warn!("Run {} failed: {}", run.id, error);
            self.after_terminal(&run.id, RunStatus::Failed, Some(error), false)
                .await?;
        }
        Ok(())
    }

    /// Fail a claimed run whose lease expired before the runner confirmed.
    pub async fn fail_lease_expired(&self, run: &Run, error: &str) -> Result<()> {
        let _guard = self.lanes.lock(&run.session_id).await;
        let moved = self
            .runs
            .set_terminal(&run.id, RunStatus::Failed, Some(error), &[RunStatus::Claimed])
            .await?;
        drop(_guard);

        if moved {
            warn!("Run {} failed: {}", run.id, error);
            self.after_terminal(&run.id, RunStatus::Failed, Some(error), false)
                .await?;
        }
        Ok(())
    }

    /// Force-stop a stopping run whose runner never acknowledged.
    pub async fn force_stop_expired(&self, run: &Run) -> Result<()> {
        let _guard = self.lanes.lock(&run.session_id).await;
        let moved = self
            .runs
            .set_terminal(&run.id, RunStatus::Stopped, None, &[RunStatus::Stopping])
            .await?;
        drop(_guard);

        if moved {
            warn!("Run {} force-stopped after unacknowledged cancellation", run.id);
            self.after_terminal(&run.id, RunStatus::Stopped, None, false)
                .await?;
        }
        Ok(())
    }

    /// Post-commit finalization for runs failed by runner removal. The rows
    /// were already flipped inside the removal transaction.
    pub async fn finalize_orphaned_run(&self, run: &Run, error: &str) -> Result<()> {
        self.after_terminal(&run.id, RunStatus::Failed, Some(error), false)
            .await
    }

    // ------------------------------------------------------------------
    // Terminal plumbing
    // ------------------------------------------------------------------

    /// Everything that happens after a run reached a terminal state:
    /// lifecycle event, session status projection, finish hook, callback.
    async fn after_terminal(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        fire_finish_hook: bool,
    ) -> Result<()> {
        let run = self.get_run(run_id).await?;

        let payload = match status {
            RunStatus::Completed => EventPayload::RunCompleted {
                run_id: run.id.clone(),
            },
            RunStatus::Failed => EventPayload::RunFailed {
                run_id: run.id.clone(),
                error: error.unwrap_or("unknown error").to_string(),
            },
            RunStatus::Stopped => EventPayload::RunStopped {
                run_id: run.id.clone(),
            },
            other => anyhow::bail!("after_terminal called with non-terminal {}", other),
        };
        self.log.append(&run.session_id, payload).await?;

        self.sessions
            .set_status(&run.session_id, SessionStatus::from_run_status(status))
            .await?;

        let result = self.result_snapshot(&run).await?;

        if fire_finish_hook {
            self.spawn_finish_hook(&run, status, &result).await;
        }

        self.enqueue_callback(&run, status, result).await?;
        Ok(())
    }

    /// Capture the run's result for hooks and callbacks: the `result` event
    /// if present, the last assistant message as legacy fallback.
    async fn result_snapshot(&self, run: &Run) -> Result<ChildResult> {
        let mut snapshot = ChildResult {
            result_text: None,
            result_data: None,
            error: run.error.clone(),
        };

        if let Some(envelope) = self
            .log
            .repo()
            .result_for_run(&run.session_id, &run.id)
            .await?
        {
            if let EventPayload::Result {
                result_text,
                result_data,
                ..
            } = envelope.payload
            {
                snapshot.result_text = result_text;
                snapshot.result_data = result_data;
            }
        } else {
            snapshot.result_text = self
                .log
                .repo()
                .last_assistant_message(&run.session_id, &run.id)
                .await?;
        }

        Ok(snapshot)
    }

    async fn spawn_finish_hook(&self, run: &Run, status: RunStatus, result: &ChildResult) {
        let stored = match self.session_blueprint(run).await {
            Ok(Some(stored)) => stored,
            _ => return,
        };
        let Some(hook) = stored
            .hooks
            .as_ref()
            .and_then(|h| h.on_run_finish.clone())
        else {
            return;
        };

        // Finish hooks observe; they run detached and their outcome is
        // ignored.
        let svc = match self.self_arc() {
            Some(svc) => svc,
            None => return,
        };
        let run = run.clone();
        let result = result.clone();
        let agent_name = stored.name.clone();
        tokio::spawn(async move {
            let engine = svc.hooks.clone();
            engine
                .execute_finish_hook(&svc, &run, &agent_name, &hook, status, &result)
                .await;
        });
    }

    /// The effective blueprint of the run's agent, if it still exists.
    async fn session_blueprint(&self, run: &Run) -> Result<Option<AgentBlueprint>> {
        let session = match self.sessions.get(&run.session_id).await? {
            Some(session) => session,
            None => return Ok(None),
        };
        match self.agents.get_effective(&session.agent_name).await {
            Ok(stored) => Ok(Some(stored.blueprint)),
            Err(_) => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Enqueue a callback record when the session reports to a parent.
    async fn enqueue_callback(
        &self,
        run: &Run,
        status: RunStatus,
        result: ChildResult,
    ) -> Result<()> {
        let session = self
            .sessions
            .get(&run.session_id)
            .await?
            .ok_or_else(|| CoordinatorError::SessionNotFound(run.session_id.clone()))?;

        let Some(parent_session_id) = session.parent_session_id else {
            return Ok(());
        };
        if session.execution_mode != ExecutionMode::AsyncCallback {
            return Ok(());
        }

        let record = CallbackRecord {
            id: ids::callback_id(),
            parent_session_id,
            child_session_id: run.session_id.clone(),
            child_run_id: run.id.clone(),
            child_status: status,
            child_result: result,
            status: CallbackStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            resume_run_id: None,
        };

        if self.callbacks.insert(&record).await? {
            debug!(
                "Enqueued callback {} for parent {}",
                record.id, record.parent_session_id
            );
            let _ = self.callback_tx.send(record.id);
        }
        Ok(())
    }

    /// Deliver one callback: claim the record, then synthesize the resume
    /// run on the parent under its lane. A busy parent re-opens the record
    /// and the caller retries.
    pub async fn deliver_callback(self: &Arc<Self>, callback_id: &str) -> Result<()> {
        let Some(record) = self.callbacks.get(callback_id).await? else {
            return Ok(());
        };
        if record.status == CallbackStatus::Delivered {
            return Ok(());
        }

        if self.sessions.get(&record.parent_session_id).await?.is_none() {
            warn!(
                "Callback {} addressed to missing session {}; dropping",
                callback_id, record.parent_session_id
            );
            let _ = self.callbacks.claim_for_delivery(callback_id).await?;
            return Ok(());
        }

        if !self.callbacks.claim_for_delivery(callback_id).await? {
            return Ok(());
        }

        let prompt = render_callback_prompt(
            &record.child_session_id,
            record.child_status,
            &record.child_result,
        );

        let created = self
            .create_run(CreateRunParams {
                run_type: RunType::ResumeSession,
                agent_name: None,
                parameters: serde_json::json!({ "prompt": prompt }),
                session_id: Some(record.parent_session_id.clone()),
                scope: None,
                context: None,
                execution_mode: None,
                session_name: None,
            })
            .await;

        match created {
            Ok(resume_run) => {
                self.callbacks
                    .set_resume_run(callback_id, &resume_run.id)
                    .await?;
                info!(
                    "Delivered callback {} as resume run {} on session {}",
                    callback_id, resume_run.id, record.parent_session_id
                );
                Ok(())
            }
            Err(err) => {
                if let Some(CoordinatorError::SessionConflict(_)) =
                    err.downcast_ref::<CoordinatorError>()
                {
                    // Parent is busy; re-open for retry.
                    self.callbacks.reopen(callback_id).await?;
                    return Err(err);
                }
                error!(
                    "Callback {} could not resume session {}: {:#}",
                    callback_id, record.parent_session_id, err
                );
                Ok(())
            }
        }
    }

    pub async fn pending_callbacks(&self) -> Result<Vec<CallbackRecord>> {
        self.callbacks.list_pending().await
    }

    // ------------------------------------------------------------------
    // Event ingress
    // ------------------------------------------------------------------

    /// Append a batch of runner events to a session's log, enforcing the
    /// result contract on `result` events.
    pub async fn ingest_events(&self, request: IngestEventsRequest) -> Result<Vec<i64>> {
        if self.sessions.get(&request.session_id).await?.is_none() {
            return Err(CoordinatorError::SessionNotFound(request.session_id).into());
        }

        let mut sequences = Vec::with_capacity(request.events.len());
        for event in request.events {
            if let EventPayload::Result {
                run_id,
                result_text,
                result_data,
            } = &event.payload
            {
                let run = self.get_run(run_id).await?;
                if run.session_id != request.session_id {
                    return Err(CoordinatorError::InvalidRequest(format!(
                        "run {} does not belong to session {}",
                        run_id, request.session_id
                    ))
                    .into());
                }
                if self
                    .log
                    .repo()
                    .result_for_run(&run.session_id, run_id)
                    .await?
                    .is_some()
                {
                    return Err(CoordinatorError::InvalidRequest(format!(
                        "run {} already has a result event",
                        run_id
                    ))
                    .into());
                }
                self.check_result_contract(&run, result_text.as_ref(), result_data.as_ref())?;
            }

            let timestamp = event.timestamp.unwrap_or_else(Utc::now);
            let envelope = self
                .log
                .append_at(&request.session_id, timestamp, event.payload)
                .await?;
            sequences.push(envelope.sequence);
        }

        Ok(sequences)
    }

    /// Result exclusivity and the typed output contract: procedural agents
    /// and agents with an output schema emit `result_data` only; other AI
    /// agents emit `result_text` only.
    fn check_result_contract(
        &self,
        run: &Run,
        result_text: Option<&String>,
        result_data: Option<&Value>,
    ) -> Result<()> {
        let snapshot: Option<ResolvedBlueprint> = run
            .resolved_blueprint
            .clone()
            .map(serde_json::from_value)
            .transpose()
            .context("parsing resolved blueprint snapshot")?;

        if result_text.is_some() && result_data.is_some() {
            return Err(CoordinatorError::InvalidRequest(
                "result_text and result_data are mutually exclusive".to_string(),
            )
            .into());
        }
        if result_text.is_none() && result_data.is_none() {
            return Err(CoordinatorError::InvalidRequest(
                "a result requires result_text or result_data".to_string(),
            )
            .into());
        }

        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        let structured = snapshot.agent_type == conductor_protocol::AgentType::Procedural
            || snapshot.output_schema.is_some();

        if structured && result_data.is_none() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "agent '{}' declares a structured result; emit result_data",
                snapshot.name
            ))
            .into());
        }
        if !structured && result_data.is_some() {
            return Err(CoordinatorError::InvalidRequest(format!(
                "agent '{}' does not declare a structured result; emit result_text",
                snapshot.name
            ))
            .into());
        }

        if let (Some(schema_value), Some(data)) = (&snapshot.output_schema, result_data) {
            let errors = schema::validate(schema_value, data)?;
            if !errors.is_empty() {
                let paths: Vec<String> = errors.iter().map(|e| e.path.clone()).collect();
                return Err(CoordinatorError::InvalidRequest(format!(
                    "result_data does not conform to the output schema ({})",
                    paths.join(", ")
                ))
                .into());
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.runs
            .get(run_id)
            .await?
            .ok_or_else(|| CoordinatorError::RunNotFound(run_id.to_string()).into())
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        session_id: Option<&str>,
    ) -> Result<Vec<Run>> {
        self.runs.list(status, session_id).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.to_string()).into())
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.sessions.list().await
    }

    pub async fn session_runs(&self, session_id: &str) -> Result<Vec<Run>> {
        self.get_session(session_id).await?;
        self.runs.list_by_session(session_id).await
    }

    /// The session's authoritative result: the `result` event of its most
    /// recent completed run, falling back to the last assistant message.
    /// `None` means the session has no terminal result yet.
    pub async fn session_result(&self, session_id: &str) -> Result<Option<ChildResult>> {
        self.get_session(session_id).await?;

        let Some(run) = self.runs.latest_completed_for_session(session_id).await? else {
            return Ok(None);
        };

        let snapshot = self.result_snapshot(&run).await?;
        if snapshot.result_text.is_none() && snapshot.result_data.is_none() {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    pub async fn session_events(
        &self,
        session_id: &str,
        since: i64,
    ) -> Result<Vec<conductor_protocol::EventEnvelope>> {
        self.get_session(session_id).await?;
        self.log.repo().list_since(session_id, since).await
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn ensure_owner(&self, run: &Run, runner_id: &str) -> Result<()> {
        if run.runner_id.as_deref() != Some(runner_id) {
            return Err(CoordinatorError::InvalidRequest(format!(
                "run {} is not assigned to runner {}",
                run.id, runner_id
            ))
            .into());
        }
        Ok(())
    }

    /// Weak self-access for detached finish hooks. Populated by
    /// [`SessionService::install_self`] right after construction.
    fn self_arc(&self) -> Option<Arc<Self>> {
        self.self_ref.read().ok()?.upgrade()
    }

    pub fn install_self(self: &Arc<Self>) {
        if let Ok(mut slot) = self.self_ref.write() {
            *slot = Arc::downgrade(self);
        }
    }
}

impl SessionLanes {
    /// Lock the lane of the session owning `run_id`.
    async fn lock_for_run(
        &self,
        runs: &RunRepository,
        run_id: &str,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>> {
        let run = runs
            .get(run_id)
            .await?
            .ok_or_else(|| CoordinatorError::RunNotFound(run_id.to_string()))?;
        Ok(self.lock(&run.session_id).await)
    }
}
