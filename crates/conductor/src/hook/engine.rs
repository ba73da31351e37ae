//! Hook execution engine.
//!
//! `type="agent"` hooks are nested synchronous coordinator operations: the
//! engine creates a run for the hook agent on a fresh detached session,
//! waits for its terminal result, and interprets the result as a
//! [`HookAction`]. Hook agents cannot themselves declare hooks (rejected at
//! registration), so nesting never recurses.

use anyhow::Result;
use chrono::Utc;
use log::{debug, warn};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use conductor_protocol::{EventPayload, HookAction, HookOutcome, HookSpec};

use crate::callback::ChildResult;
use crate::event::EventLog;
use crate::ids;
use crate::run::{Run, RunStatus, RunType};
use crate::session::service::{CreateRunParams, SessionService};
use crate::session::ExecutionMode;

use super::models::{HookPoint, HookRecord};
use super::repository::HookRepository;

/// What an `on_run_start` hook decided.
#[derive(Debug)]
pub enum StartHookDecision {
    /// Proceed with these (possibly enriched) parameters.
    Continue(Value),
    /// Fail the run with `hook_blocked`.
    Block(String),
    /// The hook itself errored; `on_error` decides what happens.
    Failed(String),
}

/// Engine executing blueprint hooks as nested runs.
pub struct HookEngine {
    log: EventLog,
    records: HookRepository,
    timeout: Duration,
    poll_interval: Duration,
}

impl HookEngine {
    pub fn new(log: EventLog, records: HookRepository, timeout_seconds: u64) -> Self {
        Self {
            log,
            records,
            timeout: Duration::from_secs(timeout_seconds),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Execute an `on_run_start` hook for `run`. Emits the hook lifecycle
    /// events and persists the hook record; the caller applies `on_error`
    /// semantics to the decision.
    pub async fn execute_start_hook(
        &self,
        svc: &Arc<SessionService>,
        run: &Run,
        guarded_agent: &str,
        hook: &HookSpec,
    ) -> StartHookDecision {
        let Some(target) = hook.agent_name.clone() else {
            return StartHookDecision::Failed("hook has no agent_name".to_string());
        };

        let record = self
            .start_record(run, HookPoint::OnRunStart, &target)
            .await;

        let input = json!({
            "parameters": run.parameters,
            "agent_name": guarded_agent,
            "session_id": run.session_id,
            "run_id": run.id,
        });

        let decision = match self.invoke(svc, run, &target, input).await {
            Ok(Some(action)) => match action {
                HookAction::Continue { parameters } => {
                    StartHookDecision::Continue(Value::Object(parameters.into_iter().collect()))
                }
                HookAction::Block { block_reason } => StartHookDecision::Block(block_reason),
            },
            Ok(None) => {
                // No parseable action: pass through unchanged.
                StartHookDecision::Continue(run.parameters.clone())
            }
            Err(err) => StartHookDecision::Failed(err.to_string()),
        };

        self.finish_start_record(run, &target, record.as_deref(), &decision)
            .await;
        decision
    }

    /// Execute an `on_run_finish` hook. Output is ignored; failures are
    /// logged and recorded but never change the run's terminal state.
    pub async fn execute_finish_hook(
        &self,
        svc: &Arc<SessionService>,
        run: &Run,
        guarded_agent: &str,
        hook: &HookSpec,
        status: RunStatus,
        result: &ChildResult,
    ) {
        let Some(target) = hook.agent_name.clone() else {
            warn!("Finish hook on run {} has no agent_name", run.id);
            return;
        };

        let record = self
            .start_record(run, HookPoint::OnRunFinish, &target)
            .await;

        let input = json!({
            "parameters": run.parameters,
            "agent_name": guarded_agent,
            "session_id": run.session_id,
            "run_id": run.id,
            "status": status,
            "result_text": result.result_text,
            "result_data": result.result_data,
            "error": result.error,
        });

        match self.invoke(svc, run, &target, input).await {
            Ok(_) => {
                if let Some(id) = record.as_deref() {
                    let _ = self.records.finish(id, HookOutcome::Continue, None, None).await;
                }
                let _ = self
                    .log
                    .append(
                        &run.session_id,
                        EventPayload::HookComplete {
                            run_id: run.id.clone(),
                            hook_type: HookPoint::OnRunFinish.to_string(),
                            agent_name: target,
                        },
                    )
                    .await;
            }
            Err(err) => {
                warn!("Finish hook on run {} failed: {}", run.id, err);
                if let Some(id) = record.as_deref() {
                    let _ = self
                        .records
                        .finish(id, HookOutcome::Failed, None, Some(&err.to_string()))
                        .await;
                }
                let _ = self
                    .log
                    .append(
                        &run.session_id,
                        EventPayload::HookFailed {
                            run_id: run.id.clone(),
                            hook_type: HookPoint::OnRunFinish.to_string(),
                            agent_name: target,
                            error: err.to_string(),
                        },
                    )
                    .await;
            }
        }
    }

    /// Create the nested hook run, wait for its terminal state, and parse
    /// its result into a [`HookAction`] when one is present.
    async fn invoke(
        &self,
        svc: &Arc<SessionService>,
        run: &Run,
        target: &str,
        input: Value,
    ) -> Result<Option<HookAction>> {
        let child = svc
            .create_run(CreateRunParams {
                run_type: RunType::StartSession,
                agent_name: Some(target.to_string()),
                parameters: input,
                session_id: None,
                scope: run.scope.clone(),
                context: None,
                execution_mode: Some(ExecutionMode::Detached),
                session_name: Some(format!("hook:{}:{}", target, run.id)),
            })
            .await?;

        let terminal = self.wait_for_terminal(svc, &child.id).await?;
        debug!(
            "Hook run {} for run {} finished with status {}",
            child.id, run.id, terminal.status
        );

        match terminal.status {
            RunStatus::Completed => {
                let result = self
                    .log
                    .repo()
                    .result_for_run(&child.session_id, &child.id)
                    .await?;

                let Some(envelope) = result else {
                    return Ok(None);
                };
                let EventPayload::Result {
                    result_text,
                    result_data,
                    ..
                } = envelope.payload
                else {
                    return Ok(None);
                };

                let action_value = match (result_data, result_text) {
                    (Some(data), _) => Some(data),
                    (None, Some(text)) => serde_json::from_str::<Value>(&text).ok(),
                    (None, None) => None,
                };

                match action_value {
                    Some(value) => {
                        let action: HookAction =
                            serde_json::from_value(value).map_err(|err| {
                                anyhow::anyhow!("hook result is not a valid action: {}", err)
                            })?;
                        Ok(Some(action))
                    }
                    None => Ok(None),
                }
            }
            RunStatus::Failed => anyhow::bail!(
                "hook run {} failed: {}",
                terminal.id,
                terminal.error.unwrap_or_else(|| "unknown error".to_string())
            ),
            status => anyhow::bail!("hook run {} ended as {}", terminal.id, status),
        }
    }

    async fn wait_for_terminal(&self, svc: &Arc<SessionService>, run_id: &str) -> Result<Run> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let run = svc.get_run(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("hook run {} timed out", run_id);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn start_record(&self, run: &Run, point: HookPoint, target: &str) -> Option<String> {
        let record = HookRecord {
            id: ids::hook_record_id(),
            run_id: run.id.clone(),
            hook_type: point,
            target_agent: target.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
            block_reason: None,
            error: None,
        };

        if let Err(err) = self.records.insert_started(&record).await {
            warn!("Failed to persist hook record for run {}: {}", run.id, err);
        }

        let _ = self
            .log
            .append(
                &run.session_id,
                EventPayload::HookStart {
                    run_id: run.id.clone(),
                    hook_type: point.to_string(),
                    agent_name: target.to_string(),
                },
            )
            .await;

        Some(record.id)
    }

    async fn finish_start_record(
        &self,
        run: &Run,
        target: &str,
        record_id: Option<&str>,
        decision: &StartHookDecision,
    ) {
        let (outcome, block_reason, error) = match decision {
            StartHookDecision::Continue(_) => (HookOutcome::Continue, None, None),
            StartHookDecision::Block(reason) => (HookOutcome::Block, Some(reason.clone()), None),
            StartHookDecision::Failed(err) => (HookOutcome::Failed, None, Some(err.clone())),
        };

        if let Some(id) = record_id {
            let _ = self
                .records
                .finish(id, outcome, block_reason.as_deref(), error.as_deref())
                .await;
        }

        let payload = match decision {
            StartHookDecision::Continue(_) => EventPayload::HookComplete {
                run_id: run.id.clone(),
                hook_type: HookPoint::OnRunStart.to_string(),
                agent_name: target.to_string(),
            },
            StartHookDecision::Block(reason) => EventPayload::HookBlocked {
                run_id: run.id.clone(),
                hook_type: HookPoint::OnRunStart.to_string(),
                agent_name: target.to_string(),
                block_reason: reason.clone(),
            },
            StartHookDecision::Failed(err) => EventPayload::HookFailed {
                run_id: run.id.clone(),
                hook_type: HookPoint::OnRunStart.to_string(),
                agent_name: target.to_string(),
                error: err.clone(),
            },
        };

        let _ = self.log.append(&run.session_id, payload).await;
    }
}
