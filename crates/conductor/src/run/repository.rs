//! Run persistence.
//!
//! Transition updates carry their legal prior statuses in the SQL guard, so
//! a lost race shows up as zero affected rows instead of a corrupted state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use super::models::{Run, RunStatus, RunType};

const RUN_COLUMNS: &str = r#"
    id, session_id, run_number, run_type, parameters, scope, context, status,
    dispatchable, dispatch_deadline, runner_id, resolved_blueprint, error,
    created_at, claimed_at, started_at, stop_requested_at, completed_at
"#;

fn parse_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|raw| raw.parse::<DateTime<Utc>>().context("parsing run timestamp"))
        .transpose()
}

fn row_to_run(row: &SqliteRow) -> Result<Run> {
    let parameters: String = row.try_get("parameters")?;
    let scope: Option<String> = row.try_get("scope")?;
    let context: Option<String> = row.try_get("context")?;
    let resolved_blueprint: Option<String> = row.try_get("resolved_blueprint")?;
    let status: String = row.try_get("status")?;
    let run_type: String = row.try_get("run_type")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Run {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        run_number: row.try_get("run_number")?,
        run_type: run_type.parse::<RunType>().map_err(anyhow::Error::msg)?,
        parameters: serde_json::from_str(&parameters).context("parsing run parameters")?,
        scope: scope
            .map(|raw| serde_json::from_str(&raw).context("parsing run scope"))
            .transpose()?,
        context: context
            .map(|raw| serde_json::from_str(&raw).context("parsing run context"))
            .transpose()?,
        status: status.parse::<RunStatus>().map_err(anyhow::Error::msg)?,
        dispatchable: row.try_get::<i64, _>("dispatchable")? != 0,
        dispatch_deadline: parse_ts(row.try_get("dispatch_deadline")?)?,
        runner_id: row.try_get("runner_id")?,
        resolved_blueprint: resolved_blueprint
            .map(|raw| serde_json::from_str(&raw).context("parsing resolved blueprint"))
            .transpose()?,
        error: row.try_get("error")?,
        created_at: created_at.parse().context("parsing run created_at")?,
        claimed_at: parse_ts(row.try_get("claimed_at")?)?,
        started_at: parse_ts(row.try_get("started_at")?)?,
        stop_requested_at: parse_ts(row.try_get("stop_requested_at")?)?,
        completed_at: parse_ts(row.try_get("completed_at")?)?,
    })
}

/// Repository for run persistence.
#[derive(Debug, Clone)]
pub struct RunRepository {
    pool: SqlitePool,
}

impl RunRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, run: &Run) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (
                id, session_id, run_number, run_type, parameters, scope, context, status,
                dispatchable, dispatch_deadline, runner_id, resolved_blueprint, error,
                created_at, claimed_at, started_at, stop_requested_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.session_id)
        .bind(run.run_number)
        .bind(run.run_type.to_string())
        .bind(run.parameters.to_string())
        .bind(
            run.scope
                .as_ref()
                .map(|s| serde_json::to_string(s))
                .transpose()?,
        )
        .bind(run.context.as_ref().map(|c| c.to_string()))
        .bind(run.status.to_string())
        .bind(run.dispatchable as i64)
        .bind(run.dispatch_deadline.map(|t| t.to_rfc3339()))
        .bind(&run.runner_id)
        .bind(run.resolved_blueprint.as_ref().map(|b| b.to_string()))
        .bind(&run.error)
        .bind(run.created_at.to_rfc3339())
        .bind(run.claimed_at.map(|t| t.to_rfc3339()))
        .bind(run.started_at.map(|t| t.to_rfc3339()))
        .bind(run.stop_requested_at.map(|t| t.to_rfc3339()))
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .context("inserting run")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Run>> {
        let query = format!("SELECT {} FROM runs WHERE id = ?", RUN_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching run")?;

        row.as_ref().map(row_to_run).transpose()
    }

    /// List runs, optionally filtered by status and/or session.
    pub async fn list(
        &self,
        status: Option<RunStatus>,
        session_id: Option<&str>,
    ) -> Result<Vec<Run>> {
        let mut sql = format!("SELECT {} FROM runs WHERE 1 = 1", RUN_COLUMNS);
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        sql.push_str(" ORDER BY created_at ASC");

        let mut query = sqlx::query(&sql);
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }
        if let Some(session_id) = session_id {
            query = query.bind(session_id);
        }

        let rows = query.fetch_all(&self.pool).await.context("listing runs")?;
        rows.iter().map(row_to_run).collect()
    }

    pub async fn list_by_session(&self, session_id: &str) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM runs WHERE session_id = ? ORDER BY run_number ASC",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .context("listing session runs")?;

        rows.iter().map(row_to_run).collect()
    }

    /// The session's single non-terminal run, if any.
    pub async fn active_for_session(&self, session_id: &str) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {} FROM runs \
             WHERE session_id = ? AND status IN ('pending', 'claimed', 'running', 'stopping') \
             ORDER BY run_number DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching active run")?;

        row.as_ref().map(row_to_run).transpose()
    }

    /// The session's latest run by run number.
    pub async fn latest_for_session(&self, session_id: &str) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {} FROM runs WHERE session_id = ? ORDER BY run_number DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching latest run")?;

        row.as_ref().map(row_to_run).transpose()
    }

    /// The session's most recent completed run.
    pub async fn latest_completed_for_session(&self, session_id: &str) -> Result<Option<Run>> {
        let query = format!(
            "SELECT {} FROM runs WHERE session_id = ? AND status = 'completed' \
             ORDER BY run_number DESC LIMIT 1",
            RUN_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching latest completed run")?;

        row.as_ref().map(row_to_run).transpose()
    }

    pub async fn max_run_number(&self, session_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(run_number), 0) AS n FROM runs WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("reading max run number")?;

        Ok(row.try_get("n")?)
    }

    /// Pending, dispatchable runs in FIFO order.
    pub async fn list_claimable(&self) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM runs WHERE status = 'pending' AND dispatchable = 1 \
             ORDER BY created_at ASC",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing claimable runs")?;

        rows.iter().map(row_to_run).collect()
    }

    /// Atomically claim a pending run for a runner. Returns false if another
    /// runner won the race.
    pub async fn try_claim(&self, run_id: &str, runner_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'claimed', runner_id = ?, claimed_at = ?
            WHERE id = ? AND status = 'pending' AND dispatchable = 1
            "#,
        )
        .bind(runner_id)
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("claiming run")?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition claimed -> running. Returns false on a lost race or an
    /// illegal prior state.
    pub async fn set_running(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'running', started_at = ?
            WHERE id = ? AND status = 'claimed'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("marking run running")?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition to a terminal status from any of the given prior statuses.
    pub async fn set_terminal(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        allowed_from: &[RunStatus],
    ) -> Result<bool> {
        anyhow::ensure!(status.is_terminal(), "status {} is not terminal", status);

        let placeholders = vec!["?"; allowed_from.len()].join(", ");
        let sql = format!(
            "UPDATE runs SET status = ?, error = COALESCE(?, error), completed_at = ? \
             WHERE id = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(status.to_string())
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .bind(run_id);
        for prior in allowed_from {
            query = query.bind(prior.to_string());
        }

        let result = query.execute(&self.pool).await.context("finalizing run")?;
        Ok(result.rows_affected() == 1)
    }

    /// Transition claimed|running -> stopping.
    pub async fn set_stopping(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'stopping', stop_requested_at = ?
            WHERE id = ? AND status IN ('claimed', 'running')
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("marking run stopping")?;

        Ok(result.rows_affected() == 1)
    }

    /// Persist hook-enriched parameters together with the re-resolved
    /// blueprint snapshot (start-hook enrichment, before dispatch).
    pub async fn update_enriched(
        &self,
        run_id: &str,
        parameters: &serde_json::Value,
        resolved_blueprint: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET parameters = ?, resolved_blueprint = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(parameters.to_string())
        .bind(resolved_blueprint.to_string())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("updating enriched run")?;

        Ok(())
    }

    /// Open the dispatch gate after a start hook continued.
    pub async fn mark_dispatchable(&self, run_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE runs SET dispatchable = 1, dispatch_deadline = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(deadline.to_rfc3339())
        .bind(run_id)
        .execute(&self.pool)
        .await
        .context("marking run dispatchable")?;

        Ok(())
    }

    /// Pending runs whose dispatch deadline has passed.
    pub async fn list_dispatch_expired(&self, now: DateTime<Utc>) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM runs \
             WHERE status = 'pending' AND dispatchable = 1 AND dispatch_deadline < ? \
             ORDER BY created_at ASC",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .context("listing dispatch-expired runs")?;

        rows.iter().map(row_to_run).collect()
    }

    /// Claimed runs whose lease has expired: the runner never confirmed
    /// `running` within the window.
    pub async fn list_lease_expired(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM runs WHERE status = 'claimed' AND claimed_at < ?",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(claimed_before.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .context("listing lease-expired runs")?;

        rows.iter().map(row_to_run).collect()
    }

    /// Stopping runs whose runner never acknowledged within the window.
    pub async fn list_stop_expired(&self, requested_before: DateTime<Utc>) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM runs WHERE status = 'stopping' AND stop_requested_at < ?",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(requested_before.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .context("listing stop-expired runs")?;

        rows.iter().map(row_to_run).collect()
    }

    /// Active runs assigned to a runner.
    pub async fn list_active_for_runner(&self, runner_id: &str) -> Result<Vec<Run>> {
        let query = format!(
            "SELECT {} FROM runs \
             WHERE runner_id = ? AND status IN ('claimed', 'running', 'stopping')",
            RUN_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(runner_id)
            .fetch_all(&self.pool)
            .await
            .context("listing runner's active runs")?;

        rows.iter().map(row_to_run).collect()
    }

    /// Fail a runner's active runs inside an enclosing transaction (runner
    /// removal path).
    pub async fn fail_active_for_runner_tx(
        &self,
        conn: &mut SqliteConnection,
        runner_id: &str,
        error: &str,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed', error = ?, completed_at = ?
            WHERE runner_id = ? AND status IN ('claimed', 'running', 'stopping')
            "#,
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(runner_id)
        .execute(conn)
        .await
        .context("failing runner's active runs")?;

        Ok(result.rows_affected())
    }
}
