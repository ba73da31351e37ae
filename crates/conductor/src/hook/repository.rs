//! Hook record persistence.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use conductor_protocol::HookOutcome;

use super::models::{HookPoint, HookRecord};

const HOOK_COLUMNS: &str = r#"
    id, run_id, hook_type, target_agent, started_at, finished_at,
    outcome, block_reason, error
"#;

fn row_to_record(row: &SqliteRow) -> Result<HookRecord> {
    let hook_type: String = row.try_get("hook_type")?;
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let outcome: Option<String> = row.try_get("outcome")?;

    Ok(HookRecord {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        hook_type: hook_type.parse::<HookPoint>().map_err(anyhow::Error::msg)?,
        target_agent: row.try_get("target_agent")?,
        started_at: started_at.parse().context("parsing hook started_at")?,
        finished_at: finished_at
            .map(|raw| raw.parse::<DateTime<Utc>>())
            .transpose()
            .context("parsing hook finished_at")?,
        outcome: outcome
            .map(|raw| raw.parse::<HookOutcome>())
            .transpose()
            .map_err(anyhow::Error::msg)?,
        block_reason: row.try_get("block_reason")?,
        error: row.try_get("error")?,
    })
}

/// Repository for hook invocation records.
#[derive(Debug, Clone)]
pub struct HookRepository {
    pool: SqlitePool,
}

impl HookRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_started(&self, record: &HookRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hook_records (
                id, run_id, hook_type, target_agent, started_at, finished_at,
                outcome, block_reason, error
            ) VALUES (?, ?, ?, ?, ?, NULL, NULL, NULL, NULL)
            "#,
        )
        .bind(&record.id)
        .bind(&record.run_id)
        .bind(record.hook_type.to_string())
        .bind(&record.target_agent)
        .bind(record.started_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("inserting hook record")?;

        Ok(())
    }

    pub async fn finish(
        &self,
        id: &str,
        outcome: HookOutcome,
        block_reason: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE hook_records SET finished_at = ?, outcome = ?, block_reason = ?, error = ? \
             WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(outcome.to_string())
        .bind(block_reason)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("finishing hook record")?;

        Ok(())
    }

    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<HookRecord>> {
        let query = format!(
            "SELECT {} FROM hook_records WHERE run_id = ? ORDER BY started_at ASC",
            HOOK_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .context("listing hook records")?;

        rows.iter().map(row_to_record).collect()
    }
}
