//! Runner registration repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use conductor_protocol::RunnerStatus;

use super::models::Runner;

const RUNNER_COLUMNS: &str = r#"
    id, hostname, project_dir, tags, executor_profile, executor,
    require_matching_tags, status, registered_at, last_heartbeat_at
"#;

fn row_to_runner(row: &SqliteRow) -> Result<Runner> {
    let tags: String = row.try_get("tags")?;
    let executor: Option<String> = row.try_get("executor")?;
    let status: String = row.try_get("status")?;
    let registered_at: String = row.try_get("registered_at")?;
    let last_heartbeat_at: String = row.try_get("last_heartbeat_at")?;

    Ok(Runner {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        project_dir: row.try_get("project_dir")?,
        tags: serde_json::from_str(&tags).context("parsing runner tags")?,
        executor_profile: row.try_get("executor_profile")?,
        executor: executor
            .map(|raw| serde_json::from_str(&raw).context("parsing executor descriptor"))
            .transpose()?,
        require_matching_tags: row.try_get::<i64, _>("require_matching_tags")? != 0,
        status: status.parse::<RunnerStatus>().map_err(anyhow::Error::msg)?,
        registered_at: registered_at.parse().context("parsing registered_at")?,
        last_heartbeat_at: last_heartbeat_at
            .parse()
            .context("parsing last_heartbeat_at")?,
    })
}

/// Repository for runner rows.
#[derive(Debug, Clone)]
pub struct RunnerRepository {
    pool: SqlitePool,
}

impl RunnerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a runner row inside an enclosing transaction.
    pub async fn upsert_tx(&self, conn: &mut SqliteConnection, runner: &Runner) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runners (
                id, hostname, project_dir, tags, executor_profile, executor,
                require_matching_tags, status, registered_at, last_heartbeat_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                hostname = excluded.hostname,
                project_dir = excluded.project_dir,
                tags = excluded.tags,
                executor_profile = excluded.executor_profile,
                executor = excluded.executor,
                require_matching_tags = excluded.require_matching_tags,
                status = excluded.status,
                last_heartbeat_at = excluded.last_heartbeat_at
            "#,
        )
        .bind(&runner.id)
        .bind(&runner.hostname)
        .bind(&runner.project_dir)
        .bind(serde_json::to_string(&runner.tags)?)
        .bind(&runner.executor_profile)
        .bind(runner.executor.as_ref().map(|e| e.to_string()))
        .bind(runner.require_matching_tags as i64)
        .bind(runner.status.to_string())
        .bind(runner.registered_at.to_rfc3339())
        .bind(runner.last_heartbeat_at.to_rfc3339())
        .execute(conn)
        .await
        .context("upserting runner")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Runner>> {
        let query = format!("SELECT {} FROM runners WHERE id = ?", RUNNER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching runner")?;

        row.as_ref().map(row_to_runner).transpose()
    }

    /// Every runner that has not been removed.
    pub async fn list_live(&self) -> Result<Vec<Runner>> {
        let query = format!(
            "SELECT {} FROM runners WHERE status != 'removed' ORDER BY registered_at ASC",
            RUNNER_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing runners")?;

        rows.iter().map(row_to_runner).collect()
    }

    pub async fn touch_heartbeat(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE runners SET last_heartbeat_at = ?, status = 'active' \
             WHERE id = ? AND status != 'removed'",
        )
        .bind(at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("recording heartbeat")?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_status(&self, id: &str, status: RunnerStatus) -> Result<()> {
        sqlx::query("UPDATE runners SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating runner status")?;

        Ok(())
    }

    /// Mark a runner removed inside an enclosing transaction.
    pub async fn mark_removed_tx(&self, conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("UPDATE runners SET status = 'removed' WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await
            .context("marking runner removed")?;

        Ok(())
    }
}
