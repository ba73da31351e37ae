//! Callback record persistence.
//!
//! The UNIQUE constraint on `child_run_id` plus the guarded pending ->
//! delivered update give at-most-once delivery per terminal child run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use crate::run::RunStatus;

use super::models::{CallbackRecord, CallbackStatus, ChildResult};

const CALLBACK_COLUMNS: &str = r#"
    id, parent_session_id, child_session_id, child_run_id, child_status,
    child_result, status, created_at, delivered_at, resume_run_id
"#;

fn row_to_record(row: &SqliteRow) -> Result<CallbackRecord> {
    let child_status: String = row.try_get("child_status")?;
    let child_result: Option<String> = row.try_get("child_result")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let delivered_at: Option<String> = row.try_get("delivered_at")?;

    Ok(CallbackRecord {
        id: row.try_get("id")?,
        parent_session_id: row.try_get("parent_session_id")?,
        child_session_id: row.try_get("child_session_id")?,
        child_run_id: row.try_get("child_run_id")?,
        child_status: child_status
            .parse::<RunStatus>()
            .map_err(anyhow::Error::msg)?,
        child_result: child_result
            .map(|raw| serde_json::from_str::<ChildResult>(&raw))
            .transpose()
            .context("parsing callback child result")?
            .unwrap_or_default(),
        status: status
            .parse::<CallbackStatus>()
            .map_err(anyhow::Error::msg)?,
        created_at: created_at.parse().context("parsing callback created_at")?,
        delivered_at: delivered_at
            .map(|raw| raw.parse::<DateTime<Utc>>())
            .transpose()
            .context("parsing callback delivered_at")?,
        resume_run_id: row.try_get("resume_run_id")?,
    })
}

/// Repository for callback records.
#[derive(Debug, Clone)]
pub struct CallbackRepository {
    pool: SqlitePool,
}

impl CallbackRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a pending record. Returns false when a record for this child
    /// run already exists (duplicate terminal report).
    pub async fn insert(&self, record: &CallbackRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO callbacks (
                id, parent_session_id, child_session_id, child_run_id, child_status,
                child_result, status, created_at, delivered_at, resume_run_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.parent_session_id)
        .bind(&record.child_session_id)
        .bind(&record.child_run_id)
        .bind(record.child_status.to_string())
        .bind(serde_json::to_string(&record.child_result)?)
        .bind(record.status.to_string())
        .bind(record.created_at.to_rfc3339())
        .bind(record.delivered_at.map(|t| t.to_rfc3339()))
        .bind(&record.resume_run_id)
        .execute(&self.pool)
        .await
        .context("inserting callback record")?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: &str) -> Result<Option<CallbackRecord>> {
        let query = format!("SELECT {} FROM callbacks WHERE id = ?", CALLBACK_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching callback record")?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Claim a pending record for delivery. Returns false if it was already
    /// claimed; that is what makes delivery at-most-once.
    pub async fn claim_for_delivery(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE callbacks SET status = 'delivered', delivered_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("claiming callback for delivery")?;

        Ok(result.rows_affected() == 1)
    }

    /// Re-open a claimed record after a failed delivery attempt so it can be
    /// retried.
    pub async fn reopen(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE callbacks SET status = 'pending', delivered_at = NULL WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("reopening callback record")?;

        Ok(())
    }

    /// Record which resume run a delivery produced.
    pub async fn set_resume_run(&self, id: &str, resume_run_id: &str) -> Result<()> {
        sqlx::query("UPDATE callbacks SET resume_run_id = ? WHERE id = ?")
            .bind(resume_run_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("recording callback resume run")?;

        Ok(())
    }

    /// Pending records, oldest first (startup recovery).
    pub async fn list_pending(&self) -> Result<Vec<CallbackRecord>> {
        let query = format!(
            "SELECT {} FROM callbacks WHERE status = 'pending' ORDER BY created_at ASC",
            CALLBACK_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing pending callbacks")?;

        rows.iter().map(row_to_record).collect()
    }

    /// Records addressed to a parent session.
    pub async fn list_for_parent(&self, parent_session_id: &str) -> Result<Vec<CallbackRecord>> {
        let query = format!(
            "SELECT {} FROM callbacks WHERE parent_session_id = ? ORDER BY created_at ASC",
            CALLBACK_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(parent_session_id)
            .fetch_all(&self.pool)
            .await
            .context("listing parent callbacks")?;

        rows.iter().map(row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::ids;

    fn record(child_run_id: &str) -> CallbackRecord {
        CallbackRecord {
            id: ids::callback_id(),
            parent_session_id: "ses_parent".to_string(),
            child_session_id: "ses_child".to_string(),
            child_run_id: child_run_id.to_string(),
            child_status: RunStatus::Completed,
            child_result: ChildResult {
                result_text: Some("done".to_string()),
                result_data: None,
                error: None,
            },
            status: CallbackStatus::Pending,
            created_at: Utc::now(),
            delivered_at: None,
            resume_run_id: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_child_run_is_ignored() {
        let db = Database::in_memory().await.unwrap();
        let repo = CallbackRepository::new(db.pool().clone());

        assert!(repo.insert(&record("run_child")).await.unwrap());
        assert!(!repo.insert(&record("run_child")).await.unwrap());
        assert_eq!(repo.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claim_is_at_most_once() {
        let db = Database::in_memory().await.unwrap();
        let repo = CallbackRepository::new(db.pool().clone());

        let rec = record("run_child");
        repo.insert(&rec).await.unwrap();

        assert!(repo.claim_for_delivery(&rec.id).await.unwrap());
        assert!(!repo.claim_for_delivery(&rec.id).await.unwrap());

        let loaded = repo.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, CallbackStatus::Delivered);
        assert!(loaded.delivered_at.is_some());
    }

    #[tokio::test]
    async fn test_reopen_allows_retry() {
        let db = Database::in_memory().await.unwrap();
        let repo = CallbackRepository::new(db.pool().clone());

        let rec = record("run_child");
        repo.insert(&rec).await.unwrap();
        repo.claim_for_delivery(&rec.id).await.unwrap();
        repo.reopen(&rec.id).await.unwrap();

        assert!(repo.claim_for_delivery(&rec.id).await.unwrap());
    }
}
