//! Session database repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use super::models::{ExecutionMode, Session, SessionStatus};

const SESSION_COLUMNS: &str = r#"
    id, name, agent_name, status, parent_session_id, execution_mode,
    project_dir, hostname, created_at
"#;

fn row_to_session(row: &SqliteRow) -> Result<Session> {
    let status: String = row.try_get("status")?;
    let execution_mode: String = row.try_get("execution_mode")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Session {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        agent_name: row.try_get("agent_name")?,
        status: status
            .parse::<SessionStatus>()
            .map_err(anyhow::Error::msg)?,
        parent_session_id: row.try_get("parent_session_id")?,
        execution_mode: execution_mode
            .parse::<ExecutionMode>()
            .map_err(anyhow::Error::msg)?,
        project_dir: row.try_get("project_dir")?,
        hostname: row.try_get("hostname")?,
        created_at: created_at
            .parse::<DateTime<Utc>>()
            .context("parsing session created_at")?,
    })
}

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, name, agent_name, status, parent_session_id, execution_mode,
                project_dir, hostname, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(&session.agent_name)
        .bind(session.status.to_string())
        .bind(&session.parent_session_id)
        .bind(session.execution_mode.to_string())
        .bind(&session.project_dir)
        .bind(&session.hostname)
        .bind(session.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Session>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        row.as_ref().map(row_to_session).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Session>> {
        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        rows.iter().map(row_to_session).collect()
    }

    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating session status")?;

        Ok(())
    }

    /// Record where the session landed once a runner claimed its run.
    pub async fn set_location(
        &self,
        id: &str,
        hostname: Option<&str>,
        project_dir: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE sessions SET hostname = COALESCE(?, hostname), \
             project_dir = COALESCE(?, project_dir) WHERE id = ?",
        )
        .bind(hostname)
        .bind(project_dir)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating session location")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> Session {
        Session {
            id: id.to_string(),
            name: None,
            agent_name: "researcher".to_string(),
            status: SessionStatus::Pending,
            parent_session_id: None,
            execution_mode: ExecutionMode::Detached,
            project_dir: None,
            hostname: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = crate::db::Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&session("ses_1")).await.unwrap();
        let loaded = repo.get("ses_1").await.unwrap().unwrap();
        assert_eq!(loaded.agent_name, "researcher");
        assert_eq!(loaded.status, SessionStatus::Pending);
        assert_eq!(loaded.execution_mode, ExecutionMode::Detached);

        assert!(repo.get("ses_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_and_location_updates() {
        let db = crate::db::Database::in_memory().await.unwrap();
        let repo = SessionRepository::new(db.pool().clone());

        repo.create(&session("ses_1")).await.unwrap();
        repo.set_status("ses_1", SessionStatus::Running).await.unwrap();
        repo.set_location("ses_1", Some("host-a"), None).await.unwrap();

        let loaded = repo.get("ses_1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Running);
        assert_eq!(loaded.hostname.as_deref(), Some("host-a"));
        assert!(loaded.project_dir.is_none());
    }
}
