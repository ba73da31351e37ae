//! Agent blueprint repository.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection, SqlitePool, sqlite::SqliteRow};

use conductor_protocol::AgentBlueprint;

/// A stored blueprint with ownership metadata.
#[derive(Debug, Clone)]
pub struct StoredBlueprint {
    pub blueprint: AgentBlueprint,
    /// Declaring runner; `None` for admin-owned (file-backed) blueprints.
    pub runner_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredBlueprint {
    pub fn is_admin_owned(&self) -> bool {
        self.runner_id.is_none()
    }
}

fn row_to_stored(row: &SqliteRow) -> Result<StoredBlueprint> {
    let definition: String = row.try_get("definition")?;
    let blueprint: AgentBlueprint =
        serde_json::from_str(&definition).context("parsing stored blueprint definition")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(StoredBlueprint {
        blueprint,
        runner_id: row.try_get("runner_id")?,
        created_at: created_at
            .parse()
            .context("parsing blueprint created_at")?,
        updated_at: updated_at
            .parse()
            .context("parsing blueprint updated_at")?,
    })
}

/// Repository for blueprint persistence.
#[derive(Debug, Clone)]
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace an admin-owned blueprint.
    pub async fn upsert_admin(&self, blueprint: &AgentBlueprint) -> Result<()> {
        let definition = serde_json::to_string(blueprint).context("serializing blueprint")?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO agents (name, runner_id, agent_type, description, definition, created_at, updated_at)
            VALUES (?, NULL, ?, ?, ?, ?, ?)
            ON CONFLICT(name) WHERE runner_id IS NULL
            DO UPDATE SET agent_type = excluded.agent_type,
                          description = excluded.description,
                          definition = excluded.definition,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(&blueprint.name)
        .bind(blueprint.agent_type.to_string())
        .bind(&blueprint.description)
        .bind(&definition)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("upserting admin blueprint")?;

        Ok(())
    }

    /// Effective blueprint for a name: admin-owned wins over runner-declared.
    pub async fn get_effective(&self, name: &str) -> Result<Option<StoredBlueprint>> {
        let row = sqlx::query(
            r#"
            SELECT name, runner_id, definition, created_at, updated_at
            FROM agents
            WHERE name = ?
            ORDER BY (runner_id IS NULL) DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching blueprint")?;

        row.as_ref().map(row_to_stored).transpose()
    }

    /// Admin-owned blueprint only.
    pub async fn get_admin(&self, name: &str) -> Result<Option<StoredBlueprint>> {
        let row = sqlx::query(
            r#"
            SELECT name, runner_id, definition, created_at, updated_at
            FROM agents
            WHERE name = ? AND runner_id IS NULL
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("fetching admin blueprint")?;

        row.as_ref().map(row_to_stored).transpose()
    }

    /// Every stored blueprint row, admin rows first within a name.
    pub async fn list(&self) -> Result<Vec<StoredBlueprint>> {
        let rows = sqlx::query(
            r#"
            SELECT name, runner_id, definition, created_at, updated_at
            FROM agents
            ORDER BY name ASC, (runner_id IS NULL) DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing blueprints")?;

        rows.iter().map(row_to_stored).collect()
    }

    /// Blueprints declared by one runner.
    pub async fn list_by_runner(&self, runner_id: &str) -> Result<Vec<StoredBlueprint>> {
        let rows = sqlx::query(
            r#"
            SELECT name, runner_id, definition, created_at, updated_at
            FROM agents
            WHERE runner_id = ?
            ORDER BY name ASC
            "#,
        )
        .bind(runner_id)
        .fetch_all(&self.pool)
        .await
        .context("listing runner blueprints")?;

        rows.iter().map(row_to_stored).collect()
    }

    /// Delete an admin-owned blueprint. Returns whether a row was removed.
    pub async fn delete_admin(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM agents WHERE name = ? AND runner_id IS NULL")
            .bind(name)
            .execute(&self.pool)
            .await
            .context("deleting admin blueprint")?;

        Ok(result.rows_affected() > 0)
    }

    /// Names among `names` that are already declared by a different runner.
    pub async fn names_declared_elsewhere(
        &self,
        names: &[String],
        runner_id: &str,
    ) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; names.len()].join(", ");
        let sql = format!(
            "SELECT DISTINCT name FROM agents \
             WHERE name IN ({}) AND runner_id IS NOT NULL AND runner_id != ?",
            placeholders
        );

        let mut query = sqlx::query(&sql);
        for name in names {
            query = query.bind(name);
        }
        query = query.bind(runner_id);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("checking agent name collisions")?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
            .collect()
    }

    /// Atomically replace a runner's declared blueprints. The collision check
    /// runs inside the same transaction so a concurrent registration cannot
    /// slip a duplicate in between check and insert.
    pub async fn replace_runner_agents(
        &self,
        runner_id: &str,
        blueprints: &[AgentBlueprint],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        self.replace_runner_agents_tx(&mut tx, runner_id, blueprints)
            .await?;
        tx.commit().await.context("committing runner blueprints")?;
        Ok(())
    }

    /// Transactional body of [`replace_runner_agents`], usable inside a
    /// larger registration transaction.
    pub async fn replace_runner_agents_tx(
        &self,
        conn: &mut SqliteConnection,
        runner_id: &str,
        blueprints: &[AgentBlueprint],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        if !blueprints.is_empty() {
            let names: Vec<&str> = blueprints.iter().map(|b| b.name.as_str()).collect();
            let placeholders = vec!["?"; names.len()].join(", ");
            let sql = format!(
                "SELECT DISTINCT name FROM agents \
                 WHERE name IN ({}) AND runner_id IS NOT NULL AND runner_id != ?",
                placeholders
            );

            let mut query = sqlx::query(&sql);
            for name in &names {
                query = query.bind(*name);
            }
            query = query.bind(runner_id);

            let collisions = query
                .fetch_all(&mut *conn)
                .await
                .context("checking collisions in transaction")?;

            if !collisions.is_empty() {
                let taken: Vec<String> = collisions
                    .iter()
                    .filter_map(|row| row.try_get::<String, _>("name").ok())
                    .collect();
                anyhow::bail!("agent names already declared by another runner: {}", taken.join(", "));
            }
        }

        sqlx::query("DELETE FROM agents WHERE runner_id = ?")
            .bind(runner_id)
            .execute(&mut *conn)
            .await
            .context("clearing runner blueprints")?;

        for blueprint in blueprints {
            let definition =
                serde_json::to_string(blueprint).context("serializing runner blueprint")?;
            sqlx::query(
                r#"
                INSERT INTO agents (name, runner_id, agent_type, description, definition, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&blueprint.name)
            .bind(runner_id)
            .bind(blueprint.agent_type.to_string())
            .bind(&blueprint.description)
            .bind(&definition)
            .bind(&now)
            .bind(&now)
            .execute(&mut *conn)
            .await
            .context("inserting runner blueprint")?;
        }

        Ok(())
    }

    /// Remove every blueprint declared by a runner (disconnect path).
    pub async fn delete_by_runner(&self, runner_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM agents WHERE runner_id = ?")
            .bind(runner_id)
            .execute(&self.pool)
            .await
            .context("purging runner blueprints")?;

        Ok(result.rows_affected())
    }

    /// Same as [`delete_by_runner`] inside an enclosing transaction.
    pub async fn delete_by_runner_tx(
        &self,
        conn: &mut SqliteConnection,
        runner_id: &str,
    ) -> Result<u64> {
        let result = sqlx::query("DELETE FROM agents WHERE runner_id = ?")
            .bind(runner_id)
            .execute(conn)
            .await
            .context("purging runner blueprints")?;

        Ok(result.rows_affected())
    }
}
