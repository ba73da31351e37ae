//! Database module for coordinator persistence.
//!
//! One SQLite file under the data directory holds every table: agents,
//! runners, sessions, runs, events, callbacks, hook records. Repositories
//! own all SQL; nothing else in the crate executes ad-hoc queries.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Coordinator schema. Executed on open; every statement is idempotent.
const SCHEMA: &str = r#"
-- Agent blueprints. runner_id NULL means admin-owned (file-backed). An
-- admin-owned and a runner-declared row may share a name; admin wins at
-- lookup. Cross-runner name uniqueness is enforced in the registration
-- transaction.
CREATE TABLE IF NOT EXISTS agents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    runner_id TEXT,
    agent_type TEXT NOT NULL CHECK(agent_type IN ('autonomous', 'procedural')),
    description TEXT NOT NULL DEFAULT '',
    definition TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(name, runner_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_admin_name ON agents(name) WHERE runner_id IS NULL;
CREATE INDEX IF NOT EXISTS idx_agents_runner ON agents(runner_id);

-- Runner registrations.
CREATE TABLE IF NOT EXISTS runners (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    project_dir TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    executor_profile TEXT,
    executor TEXT,
    require_matching_tags INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL CHECK(status IN ('active', 'stale', 'removed')),
    registered_at TEXT NOT NULL,
    last_heartbeat_at TEXT NOT NULL
);

-- Conversational containers for runs.
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT,
    agent_name TEXT NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('pending', 'running', 'finished', 'failed', 'stopped')),
    parent_session_id TEXT,
    execution_mode TEXT NOT NULL DEFAULT 'detached',
    project_dir TEXT,
    hostname TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

-- Work units. run_number is contiguous and 1-based within a session.
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    run_number INTEGER NOT NULL,
    run_type TEXT NOT NULL CHECK(run_type IN ('start_session', 'resume_session')),
    parameters TEXT NOT NULL,
    scope TEXT,
    context TEXT,
    status TEXT NOT NULL CHECK(status IN ('pending', 'claimed', 'running', 'stopping', 'completed', 'failed', 'stopped')),
    dispatchable INTEGER NOT NULL DEFAULT 1,
    dispatch_deadline TEXT,
    runner_id TEXT,
    resolved_blueprint TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    claimed_at TEXT,
    started_at TEXT,
    stop_requested_at TEXT,
    completed_at TEXT,
    UNIQUE(session_id, run_number)
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_session ON runs(session_id);
CREATE INDEX IF NOT EXISTS idx_runs_runner ON runs(runner_id, status);

-- Append-only event journal.
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    event_type TEXT NOT NULL,
    run_id TEXT,
    timestamp TEXT NOT NULL,
    payload TEXT NOT NULL,
    UNIQUE(session_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_events_session_seq ON events(session_id, seq);
CREATE INDEX IF NOT EXISTS idx_events_type_session ON events(event_type, session_id);

-- Parent-resume bookkeeping. One record per terminal child run.
CREATE TABLE IF NOT EXISTS callbacks (
    id TEXT PRIMARY KEY,
    parent_session_id TEXT NOT NULL,
    child_session_id TEXT NOT NULL,
    child_run_id TEXT NOT NULL UNIQUE,
    child_status TEXT NOT NULL,
    child_result TEXT,
    status TEXT NOT NULL CHECK(status IN ('pending', 'delivered')),
    created_at TEXT NOT NULL,
    delivered_at TEXT,
    resume_run_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_callbacks_status ON callbacks(status);

-- One record per hook invocation.
CREATE TABLE IF NOT EXISTS hook_records (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    hook_type TEXT NOT NULL CHECK(hook_type IN ('on_run_start', 'on_run_finish')),
    target_agent TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    outcome TEXT CHECK(outcome IN ('continue', 'block', 'failed')),
    block_reason TEXT,
    error TEXT
);

CREATE INDEX IF NOT EXISTS idx_hook_records_run ON hook_records(run_id);
"#;

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the coordinator database at the given path.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        let db = Self { pool };
        db.apply_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.apply_schema().await?;

        Ok(db)
    }

    async fn apply_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("applying database schema")?;
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
