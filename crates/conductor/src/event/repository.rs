//! Event journal repository.
//!
//! Events are append-only: rows are inserted with the next per-session
//! sequence number and never updated. Sequencing happens inside the INSERT
//! itself so concurrent appends cannot race on `max(seq)`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};

use conductor_protocol::{EventEnvelope, EventPayload};

fn row_to_envelope(row: &SqliteRow) -> Result<EventEnvelope> {
    let payload: String = row.try_get("payload")?;
    let payload: EventPayload =
        serde_json::from_str(&payload).context("parsing stored event payload")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(EventEnvelope {
        sequence: row.try_get("seq")?,
        session_id: row.try_get("session_id")?,
        timestamp: timestamp
            .parse::<DateTime<Utc>>()
            .context("parsing event timestamp")?,
        payload,
    })
}

/// Repository for the append-only event journal.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append one event, assigning the next sequence number for the session.
    pub async fn append(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        payload: &EventPayload,
    ) -> Result<EventEnvelope> {
        let raw = serde_json::to_string(payload).context("serializing event payload")?;

        // The subselect and insert are one statement; SQLite's single-writer
        // model makes the sequence assignment atomic.
        let row = sqlx::query(
            r#"
            INSERT INTO events (session_id, seq, event_type, run_id, timestamp, payload)
            VALUES (
                ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?),
                ?, ?, ?, ?
            )
            RETURNING seq
            "#,
        )
        .bind(session_id)
        .bind(session_id)
        .bind(payload.event_type())
        .bind(payload.run_id())
        .bind(timestamp.to_rfc3339())
        .bind(&raw)
        .fetch_one(&self.pool)
        .await
        .context("appending event")?;

        Ok(EventEnvelope {
            sequence: row.try_get("seq")?,
            session_id: session_id.to_string(),
            timestamp,
            payload: payload.clone(),
        })
    }

    /// Replay persisted events with `seq > since`, in order.
    pub async fn list_since(&self, session_id: &str, since: i64) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT session_id, seq, timestamp, payload
            FROM events
            WHERE session_id = ? AND seq > ?
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("replaying events")?;

        rows.iter().map(row_to_envelope).collect()
    }

    /// Latest sequence number for a session (0 when empty).
    pub async fn latest_sequence(&self, session_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(seq), 0) AS seq FROM events WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("reading latest sequence")?;

        Ok(row.try_get("seq")?)
    }

    /// The `result` event for a run, if one was emitted.
    pub async fn result_for_run(
        &self,
        session_id: &str,
        run_id: &str,
    ) -> Result<Option<EventEnvelope>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, seq, timestamp, payload
            FROM events
            WHERE event_type = 'result' AND session_id = ? AND run_id = ?
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(session_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching result event")?;

        row.as_ref().map(row_to_envelope).transpose()
    }

    /// Legacy fallback: the last assistant message of a run, used only when
    /// no `result` event exists. Read-only; never a dual write target.
    pub async fn last_assistant_message(
        &self,
        session_id: &str,
        run_id: &str,
    ) -> Result<Option<String>> {
        let rows = sqlx::query(
            r#"
            SELECT payload
            FROM events
            WHERE event_type = 'message' AND session_id = ? AND run_id = ?
            ORDER BY seq DESC
            "#,
        )
        .bind(session_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .context("fetching message events")?;

        for row in rows {
            let raw: String = row.try_get("payload")?;
            let payload: EventPayload =
                serde_json::from_str(&raw).context("parsing message payload")?;
            if let EventPayload::Message {
                role: conductor_protocol::MessageRole::Assistant,
                text,
                ..
            } = payload
            {
                return Ok(Some(text));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use conductor_protocol::MessageRole;

    #[tokio::test]
    async fn test_append_assigns_contiguous_sequences() {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepository::new(db.pool().clone());

        for i in 0..3 {
            let env = repo
                .append(
                    "ses_1",
                    Utc::now(),
                    &EventPayload::Message {
                        run_id: Some("run_1".to_string()),
                        role: MessageRole::Assistant,
                        text: format!("msg {}", i),
                    },
                )
                .await
                .unwrap();
            assert_eq!(env.sequence, i + 1);
        }

        // An unrelated session starts at 1.
        let env = repo
            .append(
                "ses_2",
                Utc::now(),
                &EventPayload::RunCompleted {
                    run_id: "run_2".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(env.sequence, 1);
    }

    #[tokio::test]
    async fn test_replay_since() {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepository::new(db.pool().clone());

        for i in 0..5 {
            repo.append(
                "ses_1",
                Utc::now(),
                &EventPayload::Message {
                    run_id: None,
                    role: MessageRole::System,
                    text: format!("{}", i),
                },
            )
            .await
            .unwrap();
        }

        let replayed = repo.list_since("ses_1", 2).await.unwrap();
        let seqs: Vec<i64> = replayed.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(repo.latest_sequence("ses_1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_result_lookup_and_message_fallback() {
        let db = Database::in_memory().await.unwrap();
        let repo = EventRepository::new(db.pool().clone());

        repo.append(
            "ses_1",
            Utc::now(),
            &EventPayload::Message {
                run_id: Some("run_1".to_string()),
                role: MessageRole::Assistant,
                text: "final answer".to_string(),
            },
        )
        .await
        .unwrap();

        // No result event yet: fallback kicks in.
        assert!(repo.result_for_run("ses_1", "run_1").await.unwrap().is_none());
        assert_eq!(
            repo.last_assistant_message("ses_1", "run_1").await.unwrap(),
            Some("final answer".to_string())
        );

        repo.append(
            "ses_1",
            Utc::now(),
            &EventPayload::Result {
                run_id: "run_1".to_string(),
                result_text: Some("authoritative".to_string()),
                result_data: None,
            },
        )
        .await
        .unwrap();

        let result = repo.result_for_run("ses_1", "run_1").await.unwrap().unwrap();
        match result.payload {
            EventPayload::Result { result_text, .. } => {
                assert_eq!(result_text.as_deref(), Some("authoritative"));
            }
            _ => panic!("expected result payload"),
        }
    }
}
