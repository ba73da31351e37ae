//! Write-through event log: durable append, then broadcast.
//!
//! Persistence strictly precedes broadcast. A crash between the two loses
//! only the push, never the event; live consumers resync from the journal.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use conductor_protocol::{EventEnvelope, EventPayload};

use super::hub::EventHub;
use super::repository::EventRepository;

/// Append-only event log with live fan-out.
#[derive(Clone)]
pub struct EventLog {
    repo: EventRepository,
    hub: Arc<EventHub>,
}

impl EventLog {
    pub fn new(repo: EventRepository, hub: Arc<EventHub>) -> Self {
        Self { repo, hub }
    }

    /// Append an event with a coordinator timestamp.
    pub async fn append(&self, session_id: &str, payload: EventPayload) -> Result<EventEnvelope> {
        self.append_at(session_id, Utc::now(), payload).await
    }

    /// Append an event with an explicit timestamp (runner-supplied).
    pub async fn append_at(
        &self,
        session_id: &str,
        timestamp: DateTime<Utc>,
        payload: EventPayload,
    ) -> Result<EventEnvelope> {
        anyhow::ensure!(
            payload.is_persistable(),
            "event type '{}' is push-only and cannot be appended",
            payload.event_type()
        );

        let envelope = self.repo.append(session_id, timestamp, &payload).await?;
        self.hub.publish(&envelope);
        Ok(envelope)
    }

    pub fn subscribe(&self, session_id: Option<String>) -> mpsc::Receiver<EventEnvelope> {
        self.hub.subscribe(session_id)
    }

    pub fn repo(&self) -> &EventRepository {
        &self.repo
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }
}
