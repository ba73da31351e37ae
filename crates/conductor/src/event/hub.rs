//! Event fan-out hub.
//!
//! One producer per session (the event log writer) pushes into bounded
//! per-subscriber queues. Subscriber work never blocks the writer: a full
//! queue gets a final `gap` marker and the subscriber is dropped, resyncing
//! later from the durable journal.

use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use conductor_protocol::{EventEnvelope, EventPayload};

/// Per-subscriber queue size. The final slot is reserved for the gap marker.
const SUBSCRIBER_BUFFER_SIZE: usize = 256;

struct Subscriber {
    /// `None` subscribes to every session.
    session_id: Option<String>,
    tx: mpsc::Sender<EventEnvelope>,
}

/// Fan-out hub with bounded per-subscriber queues.
pub struct EventHub {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to one session's events (or all sessions with `None`).
    /// Dropping the receiver unsubscribes on the next publish.
    pub fn subscribe(&self, session_id: Option<String>) -> mpsc::Receiver<EventEnvelope> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Subscriber { session_id, tx });
        debug!("Registered event subscriber {}", id);
        rx
    }

    /// Push an event to every matching subscriber. Never blocks: subscribers
    /// that cannot keep up receive a gap marker as their final message and
    /// are dropped.
    pub fn publish(&self, envelope: &EventEnvelope) {
        let mut dropped = Vec::new();

        for entry in self.subscribers.iter() {
            let subscriber = entry.value();
            if let Some(session_id) = &subscriber.session_id
                && session_id != &envelope.session_id
            {
                continue;
            }

            match subscriber.tx.try_reserve() {
                Ok(permit) => {
                    if subscriber.tx.capacity() == 0 {
                        // This permit is the last free slot: spend it on the
                        // gap marker so the consumer knows to replay.
                        permit.send(gap_marker(envelope));
                        warn!(
                            "Event subscriber {} overflowed at seq {} for session {}; dropping",
                            entry.key(),
                            envelope.sequence,
                            envelope.session_id
                        );
                        dropped.push(*entry.key());
                    } else {
                        permit.send(envelope.clone());
                    }
                }
                Err(mpsc::error::TrySendError::Closed(())) => {
                    dropped.push(*entry.key());
                }
                Err(mpsc::error::TrySendError::Full(())) => {
                    // Saturated past the reserved slot; nothing left to say.
                    dropped.push(*entry.key());
                }
            }
        }

        for id in dropped {
            self.subscribers.remove(&id);
        }
    }

    /// Number of live subscribers (for diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

fn gap_marker(latest: &EventEnvelope) -> EventEnvelope {
    EventEnvelope {
        sequence: latest.sequence,
        session_id: latest.session_id.clone(),
        timestamp: latest.timestamp,
        payload: EventPayload::Gap {
            last_sequence: latest.sequence,
        },
    }
}
