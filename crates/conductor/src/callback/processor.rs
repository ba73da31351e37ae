//! Callback delivery loop.
//!
//! Event-driven: run finalization pushes callback IDs onto the channel; the
//! processor delivers each one. A busy parent session re-queues the callback
//! after a short backoff. On startup, records left pending by a crash are
//! re-enqueued from the store.

use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::SessionService;

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Background callback delivery task.
pub struct CallbackProcessor;

impl CallbackProcessor {
    /// Spawn the processor loop. It runs until the channel closes.
    pub fn spawn(
        service: Arc<SessionService>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Crash recovery: anything still pending gets re-enqueued.
            match service.pending_callbacks().await {
                Ok(pending) => {
                    if !pending.is_empty() {
                        info!("Recovering {} pending callback(s)", pending.len());
                    }
                    let tx = service.callback_sender();
                    for record in pending {
                        let _ = tx.send(record.id);
                    }
                }
                Err(err) => error!("Failed to load pending callbacks: {:#}", err),
            }

            while let Some(callback_id) = rx.recv().await {
                if let Err(err) = service.deliver_callback(&callback_id).await {
                    warn!(
                        "Callback {} delivery deferred: {:#}; retrying",
                        callback_id, err
                    );
                    let tx = service.callback_sender();
                    tokio::spawn(async move {
                        tokio::time::sleep(RETRY_DELAY).await;
                        let _ = tx.send(callback_id);
                    });
                }
            }
        })
    }
}
