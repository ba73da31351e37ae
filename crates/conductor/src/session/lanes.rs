//! Per-session serial lanes.
//!
//! Every mutating session operation (run creation, state transitions,
//! callback delivery) runs under the session's lane lock. This is what makes
//! run numbers contiguous and terminal states race-free without a global
//! lock.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Keyed async mutexes, one per session.
#[derive(Default)]
pub struct SessionLanes {
    lanes: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the serial lane for a session. The guard is owned so it can
    /// cross await points.
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lane = self
            .lanes
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lane.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_lane_serializes_same_session() {
        let lanes = Arc::new(SessionLanes::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lanes = lanes.clone();
            let counter = counter.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _guard = lanes.lock("ses_1").await;
                let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inside, Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_sessions_do_not_block() {
        let lanes = SessionLanes::new();
        let _a = lanes.lock("ses_a").await;
        // A second session's lane is immediately available.
        let _b = lanes.lock("ses_b").await;
    }
}
