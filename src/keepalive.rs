//! Per-connection liveness timer (spec §4.7).
//!
//! Grounded on the teacher's `connection_cleaner()` background sweep in
//! `stratum/server_v2.rs`, generalized from one shared fixed-timeout
//! sweep into a `Start`/`RecordActivity`/`MaxMissed` model keyed per
//! connection, backed by a single shared sweep task (cheaper than one
//! timer per connection, same observable behavior).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_activity: Instant,
    missed: u32,
}

/// Disconnects connections that miss `max_missed` consecutive keepalive
/// intervals. `RecordActivity` is idempotent: calling it repeatedly
/// within one interval never causes a disconnect (spec invariant 6).
pub struct KeepaliveManager {
    interval: Duration,
    max_missed: u32,
    entries: Arc<RwLock<HashMap<String, Liveness>>>,
}

impl KeepaliveManager {
    pub fn new(interval: Duration, max_missed: u32) -> Self {
        Self {
            interval,
            max_missed,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn start(&self, connection_id: &str) {
        let mut entries = self.entries.write().await;
        entries.insert(
            connection_id.to_string(),
            Liveness {
                last_activity: Instant::now(),
                missed: 0,
            },
        );
    }

    pub async fn record_activity(&self, connection_id: &str) {
        let mut entries = self.entries.write().await;
        if let Some(liveness) = entries.get_mut(connection_id) {
            liveness.last_activity = Instant::now();
            liveness.missed = 0;
        }
    }

    pub async fn stop(&self, connection_id: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(connection_id);
    }

    /// Run one sweep, returning the IDs that exceeded `max_missed` and
    /// were evicted. Callers invoke the disconnect callback for each.
    pub async fn sweep(&self) -> Vec<String> {
        let now = Instant::now();
        let mut to_disconnect = Vec::new();
        let mut entries = self.entries.write().await;
        for (id, liveness) in entries.iter_mut() {
            if now.saturating_duration_since(liveness.last_activity) >= self.interval {
                liveness.missed += 1;
                liveness.last_activity = now;
                if liveness.missed >= self.max_missed {
                    to_disconnect.push(id.clone());
                }
            }
        }
        for id in &to_disconnect {
            entries.remove(id);
        }
        to_disconnect
    }

    /// Spawn the periodic sweep loop, invoking `on_disconnect` for each
    /// connection that timed out. Returns a handle the caller can abort
    /// on shutdown.
    pub fn spawn_sweeper<F>(self: Arc<Self>, on_disconnect: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let interval = self.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let timed_out = self.sweep().await;
                for id in timed_out {
                    crate::metrics::inc_keepalive_disconnects();
                    on_disconnect(id);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_activity_is_idempotent_within_one_period() {
        let mgr = KeepaliveManager::new(Duration::from_millis(50), 2);
        mgr.start("c1").await;
        for _ in 0..10 {
            mgr.record_activity("c1").await;
        }
        // No sweep ran yet; nothing should be marked for disconnect.
        let entries = mgr.entries.read().await;
        assert_eq!(entries.get("c1").unwrap().missed, 0);
    }

    #[tokio::test]
    async fn disconnects_after_max_missed_intervals() {
        let mgr = KeepaliveManager::new(Duration::from_millis(1), 2);
        mgr.start("c1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let first = mgr.sweep().await;
        assert!(first.is_empty(), "first miss should not disconnect yet");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = mgr.sweep().await;
        assert_eq!(second, vec!["c1".to_string()]);
    }
}
