//! Template poller (spec §4.4): periodic `getblocktemplate` fetch with
//! classified retry/backoff.
//!
//! Grounded on `blockchain/template_manager.rs`'s `BlockTemplateManager::start()`
//! interval loop, generalized from a bare `tokio::time::interval` into the
//! explicit classified-retry wrapper this spec requires.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::InfraError;
use crate::store::CoinRpcClient;

const BACKOFF_STEPS_MS: &[u64] = &[500, 1_000, 2_000, 4_000];
const BACKOFF_CAP_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTemplate {
    pub height: u64,
    pub previous_block_hash: String,
    pub coinbase_value: u64,
    pub target: String,
    pub bits: String,
    pub version: i32,
    pub curtime: u32,
    /// Non-coinbase transaction IDs, in the natural (big-endian display)
    /// order the RPC returns them.
    pub transactions: Vec<String>,
}

/// Polls the coin node on a fixed tick, retrying transient failures with
/// exponential backoff and publishing the latest successfully-fetched
/// template for callers (the job builder) to pick up.
pub struct TemplatePoller {
    rpc: Arc<CoinRpcClient>,
    interval: Duration,
    latest: Arc<RwLock<Option<BlockTemplate>>>,
}

impl TemplatePoller {
    pub fn new(rpc: Arc<CoinRpcClient>, interval: Duration) -> Self {
        Self {
            rpc,
            interval,
            latest: Arc::new(RwLock::new(None)),
        }
    }

    pub fn latest_handle(&self) -> Arc<RwLock<Option<BlockTemplate>>> {
        self.latest.clone()
    }

    /// Fetch once, retrying transient errors with the configured backoff
    /// schedule. Returns `Err` only for a non-transient ("hard") failure,
    /// or after the backoff schedule is exhausted.
    pub async fn fetch_once(&self) -> anyhow::Result<BlockTemplate> {
        let mut attempt = 0usize;
        loop {
            crate::metrics::inc_template_updates();
            match self.rpc.get_block_template().await {
                Ok(value) => {
                    let tmpl: BlockTemplate = serde_json::from_value(value)
                        .map_err(|e| anyhow::anyhow!("malformed block template: {}", e))?;
                    return Ok(tmpl);
                }
                Err(e) => {
                    crate::metrics::inc_template_fetch_errors();
                    let message = e.to_string();
                    if !InfraError::is_transient(&message) || attempt >= BACKOFF_STEPS_MS.len() {
                        tracing::warn!("template fetch hard-failed: {}", message);
                        return Err(e);
                    }
                    let delay_ms = BACKOFF_STEPS_MS.get(attempt).copied().unwrap_or(BACKOFF_CAP_MS).min(BACKOFF_CAP_MS);
                    tracing::warn!("template fetch transient error, retrying in {}ms: {}", delay_ms, message);
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Run the poll loop forever: fetch once immediately, then on every
    /// tick. `on_template` is invoked with each successfully fetched
    /// template; the caller decides whether the height changed and a
    /// broadcast is needed.
    pub async fn run<F>(self: Arc<Self>, mut on_template: F)
    where
        F: FnMut(BlockTemplate) + Send,
    {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            match self.fetch_once().await {
                Ok(tmpl) => {
                    *self.latest.write().await = Some(tmpl.clone());
                    on_template(tmpl);
                }
                Err(e) => {
                    tracing::error!("template poll failed, keeping last known job: {}", e);
                }
            }
            ticker.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_capped() {
        let capped: Vec<u64> = BACKOFF_STEPS_MS.iter().map(|ms| (*ms).min(BACKOFF_CAP_MS)).collect();
        assert_eq!(capped, vec![500, 1_000, 2_000, 4_000]);
        assert!(BACKOFF_CAP_MS >= *BACKOFF_STEPS_MS.last().unwrap());
    }

    #[test]
    fn transient_classification_matches_spec_keywords() {
        assert!(InfraError::is_transient("connection refused"));
        assert!(InfraError::is_transient("dial tcp: i/o timeout"));
        assert!(!InfraError::is_transient("invalid params"));
    }
}
