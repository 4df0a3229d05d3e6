//! Share pipeline (spec §4.5): validate → attribute → persist → update
//! counters.
//!
//! Grounded on `shares/processor.rs::process_share()`'s validate→store→
//! metrics shape and `shares/validator.rs::validate_share()`'s structure,
//! with PPLNS/payout distribution and hardcoded multi-algorithm PoW
//! hashing removed per Non-goals, replaced by the `AlgorithmContract`
//! collaborator.

use std::sync::Arc;
use std::time::Instant;

use crate::error::ApplicationError;
use crate::hashrate::HashrateWindow;
use crate::jobs::MiningJob;
use crate::shares::algorithm::AlgorithmContract;
use crate::store::{Cache, PersistentStore};
use crate::vardiff::VarDiffState;

/// Every Nth accepted share triggers a hashrate write-back to the miner
/// record (spec §4.5 step 7).
const HASHRATE_WRITEBACK_EVERY: usize = 10;

pub struct ShareContext<'a> {
    pub job: &'a MiningJob,
    pub extranonce1: [u8; 4],
    pub extranonce2: [u8; 4],
    pub ntime: u32,
    pub nonce: u32,
    pub version_bits: Option<u32>,
    /// Difficulty in force on the connection at acceptance time — recorded
    /// as-is regardless of any vardiff adjustment this same call produces
    /// (invariant I5).
    pub difficulty: u64,
    pub worker_name: String,
    pub user_id: i64,
    pub wallet: Option<String>,
    /// `conn.shares_valid` as observed before this submit, so the hashrate
    /// write-back cadence can key off a monotonic accepted-share count
    /// rather than the rolling hashrate window's current size.
    pub shares_valid_before: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ShareOutcome {
    pub accepted: bool,
    pub block_candidate: bool,
    /// `Some` if the vardiff controller retargeted as a result of this
    /// share; the caller should push `mining.set_difficulty`/`SetTarget`.
    pub new_difficulty: Option<u64>,
}

pub struct SharePipeline {
    store: Arc<PersistentStore>,
    cache: Arc<Cache>,
    algorithm: Arc<dyn AlgorithmContract>,
}

impl SharePipeline {
    pub fn new(store: Arc<PersistentStore>, cache: Arc<Cache>, algorithm: Arc<dyn AlgorithmContract>) -> Self {
        Self { store, cache, algorithm }
    }

    /// Process one submit. Returns `Err` only for conditions the caller
    /// must reply to the client as an application-level error (spec §4.5
    /// step 1) — everything downstream of that is recovered internally
    /// per the failure-semantics table, never surfaced as a transport
    /// error to the miner.
    pub async fn submit(
        &self,
        ctx: ShareContext<'_>,
        vardiff: &mut VarDiffState,
        hashrate: &mut HashrateWindow,
        now: Instant,
    ) -> Result<ShareOutcome, ApplicationError> {
        if ctx.user_id == 0 {
            return Err(ApplicationError::Unauthorized);
        }

        let eval = self.algorithm.evaluate(
            ctx.job,
            &ctx.extranonce1,
            &ctx.extranonce2,
            ctx.ntime,
            ctx.nonce,
            ctx.version_bits,
        );

        // The detailed PoW check is delegated to the algorithm contract;
        // counting treats the share as accepted once it clears that gate.
        let new_difficulty = vardiff.on_share(now, eval.accepted, ctx.difficulty);

        if eval.accepted {
            crate::metrics::inc_accepted();
        } else {
            crate::metrics::inc_rejected();
        }

        // `resolve_or_orphan` already falls back to the orphan miner row
        // internally; this `unwrap_or` only guards the (exceptional)
        // case where even that orphan lookup fails.
        let miner_id = self
            .store
            .resolve_or_orphan(&ctx.worker_name, ctx.wallet.as_deref())
            .await
            .unwrap_or(0);

        let hash_hex = hex::encode(eval.hash);
        if let Err(e) = self
            .store
            .record_share(
                miner_id,
                ctx.user_id,
                &ctx.job.job_id,
                ctx.difficulty as i64,
                eval.accepted,
                ctx.nonce as i64,
                &hash_hex,
            )
            .await
        {
            tracing::warn!("share persistence failed, continuing: {}", e);
        }

        if eval.accepted {
            hashrate.record(ctx.difficulty, now);
        }

        if let Err(e) = self.cache.incr_pool_shares(eval.accepted).await {
            tracing::warn!("cache update failed: {}", e);
        }
        let _ = self.cache.incr_miner_shares(&ctx.worker_name, eval.accepted).await;
        let _ = self.cache.incr_user_shares(ctx.user_id, ctx.difficulty).await;

        if eval.accepted && (ctx.shares_valid_before + 1) % HASHRATE_WRITEBACK_EVERY as u64 == 0 {
            let hr = hashrate.hashrate(now) as u64;
            let _ = self.cache.set_miner_hashrate(&ctx.worker_name, hr).await;
        }

        if eval.block_candidate {
            if let Err(e) = self.store.record_block_found(miner_id, ctx.job.height as i64, &hash_hex).await {
                tracing::error!("failed to record found block: {}", e);
            }
        }

        Ok(ShareOutcome {
            accepted: eval.accepted,
            block_candidate: eval.block_candidate,
            new_difficulty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashrate_writeback_cadence_matches_spec() {
        assert_eq!(HASHRATE_WRITEBACK_EVERY, 10);
    }
}
