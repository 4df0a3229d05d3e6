//! Fast KV cache (spec §6): pool-wide and per-miner counters backed by
//! Redis. Trimmed from the teacher's `shares/storage.rs` `RedisStorage`
//! down to the counter/stat keys this spec actually names — the
//! PPLNS/payout-ledger keys it also carried are out of scope here.

use anyhow::{anyhow, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

const KEY_POOL_SHARES_VALID: &str = "pool:shares:valid";
const KEY_POOL_SHARES_INVALID: &str = "pool:shares:invalid";

fn miner_key(miner_id: &str) -> String {
    format!("miner:{miner_id}")
}

fn user_shares_key(user_id: i64) -> String {
    format!("user:{user_id}:shares")
}

/// Thin async wrapper over a Redis `ConnectionManager`, which already
/// reconnects and retries internally — we add metrics and the specific
/// key shapes this pool uses.
pub struct Cache {
    conn: ConnectionManager,
}

impl Cache {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| anyhow!("invalid redis url: {}", e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| anyhow!("redis connect failed: {}", e))?;
        Ok(Self { conn })
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let res: Result<String, redis::RedisError> = redis::cmd("PING").query_async(&mut conn).await;
        res.is_ok()
    }

    pub async fn incr_pool_shares(&self, accepted: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = if accepted { KEY_POOL_SHARES_VALID } else { KEY_POOL_SHARES_INVALID };
        conn.incr::<_, _, ()>(key, 1).await.map_err(|e| {
            crate::metrics::inc_cache_errors();
            anyhow!("cache incr failed: {}", e)
        })
    }

    pub async fn set_miner_hashrate(&self, miner_id: &str, hashrate: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(miner_key(miner_id), "hashrate", hashrate)
            .await
            .map_err(|e| {
                crate::metrics::inc_cache_errors();
                anyhow!("cache hset failed: {}", e)
            })
    }

    pub async fn incr_miner_shares(&self, miner_id: &str, accepted: bool) -> Result<()> {
        let mut conn = self.conn.clone();
        let field = if accepted { "accepted" } else { "rejected" };
        conn.hincr::<_, _, _, ()>(miner_key(miner_id), field, 1)
            .await
            .map_err(|e| {
                crate::metrics::inc_cache_errors();
                anyhow!("cache hincr failed: {}", e)
            })
    }

    pub async fn incr_user_shares(&self, user_id: i64, difficulty: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.incr::<_, _, ()>(user_shares_key(user_id), difficulty as i64)
            .await
            .map_err(|e| {
                crate::metrics::inc_cache_errors();
                anyhow!("cache incr failed: {}", e)
            })
    }

    pub async fn get_miner_stats(&self, miner_id: &str) -> Result<std::collections::HashMap<String, String>> {
        let mut conn = self.conn.clone();
        conn.hgetall(miner_key(miner_id)).await.map_err(|e| {
            crate::metrics::inc_cache_errors();
            anyhow!("cache hgetall failed: {}", e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes_match_spec_naming() {
        assert_eq!(miner_key("abc123"), "miner:abc123");
        assert_eq!(user_shares_key(42), "user:42:shares");
        assert_eq!(KEY_POOL_SHARES_VALID, "pool:shares:valid");
    }
}
