//! Resilient relational store client (spec §6): user attribution and
//! durable share/block records over PostgreSQL.
//!
//! Grounded on `payout/scheduler.rs`'s `tokio_postgres::connect` +
//! `tokio::spawn(connection)` driving pattern, and on
//! `blockchain/rpc_client.rs`'s `CircuitBreaker` for the reconnect/backoff
//! shape — generalized into a small bounded pool since no pool crate
//! (bb8/deadpool) appears anywhere in the retrieval pack.

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

use crate::config::StorePoolSettings;

/// Sentinel user attribution row used when a worker's wallet/user can't
/// be resolved, so shares are never silently dropped.
pub const ORPHAN_MINER_NAME: &str = "__orphan__";
pub const ORPHAN_USER_ID: i64 = 0;

struct PooledConn {
    client: Client,
    created_at: Instant,
    last_used: Instant,
}

struct PoolInner {
    idle: Vec<PooledConn>,
    open_count: usize,
}

/// Bounded connection pool: at most `max_open` live connections, at most
/// `max_idle` sitting idle, each idle connection dropped after
/// `max_idle_secs` of disuse or `max_lifetime_secs` since creation.
pub struct PersistentStore {
    db_url: String,
    settings: StorePoolSettings,
    inner: Mutex<PoolInner>,
}

impl PersistentStore {
    pub fn new(db_url: String, settings: StorePoolSettings) -> Self {
        Self {
            db_url,
            settings,
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                open_count: 0,
            }),
        }
    }

    async fn connect_one(&self) -> Result<PooledConn> {
        let (client, connection) = tokio_postgres::connect(&self.db_url, NoTls)
            .await
            .map_err(|e| anyhow!("store connect failed: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("store connection driver error: {}", e);
            }
        });

        crate::metrics::inc_store_reconnects();
        let now = Instant::now();
        Ok(PooledConn {
            client,
            created_at: now,
            last_used: now,
        })
    }

    async fn acquire(&self) -> Result<PooledConn> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        while let Some(conn) = inner.idle.pop() {
            let expired = now.saturating_duration_since(conn.created_at)
                > Duration::from_secs(self.settings.max_lifetime_secs)
                || now.saturating_duration_since(conn.last_used)
                    > Duration::from_secs(self.settings.max_idle_secs);
            if expired {
                inner.open_count = inner.open_count.saturating_sub(1);
                continue;
            }
            return Ok(conn);
        }

        if inner.open_count >= self.settings.max_open {
            return Err(anyhow!("store pool exhausted ({} open)", inner.open_count));
        }

        drop(inner);
        let conn = self.connect_one().await?;
        let mut inner = self.inner.lock().await;
        inner.open_count += 1;
        Ok(conn)
    }

    async fn release(&self, mut conn: PooledConn) {
        conn.last_used = Instant::now();
        let mut inner = self.inner.lock().await;
        if inner.idle.len() < self.settings.max_idle {
            inner.idle.push(conn);
        } else {
            inner.open_count = inner.open_count.saturating_sub(1);
        }
    }

    /// Run `f` against a pooled connection, retrying once across a fresh
    /// reconnect if the first attempt fails — covers the common case of
    /// an idle connection the server side has already dropped.
    async fn with_conn<T, F>(&self, mut f: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c Client) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'c>>,
    {
        for attempt in 0..2 {
            let conn = match self.acquire().await {
                Ok(c) => c,
                Err(e) => {
                    crate::metrics::inc_store_errors();
                    if attempt == 1 {
                        return Err(e);
                    }
                    continue;
                }
            };
            let result = f(&conn.client).await;
            match result {
                Ok(v) => {
                    self.release(conn).await;
                    return Ok(v);
                }
                Err(e) => {
                    crate::metrics::inc_store_errors();
                    // Drop this connection rather than returning it to the
                    // pool; it may be broken.
                    let mut inner = self.inner.lock().await;
                    inner.open_count = inner.open_count.saturating_sub(1);
                    drop(inner);
                    if attempt == 1 {
                        return Err(anyhow!("store query failed: {}", e));
                    }
                }
            }
        }
        unreachable!()
    }

    pub async fn init_schema(&self) -> Result<()> {
        self.with_conn(|client| {
            Box::pin(async move {
                client
                    .batch_execute(
                        "CREATE TABLE IF NOT EXISTS users (
                            id BIGSERIAL PRIMARY KEY,
                            username TEXT UNIQUE NOT NULL,
                            email TEXT UNIQUE,
                            is_active BOOLEAN NOT NULL DEFAULT true,
                            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                        );
                        CREATE TABLE IF NOT EXISTS miners (
                            id BIGSERIAL PRIMARY KEY,
                            name TEXT UNIQUE NOT NULL,
                            user_id BIGINT NOT NULL,
                            wallet_address TEXT,
                            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
                        );
                        CREATE TABLE IF NOT EXISTS shares (
                            id BIGSERIAL PRIMARY KEY,
                            miner_id BIGINT NOT NULL REFERENCES miners(id),
                            user_id BIGINT NOT NULL,
                            job_id TEXT NOT NULL,
                            difficulty BIGINT NOT NULL,
                            accepted BOOLEAN NOT NULL,
                            nonce BIGINT NOT NULL,
                            hash TEXT NOT NULL,
                            submitted_at TIMESTAMPTZ NOT NULL DEFAULT now()
                        );
                        CREATE TABLE IF NOT EXISTS blocks_found (
                            id BIGSERIAL PRIMARY KEY,
                            miner_id BIGINT NOT NULL REFERENCES miners(id),
                            height BIGINT NOT NULL,
                            block_hash TEXT NOT NULL,
                            found_at TIMESTAMPTZ NOT NULL DEFAULT now()
                        );
                        INSERT INTO miners (name, user_id, wallet_address)
                        VALUES ('__orphan__', 0, NULL)
                        ON CONFLICT (name) DO NOTHING;",
                    )
                    .await
                    .map_err(|e| anyhow!("{}", e))
            })
        })
        .await
    }

    /// Resolve a worker's wallet/name to a miner id, falling back to the
    /// orphan sentinel row when no match exists so attribution never
    /// fails a submitted share.
    pub async fn resolve_or_orphan(&self, worker_name: &str, wallet: Option<&str>) -> Result<i64> {
        let worker_name = worker_name.to_string();
        let wallet = wallet.map(|s| s.to_string());
        let result = self
            .with_conn(move |client| {
                let worker_name = worker_name.clone();
                let wallet = wallet.clone();
                Box::pin(async move {
                    if let Some(row) = client
                        .query_opt("SELECT id FROM miners WHERE name = $1", &[&worker_name])
                        .await
                        .map_err(|e| anyhow!("{}", e))?
                    {
                        return Ok::<i64, anyhow::Error>(row.get(0));
                    }

                    let row = client
                        .query_one(
                            "INSERT INTO miners (name, user_id, wallet_address) VALUES ($1, 0, $2)
                             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
                             RETURNING id",
                            &[&worker_name, &wallet],
                        )
                        .await
                        .map_err(|e| anyhow!("{}", e))?;
                    Ok(row.get(0))
                })
            })
            .await;

        match result {
            Ok(id) => Ok(id),
            Err(e) => {
                tracing::warn!("attribution lookup failed for {}: {}, using orphan", worker_name, e);
                crate::metrics::inc_store_orphan_attributions();
                self.orphan_miner_id().await
            }
        }
    }

    async fn orphan_miner_id(&self) -> Result<i64> {
        self.with_conn(|client| {
            Box::pin(async move {
                let row = client
                    .query_one("SELECT id FROM miners WHERE name = '__orphan__'", &[])
                    .await
                    .map_err(|e| anyhow!("{}", e))?;
                Ok(row.get(0))
            })
        })
        .await
    }

    /// Look up an active account by username or email. Returns `None`
    /// when no row matches or the account is deactivated; never
    /// auto-creates a row, unlike `resolve_or_orphan`.
    pub async fn find_active_user(&self, identifier: &str) -> Result<Option<(i64, String)>> {
        let identifier = identifier.to_string();
        self.with_conn(move |client| {
            let identifier = identifier.clone();
            Box::pin(async move {
                let row = client
                    .query_opt(
                        "SELECT id, username FROM users WHERE (username = $1 OR email = $1) AND is_active = true",
                        &[&identifier],
                    )
                    .await
                    .map_err(|e| anyhow!("{}", e))?;
                Ok(row.map(|r| (r.get(0), r.get(1))))
            })
        })
        .await
    }

    pub async fn record_share(
        &self,
        miner_id: i64,
        user_id: i64,
        job_id: &str,
        difficulty: i64,
        accepted: bool,
        nonce: i64,
        hash: &str,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        let hash = hash.to_string();
        self.with_conn(move |client| {
            let job_id = job_id.clone();
            let hash = hash.clone();
            Box::pin(async move {
                client
                    .execute(
                        "INSERT INTO shares (miner_id, user_id, job_id, difficulty, accepted, nonce, hash)
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                        &[&miner_id, &user_id, &job_id, &difficulty, &accepted, &nonce, &hash],
                    )
                    .await
                    .map_err(|e| anyhow!("{}", e))?;
                Ok(())
            })
        })
        .await
    }

    pub async fn record_block_found(&self, miner_id: i64, height: i64, block_hash: &str) -> Result<()> {
        let block_hash = block_hash.to_string();
        self.with_conn(move |client| {
            let block_hash = block_hash.clone();
            Box::pin(async move {
                client
                    .execute(
                        "INSERT INTO blocks_found (miner_id, height, block_hash) VALUES ($1, $2, $3)",
                        &[&miner_id, &height, &block_hash],
                    )
                    .await
                    .map_err(|e| anyhow!("{}", e))?;
                Ok(())
            })
        })
        .await
    }

    pub async fn ping(&self) -> bool {
        self.with_conn(|client| Box::pin(async move { client.simple_query("SELECT 1").await.map_err(|e| anyhow!("{}", e)) }))
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orphan_constants_match_schema_default() {
        assert_eq!(ORPHAN_MINER_NAME, "__orphan__");
        assert_eq!(ORPHAN_USER_ID, 0);
    }

    #[tokio::test]
    async fn pool_reports_exhaustion_when_max_open_is_zero() {
        let store = PersistentStore::new(
            "postgres://unused/unused".to_string(),
            StorePoolSettings {
                max_open: 0,
                max_idle: 0,
                max_lifetime_secs: 300,
                max_idle_secs: 120,
            },
        );
        let res = store.acquire().await;
        assert!(res.is_err());
    }
}
