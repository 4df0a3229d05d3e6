//! `MiningConnection` (spec §3): per-socket session state.
//!
//! Grounded on `stratum/connection_v2.rs`'s `Connection`/`ConnectionState`/
//! `Protocol` — field shape and the write-mutex/outbound-channel pattern
//! are kept; XMRig-specific fields (`algorithm`, `user_agent`) are
//! dropped and the identity/attribution fields spec §3 names
//! (`userID`, stable connection ID with nanosecond tiebreaker,
//! valid/invalid counters) are added.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

use crate::hashrate::HashrateWindow;
use crate::jobs::MiningJob;
use crate::vardiff::VarDiffState;

static CONNECTION_TIEBREAKER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Subscribed,
    Authorized,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    V1,
    V2,
}

/// Bounded ring of recent job generations, keyed by job ID, so a submit
/// against a superseded-but-not-too-old job is still validated rather
/// than rejected outright (spec §9 Open Question: "retain the previous
/// N job generations"; resolved as N=2 in `DESIGN.md`/`SPEC_FULL.md`).
pub const RETAINED_JOB_GENERATIONS: usize = 2;

pub struct MiningConnection {
    pub id: String,
    pub peer_addr: SocketAddr,
    pub state: ConnectionState,
    pub protocol: ProtocolVariant,

    /// 0 = unauthenticated, per spec §3.
    pub user_id: i64,
    pub username: Option<String>,
    pub worker_name: Option<String>,
    pub authorized: bool,

    pub difficulty: u64,
    pub subscription_token: String,
    pub extranonce1: [u8; 4],

    last_share_at: Option<Instant>,
    pub shares_valid: u64,
    pub shares_invalid: u64,

    pub current_job_id: Option<String>,
    /// Recent job generations this connection may still validate against,
    /// most recent first, bounded to `RETAINED_JOB_GENERATIONS + 1`.
    job_ring: Vec<MiningJob>,

    pub vardiff: VarDiffState,
    pub hashrate: HashrateWindow,

    write_lock: Mutex<()>,
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl MiningConnection {
    pub fn new(
        peer_addr: SocketAddr,
        protocol: ProtocolVariant,
        extranonce1: [u8; 4],
        vardiff: VarDiffState,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        let tiebreaker = CONNECTION_TIEBREAKER.fetch_add(1, Ordering::Relaxed);
        let id = format!("{peer_addr}-{tiebreaker}");
        let difficulty = vardiff.initial_difficulty();
        Self {
            id,
            peer_addr,
            state: ConnectionState::Connected,
            protocol,
            user_id: 0,
            username: None,
            worker_name: None,
            authorized: false,
            difficulty,
            subscription_token: uuid::Uuid::new_v4().simple().to_string(),
            extranonce1,
            last_share_at: None,
            shares_valid: 0,
            shares_invalid: 0,
            current_job_id: None,
            job_ring: Vec::with_capacity(RETAINED_JOB_GENERATIONS + 1),
            vardiff,
            hashrate: HashrateWindow::default(),
            write_lock: Mutex::new(()),
            outbound,
        }
    }

    /// Serialize writes to this connection's socket (invariant I3):
    /// callers must hold this guard while writing.
    pub async fn write_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    pub fn record_share(&mut self, accepted: bool, now: Instant) {
        self.last_share_at = Some(now);
        if accepted {
            self.shares_valid += 1;
        } else {
            self.shares_invalid += 1;
        }
    }

    pub fn is_idle_since(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_share_at {
            Some(ts) => now.saturating_duration_since(ts) > timeout,
            None => false,
        }
    }

    /// Push a freshly-built job as current, retaining the displaced
    /// generations up to `RETAINED_JOB_GENERATIONS`.
    pub fn set_current_job(&mut self, job: MiningJob) {
        self.current_job_id = Some(job.job_id.clone());
        self.job_ring.insert(0, job);
        self.job_ring.truncate(RETAINED_JOB_GENERATIONS + 1);
    }

    /// Resolve a submitted `jobID` against the retained generations.
    /// `None` means the job is unknown or has aged out — an application
    /// error ("stale job"/"unknown job"), not a protocol error.
    pub fn resolve_job(&self, job_id: &str) -> Option<&MiningJob> {
        self.job_ring.iter().find(|j| j.job_id == job_id)
    }

    pub fn worker_id(&self) -> Option<String> {
        match (&self.username, &self.worker_name) {
            (Some(user), Some(worker)) => Some(format!("{user}.{worker}")),
            (Some(user), None) => Some(user.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::template::BlockTemplate;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 3333)
    }

    fn sample_job(job_id: &str) -> MiningJob {
        let tmpl = BlockTemplate {
            height: 1,
            previous_block_hash: "00".repeat(32),
            coinbase_value: 0,
            target: "0".repeat(64),
            bits: "1d00ffff".to_string(),
            version: 1,
            curtime: 0,
            transactions: vec![],
        };
        let mut job = crate::jobs::build_job(&tmpl, &[]);
        job.job_id = job_id.to_string();
        job
    }

    fn new_connection() -> MiningConnection {
        let (tx, _rx) = mpsc::unbounded_channel();
        MiningConnection::new(addr(), ProtocolVariant::V1, [0u8; 4], VarDiffState::new(Default::default()), tx)
    }

    #[test]
    fn two_connections_get_distinct_ids() {
        let a = new_connection();
        let b = new_connection();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn job_ring_retains_bounded_generations() {
        let mut conn = new_connection();
        for i in 0..5 {
            conn.set_current_job(sample_job(&format!("job{i}")));
        }
        assert!(conn.resolve_job("job4").is_some());
        assert!(conn.resolve_job("job2").is_some());
        assert!(conn.resolve_job("job0").is_none(), "generations older than the retained window must age out");
    }

    #[test]
    fn unauthorized_connection_has_zero_user_id() {
        let conn = new_connection();
        assert_eq!(conn.user_id, 0);
        assert!(!conn.authorized);
    }
}
