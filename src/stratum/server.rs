//! Server core (spec §4.9): listener, connection registry, current-job
//! pointer, extranonce1 counter, broadcast fan-out, graceful shutdown.
//!
//! Grounded directly on `stratum/server_v2.rs`'s `StratumServer`: the
//! connections map, accept loop with a `socket2` `SO_REUSEADDR` bind, the
//! per-connection spawned writer task draining an `mpsc::UnboundedSender`,
//! and the write-lock-before-read-lock deadlock-avoidance discipline are
//! all carried over. `Shutdown()`'s `done` channel (spec §4.9/§5)
//! replaces the teacher's "axum graceful shutdown only" pattern: the
//! Stratum listener gets its own `tokio::sync::watch`-based done signal.

use serde_json::{json, Value};
use socket2::{Domain, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex, RwLock};

use crate::config::Config;
use crate::error::ApplicationError;
use crate::jobs::{build_job, MiningJob};
use crate::jobs::template::BlockTemplate;
use crate::keepalive::KeepaliveManager;
use crate::shares::algorithm::AlgorithmContract;
use crate::shares::pipeline::{ShareContext, ShareOutcome, SharePipeline};
use crate::stratum::connection::{MiningConnection, ProtocolVariant};
use crate::stratum::multiplexer::{self, DetectedProtocol};
use crate::stratum::{v1, v2};
use crate::store::{Cache, PersistentStore};
use crate::vardiff::VarDiffConfig;

pub struct ServerCore {
    connections: RwLock<HashMap<String, Arc<Mutex<MiningConnection>>>>,
    current_job: RwLock<Option<MiningJob>>,
    last_height: RwLock<Option<u64>>,
    extranonce1_counter: AtomicU32,
    pub keepalive: Arc<KeepaliveManager>,
    pub store: Arc<PersistentStore>,
    cache: Arc<Cache>,
    pipeline: Arc<SharePipeline>,
    vardiff_cfg: VarDiffConfig,
    payout_script_pubkey: Vec<u8>,
}

impl ServerCore {
    pub fn new(
        config: &Config,
        store: Arc<PersistentStore>,
        cache: Arc<Cache>,
        algorithm: Arc<dyn AlgorithmContract>,
    ) -> Arc<Self> {
        let keepalive = Arc::new(KeepaliveManager::new(
            std::time::Duration::from_secs(config.keepalive.interval_secs),
            config.keepalive.max_missed,
        ));
        let pipeline = Arc::new(SharePipeline::new(store.clone(), cache.clone(), algorithm));
        Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            current_job: RwLock::new(None),
            last_height: RwLock::new(None),
            extranonce1_counter: AtomicU32::new(1),
            keepalive,
            store,
            cache,
            pipeline,
            vardiff_cfg: VarDiffConfig::from(&config.vardiff),
            payout_script_pubkey: config.wallet_address.as_bytes().to_vec(),
        })
    }

    fn next_extranonce1(&self) -> [u8; 4] {
        let n = self.extranonce1_counter.fetch_add(1, Ordering::Relaxed);
        n.to_be_bytes()
    }

    /// Accept loop. Exits when `done` fires or `Accept` errors.
    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr, mut done: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = bind_listener(bind_addr)?;
        tracing::info!("stratum listener bound on {}", bind_addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_new_connection(stream, peer_addr).await {
                                    tracing::debug!("connection from {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {}", e);
                        }
                    }
                }
                _ = done.changed() => {
                    tracing::info!("stratum server shutting down");
                    self.close_all_connections().await;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_new_connection(self: &Arc<Self>, stream: tokio::net::TcpStream, peer_addr: SocketAddr) -> anyhow::Result<()> {
        match multiplexer::detect(stream).await? {
            DetectedProtocol::V1(stream, prefix) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let conn_id = self.register(peer_addr, ProtocolVariant::V1, tx).await;
                crate::metrics::inc_protocol_detected("v1");
                v1::run(self.clone(), stream, prefix, conn_id, rx).await
            }
            DetectedProtocol::V2(stream, prefix) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let conn_id = self.register(peer_addr, ProtocolVariant::V2, tx).await;
                crate::metrics::inc_protocol_detected("v2");
                v2::run(self.clone(), stream, prefix, conn_id, rx).await
            }
            DetectedProtocol::Http(stream) => {
                crate::metrics::inc_protocol_detected("http");
                multiplexer::respond_http_probe(stream).await
            }
            DetectedProtocol::Unknown(_stream, _buf) => {
                crate::metrics::inc_protocol_detected("unknown");
                tracing::info!("closing connection from {} with unrecognized protocol bytes", peer_addr);
                Ok(())
            }
        }
    }

    async fn register(self: &Arc<Self>, peer_addr: SocketAddr, protocol: ProtocolVariant, tx: mpsc::UnboundedSender<Vec<u8>>) -> String {
        let extranonce1 = self.next_extranonce1();
        let vardiff = crate::vardiff::VarDiffState::new(self.vardiff_cfg);
        let conn = MiningConnection::new(peer_addr, protocol, extranonce1, vardiff, tx);
        let conn_id = conn.id.clone();
        self.connections.write().await.insert(conn_id.clone(), Arc::new(Mutex::new(conn)));
        self.keepalive.start(&conn_id).await;
        crate::metrics::inc_connections();
        conn_id
    }

    pub async fn remove_connection(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
        self.keepalive.stop(conn_id).await;
        crate::metrics::dec_connections();
    }

    async fn close_all_connections(&self) {
        let ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for id in ids {
            self.remove_connection(&id).await;
        }
    }

    async fn get_connection_arc(&self, conn_id: &str) -> Option<Arc<Mutex<MiningConnection>>> {
        self.connections.read().await.get(conn_id).cloned()
    }

    pub async fn with_connection<T>(&self, conn_id: &str, f: impl FnOnce(&MiningConnection) -> T) -> Option<T> {
        let conn_arc = self.get_connection_arc(conn_id).await?;
        let conn = conn_arc.lock().await;
        Some(f(&conn))
    }

    pub async fn with_connection_mut<T>(&self, conn_id: &str, f: impl FnOnce(&mut MiningConnection) -> T) -> Option<T> {
        let conn_arc = self.get_connection_arc(conn_id).await?;
        let mut conn = conn_arc.lock().await;
        Some(f(&mut conn))
    }

    /// Send a JSON-line message (response or notification) to a V1
    /// connection, serialized under that connection's write lock
    /// (invariant I3: one writer at a time, same path for all sends).
    pub async fn send_to(&self, conn_id: &str, message: Value) {
        let Some(conn_arc) = self.get_connection_arc(conn_id).await else { return };
        let conn = conn_arc.lock().await;
        let _guard = conn.write_guard().await;
        let mut bytes = match serde_json::to_vec(&message) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("failed to serialize message for {}: {}", conn_id, e);
                return;
            }
        };
        bytes.push(b'\n');
        let _ = conn.outbound.send(bytes);
    }

    /// Send a raw framed V2 message to a connection.
    pub async fn send_frame(&self, conn_id: &str, frame: Vec<u8>) {
        let Some(conn_arc) = self.get_connection_arc(conn_id).await else { return };
        let conn = conn_arc.lock().await;
        let _guard = conn.write_guard().await;
        let _ = conn.outbound.send(frame);
    }

    pub async fn current_job(&self) -> Option<MiningJob> {
        self.current_job.read().await.clone()
    }

    /// Build the `mining.notify` params array for a job. Pure function so
    /// it can be reused both for the height-changed broadcast and for the
    /// initial notify a freshly subscribed connection gets.
    pub fn job_notify_payload(job: &MiningJob) -> Value {
        json!([
            job.job_id,
            hex::encode(job.prev_hash_le),
            hex::encode(&job.coinbase_prefix),
            hex::encode(&job.coinbase_suffix),
            job.merkle_branch.iter().map(hex::encode).collect::<Vec<_>>(),
            format!("{:08x}", job.version),
            job.bits,
            format!("{:08x}", job.time),
            true,
        ])
    }

    pub async fn current_job_notify_payload(&self) -> Option<Value> {
        let job = self.current_job().await?;
        Some(Self::job_notify_payload(&job))
    }

    /// Apply a freshly fetched template: build the job, swap it in under
    /// a write lock, and broadcast with `cleanJobs = true` only if the
    /// height changed (spec §4.4).
    pub async fn apply_template(self: &Arc<Self>, template: BlockTemplate) {
        let job = build_job(&template, &self.payout_script_pubkey);
        let height = job.height;

        {
            let mut current = self.current_job.write().await;
            *current = Some(job.clone());
        }
        crate::metrics::set_template_height(height);

        let mut last_height = self.last_height.write().await;
        let height_changed = *last_height != Some(height);
        *last_height = Some(height);
        drop(last_height);

        if !height_changed {
            return;
        }

        crate::metrics::inc_job_broadcasts();
        let conn_ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        for conn_id in conn_ids {
            let authorized = self.with_connection_mut(&conn_id, |c| {
                c.set_current_job(job.clone());
                c.authorized
            }).await.unwrap_or(false);

            if !authorized {
                continue;
            }

            let protocol = self.with_connection(&conn_id, |c| c.protocol).await;
            match protocol {
                Some(ProtocolVariant::V1) => {
                    if let Some(payload) = self.current_job_notify_payload().await {
                        self.send_to(&conn_id, json!({ "id": Value::Null, "method": "mining.notify", "params": payload })).await;
                    }
                }
                Some(ProtocolVariant::V2) => {
                    v2::broadcast_new_job(self, &conn_id, &job).await;
                }
                None => {}
            }
        }
    }

    pub async fn submit_share(
        self: &Arc<Self>,
        conn_id: &str,
        job_id: &str,
        extranonce2: [u8; 4],
        ntime: u32,
        nonce: u32,
        version_bits: Option<u32>,
    ) -> Result<ShareOutcome, ApplicationError> {
        let conn_arc = self
            .get_connection_arc(conn_id)
            .await
            .ok_or(ApplicationError::Unauthorized)?;
        let mut conn = conn_arc.lock().await;

        if !conn.authorized || conn.user_id == 0 {
            return Err(ApplicationError::Unauthorized);
        }

        let job = conn.resolve_job(job_id).cloned().ok_or(ApplicationError::StaleJob)?;
        let difficulty = conn.difficulty;
        let extranonce1 = conn.extranonce1;
        let worker_name = conn.worker_name.clone().unwrap_or_default();
        let user_id = conn.user_id;
        let shares_valid_before = conn.shares_valid;
        let now = Instant::now();

        let ctx = ShareContext {
            job: &job,
            extranonce1,
            extranonce2,
            ntime,
            nonce,
            version_bits,
            difficulty,
            worker_name,
            user_id,
            wallet: None,
            shares_valid_before,
        };

        let outcome = self.pipeline.submit(ctx, &mut conn.vardiff, &mut conn.hashrate, now).await?;
        conn.record_share(outcome.accepted, now);
        if let Some(new_difficulty) = outcome.new_difficulty {
            conn.difficulty = new_difficulty;
            crate::metrics::inc_vardiff_retarget();
        }
        Ok(outcome)
    }

    pub async fn cache_ping(&self) -> bool {
        self.cache.ping().await
    }
}

fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}
