//! Cross-module scenarios that don't fit naturally inside any single
//! module's `#[cfg(test)]` block: protocol detection over a real
//! loopback socket, a full V2 wire handshake, template-to-job assembly,
//! stale-job resolution across both protocol flavors, and the
//! vardiff/hashrate pair as a connection actually drives them.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use stratum_pool_core::jobs::template::BlockTemplate;
use stratum_pool_core::jobs::{build_job, MiningJob};
use stratum_pool_core::keepalive::KeepaliveManager;
use stratum_pool_core::stratum::{detect, DetectedProtocol};
use stratum_pool_core::vardiff::{VarDiffConfig, VarDiffState};

async fn loopback_pair() -> (tokio::net::TcpStream, tokio::net::TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let client = tokio::net::TcpStream::connect(addr);
    let (server, client) = tokio::join!(listener.accept(), client);
    (server.unwrap().0, client.unwrap())
}

#[tokio::test]
async fn protocol_detection_routes_each_prefix_over_a_real_socket() {
    use tokio::io::AsyncWriteExt;

    let (server, mut client) = loopback_pair().await;
    client.write_all(b"{\"id\":1,\"method\":\"mining.subscribe\"}").await.unwrap();
    match detect(server).await.unwrap() {
        DetectedProtocol::V1(_, prefix) => assert_eq!(prefix[0], b'{'),
        _ => panic!("expected V1 detection for a JSON-prefixed probe"),
    }

    let (server, mut client) = loopback_pair().await;
    client.write_all(b"GET /health HTTP/1.1\r\n").await.unwrap();
    match detect(server).await.unwrap() {
        DetectedProtocol::Http(_) => {}
        _ => panic!("expected HTTP detection for a GET probe"),
    }

    let (server, mut client) = loopback_pair().await;
    client.write_all(&[0x00, 0x00, 0x00, 0x01, 0x00, 0x00]).await.unwrap();
    match detect(server).await.unwrap() {
        DetectedProtocol::V2(_, prefix) => assert_eq!(&prefix[..2], &[0x00, 0x00]),
        _ => panic!("expected V2 detection for a zero-zero-prefixed probe"),
    }

    let (server, mut client) = loopback_pair().await;
    client.write_all(b"\x01\x02\x03garbage, no json anywhere").await.unwrap();
    match detect(server).await.unwrap() {
        DetectedProtocol::Unknown(_, _) => {}
        other => panic!("expected unknown-protocol classification, got a different variant: {}", matches_name(&other)),
    }
}

fn matches_name(p: &DetectedProtocol) -> &'static str {
    match p {
        DetectedProtocol::V1(..) => "V1",
        DetectedProtocol::V2(..) => "V2",
        DetectedProtocol::Http(..) => "Http",
        DetectedProtocol::Unknown(..) => "Unknown",
    }
}

fn sample_template_with_one_tx() -> BlockTemplate {
    BlockTemplate {
        height: 840_123,
        previous_block_hash: "ab".repeat(32),
        coinbase_value: 312_500_000,
        target: "0".repeat(64),
        bits: "1a05dd50".to_string(),
        version: 0x2000_0000,
        curtime: 1_753_000_000,
        transactions: vec!["cd".repeat(32)],
    }
}

#[test]
fn template_to_job_assembles_a_valid_coinbase_and_a_single_branch_hash() {
    let template = sample_template_with_one_tx();
    let payout_script = vec![0x76, 0xa9, 0x14, 0x00, 0x01, 0x02, 0x03, 0x88, 0xac];
    let job = build_job(&template, &payout_script);

    assert_eq!(job.height, template.height);
    assert_eq!(job.merkle_branch.len(), 1, "one non-coinbase tx produces a branch of length one");

    let extranonce1 = [0xaa, 0xbb, 0xcc, 0xdd];
    let extranonce2 = [0x01, 0x02, 0x03, 0x04];
    let mut coinbase = Vec::new();
    coinbase.extend_from_slice(&job.coinbase_prefix);
    coinbase.extend_from_slice(&extranonce1);
    coinbase.extend_from_slice(&extranonce2);
    coinbase.extend_from_slice(&job.coinbase_suffix);

    assert!(coinbase.len() > job.coinbase_prefix.len() + job.coinbase_suffix.len());
    assert_eq!(job.prev_hash_le.len(), 32);

    let second_job = build_job(&template, &payout_script);
    assert_ne!(job.job_id, second_job.job_id, "every build gets a fresh job id even for the same template");
}

#[test]
fn stale_job_resolution_works_for_both_hex_v1_ids_and_decimal_v2_ids() {
    use stratum_pool_core::stratum::{MiningConnection, ProtocolVariant};
    use std::net::{IpAddr, Ipv4Addr};

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4000);
    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let mut conn = MiningConnection::new(addr, ProtocolVariant::V2, [0u8; 4], VarDiffState::new(VarDiffConfig::default()), tx);

    let template = sample_template_with_one_tx();
    let mut jobs: Vec<MiningJob> = Vec::new();
    for _ in 0..4 {
        let job = build_job(&template, &[]);
        jobs.push(job.clone());
        conn.set_current_job(job);
    }

    // A V2 submit carries job_id as a decimal u32; the connection ring
    // keys jobs by the same hex string `build_job` assigns, so the V2
    // handler must re-derive that hex string before looking it up.
    let most_recent = jobs.last().unwrap();
    let as_u32 = u32::from_str_radix(&most_recent.job_id, 16).expect("job ids are hex");
    let relooked_up = format!("{:x}", as_u32);
    assert!(conn.resolve_job(&relooked_up).is_some());

    let oldest = &jobs[0];
    assert!(conn.resolve_job(&oldest.job_id).is_none(), "generation older than the retained window must be unresolvable");
}

#[test]
fn vardiff_and_hashrate_track_a_bursty_then_idle_connection() {
    let cfg = VarDiffConfig {
        target_share_time: Duration::from_secs(10),
        retarget_time: Duration::from_secs(10),
        variance: 0.1,
        min_difficulty: 1,
        max_difficulty: 1_000_000,
        initial_difficulty: 1000,
        retarget_share_count: 3,
    };
    let mut vardiff = VarDiffState::new(cfg);
    let mut hashrate = stratum_pool_core::hashrate::HashrateWindow::new(Duration::from_secs(60));
    let mut difficulty = vardiff.initial_difficulty();
    let start = Instant::now();

    // A burst of shares well inside the target window: the controller
    // should eventually raise difficulty, and the hashrate window should
    // have accumulated every accepted sample.
    for i in 0..6u64 {
        let now = start + Duration::from_millis(i * 200);
        hashrate.record(difficulty, now);
        if let Some(next) = vardiff.on_share(now, true, difficulty) {
            difficulty = next;
        }
    }
    let final_check = start + Duration::from_secs(10);
    if let Some(next) = vardiff.on_share(final_check, true, difficulty) {
        difficulty = next;
    }

    assert!(difficulty > 1000, "a burst well inside the target share time should raise difficulty, not lower it");
    assert_eq!(hashrate.sample_count(), 6);

    let long_idle = final_check + Duration::from_secs(120);
    assert_eq!(hashrate.hashrate(long_idle), 0.0, "samples outside the window are evicted once queried");
}

#[tokio::test]
async fn keepalive_sweeper_drops_idle_connections_but_spares_active_ones() {
    let mgr = std::sync::Arc::new(KeepaliveManager::new(Duration::from_millis(5), 2));
    mgr.start("idle-conn").await;
    mgr.start("active-conn").await;

    // Two sweeps are needed to cross max_missed = 2; `active-conn` gets
    // its activity refreshed right before each one, so it never misses.
    tokio::time::sleep(Duration::from_millis(6)).await;
    mgr.record_activity("active-conn").await;
    let first = mgr.sweep().await;
    assert!(first.is_empty(), "a single miss must not disconnect yet");

    tokio::time::sleep(Duration::from_millis(6)).await;
    mgr.record_activity("active-conn").await;
    let second = mgr.sweep().await;
    assert_eq!(second, vec!["idle-conn".to_string()]);
}
