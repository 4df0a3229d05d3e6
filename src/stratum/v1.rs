//! V1 session handler (spec §4.2): line-delimited JSON request/response/
//! notification loop.
//!
//! Grounded on `stratum/server_v2.rs`'s `handle_message`/`handle_subscribe`/
//! `handle_authorize`/`handle_submit` dispatch and `stratum/protocol.rs`'s
//! `StratumRequest`/`StratumResponse`/`StratumError` shapes, re-pointed
//! from XMRig verbs to the Bitcoin-Stratum verb set this spec names.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::ApplicationError;
use crate::shares::pipeline::ShareContext;
use crate::stratum::connection::{ConnectionState, MiningConnection};
use crate::stratum::server::ServerCore;

const LINE_READ_DEADLINE: Duration = Duration::from_secs(300);
const MAX_LINE_BYTES: usize = 64 * 1024;

fn response(id: Value, result: Value, error: Option<&str>) -> Value {
    json!({ "id": id, "result": result, "error": error })
}

fn notification(method: &str, params: Value) -> Value {
    json!({ "id": Value::Null, "method": method, "params": params })
}

/// Drive one V1 connection until EOF, a read error, the idle deadline, or
/// shutdown. `prefix` is the bytes already peeked by the multiplexer;
/// `rx` drains the outbound channel the server registered this
/// connection with.
pub async fn run(
    server: Arc<ServerCore>,
    stream: TcpStream,
    prefix: Vec<u8>,
    conn_id: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(prefix.chain(read_half));

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout(LINE_READ_DEADLINE, reader.read_line(&mut line)).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::info!("v1 connection {} closed on read error: {}", conn_id, e);
                break;
            }
            Err(_) => {
                tracing::info!("v1 connection {} idle timeout", conn_id);
                break;
            }
        };
        if n == 0 {
            tracing::info!("v1 connection {} closed by peer (EOF)", conn_id);
            break;
        }
        if line.len() > MAX_LINE_BYTES {
            tracing::warn!("v1 connection {} sent oversized line, closing", conn_id);
            break;
        }

        server.keepalive.record_activity(&conn_id).await;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("v1 connection {} sent malformed json: {}", conn_id, e);
                continue;
            }
        };

        if let Err(e) = handle_request(&server, &conn_id, request).await {
            tracing::debug!("v1 connection {} request error: {:?}", conn_id, e);
        }
    }

    server.remove_connection(&conn_id).await;
    writer_task.abort();
    Ok(())
}

async fn handle_request(server: &Arc<ServerCore>, conn_id: &str, request: Value) -> anyhow::Result<()> {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let method = request.get("method").and_then(Value::as_str).unwrap_or("").to_string();
    let params = request.get("params").cloned().unwrap_or(Value::Array(vec![]));

    match method.as_str() {
        "mining.subscribe" => handle_subscribe(server, conn_id, id).await,
        "mining.authorize" => handle_authorize(server, conn_id, id, &params).await,
        "mining.submit" => handle_submit(server, conn_id, id, &params).await,
        "mining.extranonce.subscribe" | "mining.configure" | "mining.get_transactions" => {
            server.send_to(conn_id, response(id, Value::Bool(true), None)).await;
            Ok(())
        }
        other => {
            server
                .send_to(conn_id, response(id, Value::Null, Some(&format!("unknown method: {other}"))))
                .await;
            Ok(())
        }
    }
}

async fn handle_subscribe(server: &Arc<ServerCore>, conn_id: &str, id: Value) -> anyhow::Result<()> {
    let (extranonce1_hex, extranonce2_size, subscription_token) = server
        .with_connection_mut(conn_id, |c| {
            c.state = ConnectionState::Subscribed;
            (hex::encode(c.extranonce1), 4u32, c.subscription_token.clone())
        })
        .await
        .unwrap_or_default();

    let result = json!([
        [["mining.set_difficulty", subscription_token], ["mining.notify", subscription_token]],
        extranonce1_hex,
        extranonce2_size,
    ]);
    server.send_to(conn_id, response(id, result, None)).await;

    let difficulty = server.with_connection(conn_id, |c| c.difficulty).await.unwrap_or(1);
    server
        .send_to(conn_id, notification("mining.set_difficulty", json!([difficulty])))
        .await;

    if let Some(job) = server.current_job().await {
        server.with_connection_mut(conn_id, |c| c.set_current_job(job.clone())).await;
        let payload = ServerCore::job_notify_payload(&job);
        server.send_to(conn_id, notification("mining.notify", payload)).await;
    }
    Ok(())
}

async fn handle_authorize(server: &Arc<ServerCore>, conn_id: &str, id: Value, params: &Value) -> anyhow::Result<()> {
    let username = params
        .get(0)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    match server.store.find_active_user(&username).await {
        Ok(Some((user_id, account_username))) => {
            // Account authentication and miner attribution are separate
            // concerns: the miner row is upserted independently, keyed off
            // the worker name rather than the account lookup above.
            if let Err(e) = server.store.resolve_or_orphan(&username, None).await {
                tracing::warn!("v1 connection {} miner upsert failed: {}", conn_id, e);
            }

            server
                .with_connection_mut(conn_id, |c| {
                    c.user_id = user_id;
                    c.username = Some(account_username);
                    c.worker_name = Some(username.clone());
                    c.authorized = true;
                    c.state = ConnectionState::Authorized;
                })
                .await;
            server.send_to(conn_id, response(id, Value::Bool(true), None)).await;
        }
        Ok(None) => {
            server
                .send_to(conn_id, response(id, Value::Bool(false), Some("user not found or inactive")))
                .await;
        }
        Err(e) => {
            tracing::warn!("v1 connection {} user lookup failed: {}", conn_id, e);
            server
                .send_to(conn_id, response(id, Value::Bool(false), Some("user not found or inactive")))
                .await;
        }
    }
    Ok(())
}

async fn handle_submit(server: &Arc<ServerCore>, conn_id: &str, id: Value, params: &Value) -> anyhow::Result<()> {
    let authorized = server.with_connection(conn_id, |c| c.authorized).await.unwrap_or(false);
    if !authorized {
        server
            .send_to(conn_id, response(id, Value::Bool(false), Some("not authorized")))
            .await;
        return Ok(());
    }

    let job_id = params.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
    let extranonce2_hex = params.get(2).and_then(Value::as_str).unwrap_or_default();
    let ntime_hex = params.get(3).and_then(Value::as_str).unwrap_or_default();
    let nonce_hex = params.get(4).and_then(Value::as_str).unwrap_or_default();

    let extranonce2 = parse_fixed4(extranonce2_hex);
    let ntime = u32::from_str_radix(ntime_hex, 16).unwrap_or(0);
    let nonce = u32::from_str_radix(nonce_hex, 16).unwrap_or(0);

    let outcome = server
        .submit_share(conn_id, &job_id, extranonce2, ntime, nonce, None)
        .await;

    match outcome {
        Ok(result) => {
            server.send_to(conn_id, response(id, Value::Bool(result.accepted), None)).await;
            if let Some(new_difficulty) = result.new_difficulty {
                server
                    .send_to(conn_id, notification("mining.set_difficulty", json!([new_difficulty])))
                    .await;
            }
        }
        Err(ApplicationError::StaleJob) | Err(ApplicationError::UnknownJob) => {
            server.send_to(conn_id, response(id, Value::Bool(false), Some("stale job"))).await;
        }
        Err(ApplicationError::Unauthorized) => {
            server
                .send_to(conn_id, response(id, Value::Bool(false), Some("not authorized")))
                .await;
        }
        Err(e) => {
            server.send_to(conn_id, response(id, Value::Bool(false), Some(&e.to_string()))).await;
        }
    }
    Ok(())
}

fn parse_fixed4(hex_str: &str) -> [u8; 4] {
    let mut out = [0u8; 4];
    if let Ok(bytes) = hex::decode(hex_str) {
        let len = bytes.len().min(4);
        out[..len].copy_from_slice(&bytes[..len]);
    }
    out
}

trait ChainExt: tokio::io::AsyncRead + Unpin {}
impl<T: tokio::io::AsyncRead + Unpin> ChainExt for T {}

/// Small helper mirroring `std::io::Read::chain` for async readers: feed
/// the already-peeked prefix bytes back in before reading live.
trait PrefixChain {
    fn chain(self, rest: tokio::net::tcp::OwnedReadHalf) -> PrefixedReader;
}

impl PrefixChain for Vec<u8> {
    fn chain(self, rest: tokio::net::tcp::OwnedReadHalf) -> PrefixedReader {
        PrefixedReader { prefix: self, pos: 0, rest }
    }
}

struct PrefixedReader {
    prefix: Vec<u8>,
    pos: usize,
    rest: tokio::net::tcp::OwnedReadHalf,
}

impl tokio::io::AsyncRead for PrefixedReader {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let remaining = &this.prefix[this.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.pos += n;
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut this.rest).poll_read(cx, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fixed4_handles_short_and_exact_hex() {
        assert_eq!(parse_fixed4("aabbccdd"), [0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(parse_fixed4(""), [0, 0, 0, 0]);
    }

    #[test]
    fn response_shape_matches_v1_wire_format() {
        let v = response(json!(1), Value::Bool(true), None);
        assert_eq!(v["id"], json!(1));
        assert_eq!(v["result"], json!(true));
        assert!(v["error"].is_null());
    }
}
