//! V2 session handler (spec §4.3): full-duplex, length-prefixed,
//! little-endian binary frames.
//!
//! No teacher equivalent exists (the teacher pool speaks only JSON-line
//! protocols). Built fresh against the frame-header/message-type table in
//! spec §4.3/§6, structured the way
//! `examples/BTCDecoded-reference-node/src/network/stratum_v2/messages.rs`
//! lays out a binary codec module: one `encode`/`decode` pair per message
//! type, a `MessageType` enum mapped to the wire byte.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{ApplicationError, ProtocolError};
use crate::jobs::MiningJob;
use crate::stratum::connection::{ConnectionState, MiningConnection, ProtocolVariant};
use crate::stratum::server::ServerCore;

const HEADER_LEN: usize = 6;
const READ_DEADLINE: Duration = Duration::from_secs(300);
const MAX_FRAME_LEN: usize = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SetupConnection,
    SetupConnectionSuccess,
    SetupConnectionError,
    OpenStandardMiningChannel,
    OpenStandardMiningChannelSuccess,
    OpenStandardMiningChannelError,
    NewMiningJob,
    SetNewPrevHash,
    SubmitSharesStandard,
    SubmitSharesSuccess,
    SubmitSharesError,
    SetTarget,
    Reconnect,
}

impl MessageType {
    pub fn wire_byte(self) -> u8 {
        match self {
            MessageType::SetupConnection => 0x00,
            MessageType::SetupConnectionSuccess => 0x01,
            MessageType::SetupConnectionError => 0x02,
            MessageType::OpenStandardMiningChannel => 0x10,
            MessageType::OpenStandardMiningChannelSuccess => 0x11,
            MessageType::OpenStandardMiningChannelError => 0x12,
            MessageType::NewMiningJob => 0x20,
            MessageType::SetNewPrevHash => 0x22,
            MessageType::SubmitSharesStandard => 0x30,
            MessageType::SubmitSharesSuccess => 0x32,
            MessageType::SubmitSharesError => 0x33,
            MessageType::SetTarget => 0x40,
            MessageType::Reconnect => 0x50,
        }
    }

    pub fn from_wire_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => MessageType::SetupConnection,
            0x01 => MessageType::SetupConnectionSuccess,
            0x02 => MessageType::SetupConnectionError,
            0x10 => MessageType::OpenStandardMiningChannel,
            0x11 => MessageType::OpenStandardMiningChannelSuccess,
            0x12 => MessageType::OpenStandardMiningChannelError,
            0x20 => MessageType::NewMiningJob,
            0x22 => MessageType::SetNewPrevHash,
            0x30 => MessageType::SubmitSharesStandard,
            0x32 => MessageType::SubmitSharesSuccess,
            0x33 => MessageType::SubmitSharesError,
            0x40 => MessageType::SetTarget,
            0x50 => MessageType::Reconnect,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub extension_type: u16,
    pub msg_type: u8,
    pub msg_length: u32,
}

pub fn encode_header(h: FrameHeader) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..2].copy_from_slice(&h.extension_type.to_le_bytes());
    out[2] = h.msg_type;
    let len_bytes = h.msg_length.to_le_bytes();
    out[3..6].copy_from_slice(&len_bytes[0..3]);
    out
}

pub fn decode_header(buf: &[u8]) -> Result<FrameHeader, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::TruncatedFrame { expected: HEADER_LEN, got: buf.len() });
    }
    let extension_type = u16::from_le_bytes([buf[0], buf[1]]);
    let msg_type = buf[2];
    let msg_length = u32::from_le_bytes([buf[3], buf[4], buf[5], 0]);
    Ok(FrameHeader { extension_type, msg_type, msg_length })
}

fn frame(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let header = encode_header(FrameHeader {
        extension_type: 0,
        msg_type: msg_type.wire_byte(),
        msg_length: payload.len() as u32,
    });
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
    out
}

fn push_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(255) as u8; // >255 truncates on write, per spec §4.3
    buf.push(len);
    buf.extend_from_slice(&bytes[..len as usize]);
}

fn read_string(buf: &[u8], pos: &mut usize) -> Result<String, ProtocolError> {
    if *pos >= buf.len() {
        return Err(ProtocolError::TruncatedFrame { expected: *pos + 1, got: buf.len() });
    }
    let len = buf[*pos] as usize;
    *pos += 1;
    if *pos + len > buf.len() {
        return Err(ProtocolError::TruncatedFrame { expected: *pos + len, got: buf.len() });
    }
    let s = String::from_utf8_lossy(&buf[*pos..*pos + len]).to_string();
    *pos += len;
    Ok(s)
}

// --- SetupConnection / SetupConnectionSuccess ---

#[derive(Debug, Clone, PartialEq)]
pub struct SetupConnection {
    pub min_version: u16,
    pub max_version: u16,
    pub flags: u32,
    pub endpoint_host: String,
}

pub fn decode_setup_connection(payload: &[u8]) -> Result<SetupConnection, ProtocolError> {
    if payload.len() < 9 {
        return Err(ProtocolError::TruncatedFrame { expected: 9, got: payload.len() });
    }
    let min_version = u16::from_le_bytes([payload[1], payload[2]]);
    let max_version = u16::from_le_bytes([payload[3], payload[4]]);
    let flags = u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]);
    let mut pos = 9;
    let endpoint_host = read_string(payload, &mut pos).unwrap_or_default();
    Ok(SetupConnection { min_version, max_version, flags, endpoint_host })
}

pub fn encode_setup_connection_success(used_version: u16, flags: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&used_version.to_le_bytes());
    payload.extend_from_slice(&flags.to_le_bytes());
    frame(MessageType::SetupConnectionSuccess, &payload)
}

// --- OpenStandardMiningChannel / Success ---

#[derive(Debug, Clone, PartialEq)]
pub struct OpenStandardMiningChannel {
    pub request_id: u32,
    pub user_identity: String,
    pub nominal_hashrate: f32,
}

pub fn decode_open_standard_mining_channel(payload: &[u8]) -> Result<OpenStandardMiningChannel, ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::TruncatedFrame { expected: 4, got: payload.len() });
    }
    let request_id = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let mut pos = 4;
    let user_identity = read_string(payload, &mut pos)?;
    let nominal_hashrate = if payload.len() >= pos + 4 {
        f32::from_le_bytes([payload[pos], payload[pos + 1], payload[pos + 2], payload[pos + 3]])
    } else {
        0.0
    };
    Ok(OpenStandardMiningChannel { request_id, user_identity, nominal_hashrate })
}

pub fn encode_open_standard_mining_channel_success(request_id: u32, channel_id: u32, target: [u8; 32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&request_id.to_le_bytes());
    payload.extend_from_slice(&channel_id.to_le_bytes());
    payload.extend_from_slice(&target);
    frame(MessageType::OpenStandardMiningChannelSuccess, &payload)
}

// --- NewMiningJob / SetNewPrevHash ---

pub fn encode_new_mining_job(channel_id: u32, job_id: u32, version: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&channel_id.to_le_bytes());
    payload.extend_from_slice(&job_id.to_le_bytes());
    payload.extend_from_slice(&version.to_le_bytes());
    frame(MessageType::NewMiningJob, &payload)
}

pub fn encode_set_new_prev_hash(channel_id: u32, job_id: u32, prev_hash: [u8; 32], min_ntime: u32, nbits: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&channel_id.to_le_bytes());
    payload.extend_from_slice(&job_id.to_le_bytes());
    payload.extend_from_slice(&prev_hash);
    payload.extend_from_slice(&min_ntime.to_le_bytes());
    payload.extend_from_slice(&nbits.to_le_bytes());
    frame(MessageType::SetNewPrevHash, &payload)
}

pub fn encode_set_target(channel_id: u32, max_target: [u8; 32]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&channel_id.to_le_bytes());
    payload.extend_from_slice(&max_target);
    frame(MessageType::SetTarget, &payload)
}

// --- SubmitSharesStandard / Success / Error ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitSharesStandard {
    pub channel_id: u32,
    pub sequence_number: u32,
    pub job_id: u32,
    pub nonce: u32,
    pub ntime: u32,
    pub version: u32,
}

pub fn encode_submit_shares_standard(m: SubmitSharesStandard) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    payload.extend_from_slice(&m.channel_id.to_le_bytes());
    payload.extend_from_slice(&m.sequence_number.to_le_bytes());
    payload.extend_from_slice(&m.job_id.to_le_bytes());
    payload.extend_from_slice(&m.nonce.to_le_bytes());
    payload.extend_from_slice(&m.ntime.to_le_bytes());
    payload.extend_from_slice(&m.version.to_le_bytes());
    frame(MessageType::SubmitSharesStandard, &payload)
}

pub fn decode_submit_shares_standard(payload: &[u8]) -> Result<SubmitSharesStandard, ProtocolError> {
    if payload.len() < 24 {
        return Err(ProtocolError::TruncatedFrame { expected: 24, got: payload.len() });
    }
    let u32_at = |i: usize| u32::from_le_bytes([payload[i], payload[i + 1], payload[i + 2], payload[i + 3]]);
    Ok(SubmitSharesStandard {
        channel_id: u32_at(0),
        sequence_number: u32_at(4),
        job_id: u32_at(8),
        nonce: u32_at(12),
        ntime: u32_at(16),
        version: u32_at(20),
    })
}

pub fn encode_submit_shares_success(channel_id: u32, last_sequence_number: u32, new_submits_accepted_count: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&channel_id.to_le_bytes());
    payload.extend_from_slice(&last_sequence_number.to_le_bytes());
    payload.extend_from_slice(&new_submits_accepted_count.to_le_bytes());
    frame(MessageType::SubmitSharesSuccess, &payload)
}

pub fn encode_submit_shares_error(channel_id: u32, sequence_number: u32, reason: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&channel_id.to_le_bytes());
    payload.extend_from_slice(&sequence_number.to_le_bytes());
    push_string(&mut payload, reason);
    frame(MessageType::SubmitSharesError, &payload)
}

/// Drive one V2 connection through the state machine described in spec
/// §4.3: START -> CONNECTED (on SetupConnection) -> CHANNEL_OPEN (on
/// OpenStandardMiningChannel) -> CHANNEL_OPEN (SubmitSharesStandard
/// loop). Any error or socket close is terminal.
pub async fn run(
    server: Arc<ServerCore>,
    stream: TcpStream,
    prefix: Vec<u8>,
    conn_id: String,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
) -> anyhow::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut buf = prefix;
    let mut channel_id: Option<u32> = None;

    loop {
        while buf.len() < HEADER_LEN {
            let mut chunk = [0u8; 4096];
            let n = match tokio::time::timeout(READ_DEADLINE, read_half.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => {
                    tracing::info!("v2 connection {} closed", conn_id);
                    server.remove_connection(&conn_id).await;
                    writer_task.abort();
                    return Ok(());
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    tracing::info!("v2 connection {} read error: {}", conn_id, e);
                    server.remove_connection(&conn_id).await;
                    writer_task.abort();
                    return Ok(());
                }
            };
            buf.extend_from_slice(&chunk[..n]);
        }

        let header = decode_header(&buf[..HEADER_LEN])?;
        let total_len = HEADER_LEN + header.msg_length as usize;
        if header.msg_length as usize > MAX_FRAME_LEN {
            tracing::warn!("v2 connection {} sent oversized frame, closing", conn_id);
            break;
        }
        while buf.len() < total_len {
            let mut chunk = [0u8; 4096];
            let n = match tokio::time::timeout(READ_DEADLINE, read_half.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => {
                    server.remove_connection(&conn_id).await;
                    writer_task.abort();
                    return Ok(());
                }
                Ok(Ok(n)) => n,
                Ok(Err(_)) => {
                    server.remove_connection(&conn_id).await;
                    writer_task.abort();
                    return Ok(());
                }
            };
            buf.extend_from_slice(&chunk[..n]);
        }

        let payload = buf[HEADER_LEN..total_len].to_vec();
        buf.drain(..total_len);

        server.keepalive.record_activity(&conn_id).await;

        match MessageType::from_wire_byte(header.msg_type) {
            Some(MessageType::SetupConnection) => {
                if let Ok(setup) = decode_setup_connection(&payload) {
                    server
                        .with_connection_mut(&conn_id, |c| c.state = ConnectionState::Connected)
                        .await;
                    server
                        .send_frame(&conn_id, encode_setup_connection_success(setup.max_version, setup.flags))
                        .await;
                }
            }
            Some(MessageType::OpenStandardMiningChannel) => {
                if let Ok(open) = decode_open_standard_mining_channel(&payload) {
                    let id = 1u32;
                    channel_id = Some(id);
                    server
                        .with_connection_mut(&conn_id, |c| {
                            c.state = ConnectionState::Subscribed;
                            c.worker_name = Some(open.user_identity.clone());
                        })
                        .await;
                    server
                        .send_frame(&conn_id, encode_open_standard_mining_channel_success(open.request_id, id, [0xffu8; 32]))
                        .await;
                    if let Some(job) = server.current_job().await {
                        broadcast_new_job(&server, &conn_id, &job).await;
                    }
                }
            }
            Some(MessageType::SubmitSharesStandard) => {
                if let Ok(submit) = decode_submit_shares_standard(&payload) {
                    let cid = channel_id.unwrap_or(submit.channel_id);
                    let outcome = server
                        .submit_share(&conn_id, &format!("{:x}", submit.job_id), [0u8; 4], submit.ntime, submit.nonce, Some(submit.version))
                        .await;
                    match outcome {
                        Ok(result) if result.accepted => {
                            server
                                .send_frame(&conn_id, encode_submit_shares_success(cid, submit.sequence_number, 1))
                                .await;
                        }
                        Ok(_) => {
                            server
                                .send_frame(&conn_id, encode_submit_shares_error(cid, submit.sequence_number, "rejected"))
                                .await;
                        }
                        Err(ApplicationError::StaleJob) | Err(ApplicationError::UnknownJob) => {
                            server
                                .send_frame(&conn_id, encode_submit_shares_error(cid, submit.sequence_number, "stale-job"))
                                .await;
                        }
                        Err(e) => {
                            server
                                .send_frame(&conn_id, encode_submit_shares_error(cid, submit.sequence_number, &e.to_string()))
                                .await;
                        }
                    }
                }
            }
            _ => {
                tracing::debug!("v2 connection {} sent unhandled message type 0x{:02x}", conn_id, header.msg_type);
            }
        }
    }

    server.remove_connection(&conn_id).await;
    writer_task.abort();
    Ok(())
}

pub async fn broadcast_new_job(server: &Arc<ServerCore>, conn_id: &str, job: &MiningJob) {
    let channel_id = 1u32;
    let job_id_num: u32 = u32::from_str_radix(&job.job_id, 16).unwrap_or(0);
    server.send_frame(conn_id, encode_new_mining_job(channel_id, job_id_num, job.version as u32)).await;
    server
        .send_frame(conn_id, encode_set_new_prev_hash(channel_id, job_id_num, job.prev_hash_le, job.time, 0))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = FrameHeader { extension_type: 7, msg_type: 0x30, msg_length: 1234 };
        let encoded = encode_header(h);
        let decoded = decode_header(&encoded).unwrap();
        assert_eq!(decoded.extension_type, 7);
        assert_eq!(decoded.msg_type, 0x30);
        assert_eq!(decoded.msg_length, 1234);
    }

    #[test]
    fn submit_shares_standard_round_trips_bit_for_bit() {
        let original = SubmitSharesStandard {
            channel_id: 42,
            sequence_number: 1,
            job_id: 1000,
            nonce: 0x1234_5678,
            ntime: 1_703_001_600,
            version: 0x2000_0000,
        };
        let frame_bytes = encode_submit_shares_standard(original);
        let header = decode_header(&frame_bytes[..HEADER_LEN]).unwrap();
        assert_eq!(header.msg_type, MessageType::SubmitSharesStandard.wire_byte());
        let decoded = decode_submit_shares_standard(&frame_bytes[HEADER_LEN..]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn truncated_frame_is_a_protocol_error() {
        let short = [0u8; 3];
        assert!(decode_header(&short).is_err());
    }

    #[test]
    fn string_longer_than_255_bytes_is_truncated_on_write() {
        let mut buf = Vec::new();
        let long = "a".repeat(300);
        push_string(&mut buf, &long);
        assert_eq!(buf[0], 255);
        assert_eq!(buf.len(), 256);
    }

    #[test]
    fn message_type_wire_bytes_match_spec_table() {
        assert_eq!(MessageType::SetupConnection.wire_byte(), 0x00);
        assert_eq!(MessageType::OpenStandardMiningChannel.wire_byte(), 0x10);
        assert_eq!(MessageType::NewMiningJob.wire_byte(), 0x20);
        assert_eq!(MessageType::SetNewPrevHash.wire_byte(), 0x22);
        assert_eq!(MessageType::SubmitSharesStandard.wire_byte(), 0x30);
        assert_eq!(MessageType::SetTarget.wire_byte(), 0x40);
        assert_eq!(MessageType::Reconnect.wire_byte(), 0x50);
    }
}
