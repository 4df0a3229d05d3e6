//! Job builder (spec §4.4): `BlockTemplate` → `MiningJob`.
//!
//! Grounded on the coinbase/job-id construction inline in
//! `stratum/server_v2.rs` (`job_id_from_template`, `base_job_id`,
//! `cache_template`) — the *how* (build once under a write lock, atomic
//! swap) is kept; the *what* is replaced wholesale with the Bitcoin-style
//! prefix/extranonce1/extranonce2/suffix coinbase split spec §4.4 defines.

use crate::jobs::merkle::merkle_branch;
use crate::jobs::template::BlockTemplate;
use std::sync::atomic::{AtomicU64, Ordering};

static JOB_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct MiningJob {
    pub job_id: String,
    /// Previous block hash, byte-reversed to the wire convention miners
    /// expect (spec §4.4).
    pub prev_hash_le: [u8; 32],
    pub coinbase_prefix: Vec<u8>,
    pub coinbase_suffix: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: i32,
    pub bits: String,
    pub time: u32,
    pub height: u64,
    pub target: String,
}

fn next_job_id() -> String {
    let n = JOB_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{n:x}")
}

/// BIP34-style minimal script push of the block height.
fn encode_height_push(height: u64) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    let mut bytes = Vec::new();
    let mut h = height;
    while h > 0 {
        bytes.push((h & 0xff) as u8);
        h >>= 8;
    }
    if bytes.last().copied().unwrap_or(0) & 0x80 != 0 {
        bytes.push(0x00);
    }
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(bytes.len() as u8);
    out.extend_from_slice(&bytes);
    out
}

fn varint(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffff_ffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

fn reverse_hex_to_bytes(hex_str: &str) -> [u8; 32] {
    let mut bytes = hex::decode(hex_str).unwrap_or_else(|_| vec![0u8; 32]);
    bytes.resize(32, 0);
    bytes.reverse();
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[..32]);
    out
}

const POOL_TAG: &[u8] = b"/stratum-pool-core/";
const EXTRANONCE1_LEN: usize = 4;
const EXTRANONCE2_LEN: usize = 4;

pub struct CoinbaseParts {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
}

/// Build the coinbase prefix/suffix split around the extranonce slot, for
/// a pool paying the full block subsidy to `payout_script_pubkey`.
fn build_coinbase(template: &BlockTemplate, payout_script_pubkey: &[u8]) -> CoinbaseParts {
    let height_push = encode_height_push(template.height);
    let script_sig_len = height_push.len() + POOL_TAG.len() + EXTRANONCE1_LEN + EXTRANONCE2_LEN;

    let mut prefix = Vec::new();
    prefix.extend_from_slice(&1i32.to_le_bytes()); // version
    prefix.push(0x01); // input count
    prefix.extend_from_slice(&[0u8; 32]); // null prev-out hash
    prefix.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // prev-out index
    prefix.extend_from_slice(&varint(script_sig_len as u64));
    prefix.extend_from_slice(&height_push);
    prefix.extend_from_slice(POOL_TAG);

    let mut suffix = Vec::new();
    suffix.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
    suffix.push(0x01); // output count
    suffix.extend_from_slice(&template.coinbase_value.to_le_bytes());
    suffix.extend_from_slice(&varint(payout_script_pubkey.len() as u64));
    suffix.extend_from_slice(payout_script_pubkey);
    suffix.extend_from_slice(&0u32.to_le_bytes()); // locktime

    CoinbaseParts { prefix, suffix }
}

pub fn build_job(template: &BlockTemplate, payout_script_pubkey: &[u8]) -> MiningJob {
    let parts = build_coinbase(template, payout_script_pubkey);

    let txids: Vec<[u8; 32]> = template
        .transactions
        .iter()
        .map(|hex_txid| reverse_hex_to_bytes(hex_txid))
        .collect();

    MiningJob {
        job_id: next_job_id(),
        prev_hash_le: reverse_hex_to_bytes(&template.previous_block_hash),
        coinbase_prefix: parts.prefix,
        coinbase_suffix: parts.suffix,
        merkle_branch: merkle_branch(&txids),
        version: template.version,
        bits: template.bits.clone(),
        time: template.curtime,
        height: template.height,
        target: template.target.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> BlockTemplate {
        BlockTemplate {
            height: 840_000,
            previous_block_hash: "00".repeat(32),
            coinbase_value: 312_500_000,
            target: "0".repeat(64),
            bits: "1d00ffff".to_string(),
            version: 536_870_912,
            curtime: 1_703_001_600,
            transactions: vec!["11".repeat(32)],
        }
    }

    #[test]
    fn coinbase_parts_reassemble_to_expected_length() {
        let tmpl = sample_template();
        let script = vec![0x76, 0xa9, 0x14];
        let job = build_job(&tmpl, &script);
        let extranonce1 = [0u8; EXTRANONCE1_LEN];
        let extranonce2 = [0u8; EXTRANONCE2_LEN];

        let mut assembled = Vec::new();
        assembled.extend_from_slice(&job.coinbase_prefix);
        assembled.extend_from_slice(&extranonce1);
        assembled.extend_from_slice(&extranonce2);
        assembled.extend_from_slice(&job.coinbase_suffix);

        let expected_len = job.coinbase_prefix.len() + EXTRANONCE1_LEN + EXTRANONCE2_LEN + job.coinbase_suffix.len();
        assert_eq!(assembled.len(), expected_len);
    }

    #[test]
    fn single_transaction_produces_branch_of_length_one() {
        let tmpl = sample_template();
        let job = build_job(&tmpl, &[]);
        assert_eq!(job.merkle_branch.len(), 1);
    }

    #[test]
    fn job_ids_are_unique_across_calls() {
        let tmpl = sample_template();
        let a = build_job(&tmpl, &[]);
        let b = build_job(&tmpl, &[]);
        assert_ne!(a.job_id, b.job_id);
    }

    #[test]
    fn height_push_minimal_encoding_has_no_high_bit_overflow() {
        let push = encode_height_push(840_000);
        let len = push[0] as usize;
        assert_eq!(push.len(), len + 1);
    }
}
