//! Merkle branch construction for the coinbase slot (spec §4.4, testable
//! property 4). No teacher module implements this; built fresh using the
//! same double-SHA256 pairing convention `sha2` is used for elsewhere in
//! the retrieval pack's Bitcoin-family repos.

use sha2::{Digest, Sha256};

/// Double SHA-256, the standard Bitcoin transaction-hashing primitive.
fn hash256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Given the non-coinbase transaction IDs of a block template (in
/// natural, RPC byte order), compute the Merkle branch the coinbase slot
/// needs: the sibling hash at each level on the path from the coinbase
/// leaf (always index 0) to the root.
///
/// Transaction IDs are treated as big-endian-displayed / little-endian
/// wire values per Bitcoin convention: callers pass the already
/// byte-reversed (wire-order) 32-byte hashes.
pub fn merkle_branch(txids_wire_order: &[[u8; 32]]) -> Vec<[u8; 32]> {
    if txids_wire_order.is_empty() {
        return Vec::new();
    }

    // Level 0 includes a placeholder for the coinbase (index 0); since we
    // only need the *branch*, not the root, we track siblings without
    // needing the actual coinbase hash value.
    let mut level: Vec<[u8; 32]> = txids_wire_order.to_vec();
    let mut branch = Vec::new();

    // Index of the coinbase within the current level; starts at 0 and
    // the coinbase isn't in `level` (level holds only non-coinbase txs),
    // so we track it as a virtual index 0 among [coinbase, level...].
    let mut coinbase_index: usize = 0;
    // Full level including a virtual coinbase slot.
    let mut full_level: Vec<Option<[u8; 32]>> = std::iter::once(None).chain(level.drain(..).map(Some)).collect();

    while full_level.len() > 1 {
        if full_level.len() % 2 == 1 {
            full_level.push(full_level.last().copied().unwrap());
        }

        let sibling_index = if coinbase_index % 2 == 0 {
            coinbase_index + 1
        } else {
            coinbase_index - 1
        };
        if let Some(sibling) = full_level[sibling_index] {
            branch.push(sibling);
        }

        let mut next_level = Vec::with_capacity(full_level.len() / 2);
        for pair in full_level.chunks(2) {
            let (a, b) = (pair[0], pair[1]);
            let combined = match (a, b) {
                (None, None) => None,
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (Some(a), Some(b)) => {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(&a);
                    buf[32..].copy_from_slice(&b);
                    Some(hash256(&buf))
                }
            };
            next_level.push(combined);
        }

        coinbase_index /= 2;
        full_level = next_level;
    }

    let _ = level; // consumed above
    branch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn empty_transaction_list_yields_empty_branch() {
        assert!(merkle_branch(&[]).is_empty());
    }

    #[test]
    fn single_transaction_branch_has_length_one() {
        let txids = vec![h(1)];
        let branch = merkle_branch(&txids);
        assert_eq!(branch.len(), 1);
        assert_eq!(branch[0], h(1));
    }

    #[test]
    fn branch_length_matches_ceil_log2_plus_one() {
        for n in 1..=16usize {
            let txids: Vec<[u8; 32]> = (0..n as u8).map(h).collect();
            let branch = merkle_branch(&txids);
            let expected_len = (((n + 1) as f64).log2()).ceil() as usize;
            assert_eq!(branch.len(), expected_len, "n={n}");
        }
    }

    #[test]
    fn odd_count_promotes_lone_hash() {
        let txids = vec![h(1), h(2), h(3)];
        let branch = merkle_branch(&txids);
        // ceil(log2(4)) == 2
        assert_eq!(branch.len(), 2);
    }
}
