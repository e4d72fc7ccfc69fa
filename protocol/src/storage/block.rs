//! # Block Header
//!
//! The part of a block the pipeline cares about. The packager produces the
//! transaction list and state root that go into one; the verifier checks a
//! peer's block against one.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  BlockHeader                                │
//! │  ├── height: u64                            │
//! │  ├── hash: [u8; 32]       (BLAKE3 of header)│
//! │  ├── parent_hash: [u8; 32]                  │
//! │  ├── time: u64            (Unix seconds)    │
//! │  ├── packer: String                         │
//! │  ├── state_root: Option<[u8; 32]>           │
//! │  └── tx_root: [u8; 32]   (Merkle root)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! `state_root` is `None` for blocks in which no module executed side
//! effects. The hash covers every other field, state root included.

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{blake3_hash_multi, merkle_root};
use crate::transaction::types::TxHash;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub hash: [u8; 32],
    /// All zeros for genesis.
    pub parent_hash: [u8; 32],
    /// Unix seconds.
    pub time: u64,
    /// Identifier of the node that packaged the block.
    pub packer: String,
    pub state_root: Option<[u8; 32]>,
    pub tx_root: [u8; 32],
}

impl BlockHeader {
    /// Build a header over `tx_hashes` and compute its hash.
    pub fn new(
        height: u64,
        parent_hash: [u8; 32],
        time: u64,
        packer: String,
        state_root: Option<[u8; 32]>,
        tx_hashes: &[TxHash],
    ) -> Self {
        let mut header = Self {
            height,
            hash: [0u8; 32],
            parent_hash,
            time,
            packer,
            state_root,
            tx_root: tx_root(tx_hashes),
        };
        header.hash = header.compute_hash();
        header
    }

    /// BLAKE3 over `height || parent_hash || time || packer || state_root
    /// || tx_root`. An absent state root hashes as a single zero byte.
    pub fn compute_hash(&self) -> [u8; 32] {
        let height = self.height.to_le_bytes();
        let time = self.time.to_le_bytes();
        let root_tag: &[u8] = match &self.state_root {
            Some(root) => root,
            None => &[0u8],
        };
        blake3_hash_multi(&[
            &height,
            &self.parent_hash,
            &time,
            self.packer.as_bytes(),
            root_tag,
            &self.tx_root,
        ])
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Whether the stored hash and tx root match `tx_hashes`.
    pub fn matches(&self, tx_hashes: &[TxHash]) -> bool {
        self.hash == self.compute_hash() && self.tx_root == tx_root(tx_hashes)
    }
}

/// Merkle root over transaction hashes, in block order.
pub fn tx_root(tx_hashes: &[TxHash]) -> [u8; 32] {
    let leaves: Vec<[u8; 32]> = tx_hashes.iter().map(|h| h.0).collect();
    merkle_root(&leaves)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes() -> Vec<TxHash> {
        vec![TxHash([1u8; 32]), TxHash([2u8; 32])]
    }

    #[test]
    fn test_header_hash_is_deterministic() {
        let a = BlockHeader::new(5, [9u8; 32], 100, "p".into(), None, &hashes());
        let b = BlockHeader::new(5, [9u8; 32], 100, "p".into(), None, &hashes());
        assert_eq!(a.hash, b.hash);
        assert!(a.matches(&hashes()));
    }

    #[test]
    fn test_state_root_is_covered() {
        let none = BlockHeader::new(5, [9u8; 32], 100, "p".into(), None, &hashes());
        let some = BlockHeader::new(5, [9u8; 32], 100, "p".into(), Some([0u8; 32]), &hashes());
        assert_ne!(none.hash, some.hash);
    }

    #[test]
    fn test_tampered_header_does_not_match() {
        let mut header = BlockHeader::new(5, [9u8; 32], 100, "p".into(), None, &hashes());
        header.time += 1;
        assert!(!header.matches(&hashes()));

        let header = BlockHeader::new(5, [9u8; 32], 100, "p".into(), None, &hashes());
        let mut reordered = hashes();
        reordered.reverse();
        assert!(!header.matches(&reordered));
    }
}
