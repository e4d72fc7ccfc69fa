//! # Hashing Utilities
//!
//! The two hash functions Kiln uses, and the one Merkle construction built
//! on top of them:
//!
//! - **SHA-256** (doubled) for transaction hashes. Transaction hashes leak
//!   into nonces, RPC payloads and other chains' bridge contracts, so they
//!   stay on the hash everybody already speaks.
//! - **BLAKE3** for everything that never leaves a Kiln node: block header
//!   hashes, tx Merkle roots, state-root accumulators, address digests.

use sha2::{Digest, Sha256};

/// Compute the SHA-256 hash of the input data as a fixed-size array.
///
/// # Example
///
/// ```
/// use kiln_protocol::crypto::sha256;
///
/// let hash = sha256(b"kiln");
/// assert_eq!(hash.len(), 32);
/// ```
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute `SHA-256(SHA-256(data))`.
///
/// This is the transaction hash construction. The double pass shuts the
/// door on length extension, which matters here because a transaction hash
/// is also the seed of the next nonce for every account it spends from.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hash several byte slices as if they were concatenated, without
/// allocating the concatenation.
pub fn blake3_hash_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// Compute a binary Merkle root over a list of leaf hashes using BLAKE3.
///
/// Odd levels duplicate their last node. An empty leaf set yields the
/// all-zero root; a single leaf is paired with itself so the root is always
/// the output of a hash and never a raw leaf.
///
/// Duplicated-leaf ambiguity (CVE-2012-2459) cannot bite here because a
/// block never carries the same transaction hash twice: the verifier
/// rejects that long before anybody looks at the root.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    if leaves.len() == 1 {
        return blake3_hash_multi(&[leaves[0].as_slice(), leaves[0].as_slice()]);
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                blake3_hash_multi(&[pair[0].as_slice(), right.as_slice()])
            })
            .collect();
    }
    level[0]
}
