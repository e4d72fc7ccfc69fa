//! # Cryptographic Primitives
//!
//! Thin, typed wrappers around audited implementations: Ed25519 for
//! signatures, double SHA-256 for transaction hashes, BLAKE3 for
//! everything node-internal. Nothing clever lives here, and nothing clever
//! should.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, blake3_hash_multi, double_sha256, merkle_root, sha256};
pub use keys::{verify_signature, KeyError, KilnKeypair};
