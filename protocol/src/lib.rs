// Copyright (c) 2026 Kiln Contributors. MIT License.
// See LICENSE for details.

//! # Kiln Protocol: Transaction Pipeline
//!
//! Everything between "a transaction arrived" and "here is the transaction
//! list of the next block": intake validation, the mempool, deadline-bound
//! block packaging and trust-nothing verification of peer blocks.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 keys and signatures, SHA-256 and BLAKE3 hashing.
//! - **transaction**: The transaction model, builder, signing and
//!   structural validation.
//! - **registry**: Runtime table of transaction types and the hooks of the
//!   modules that own them.
//! - **ledger**: The balance and nonce collaborator, with an in-memory
//!   implementation.
//! - **storage**: Transaction stores (memory and sled) and block headers.
//! - **network**: Chain context, mempool, intake, packager, verifier.
//! - **config**: Protocol constants and per-chain configuration.
//!
//! ## Flow
//!
//! ```text
//! TxService::submit → validate_structure → Ledger::commit_unconfirmed
//!   → unconfirmed store → Mempool
//! BlockPackager::package_basic → ledger batches ⇄ module hooks → PackedBlock
//! BlockVerifier::verify_block_transactions → same checks, all or nothing
//! ```
//!
//! Each chain gets its own [`network::ChainContext`]; nothing here is
//! process-global.

pub mod config;
pub mod crypto;
pub mod ledger;
pub mod network;
pub mod registry;
pub mod storage;
pub mod transaction;
