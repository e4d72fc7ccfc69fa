//! # Transaction Module
//!
//! Construction, signing and structural validation of Kiln transactions.
//!
//! ```text
//! types.rs        - hashes, nonces, addresses, assets, coin data, type codes
//! builder.rs      - Transaction, its canonical bytes and wire form, the builder
//! signing.rs      - single and multisig signature bundles
//! verification.rs - validate_structure and its error type
//! ```
//!
//! ## Lifecycle
//!
//! 1. **Build** with [`TransactionBuilder`]. The hash is fixed here.
//! 2. **Sign** with [`sign_transaction`] or [`sign_multisig`]. Signatures
//!    cover the hash and are not part of it.
//! 3. **Validate** with [`validate_structure`] before the transaction may
//!    enter the mempool or a block.
//!
//! Amounts are `u128` in the smallest denomination.

pub mod builder;
pub mod signing;
pub mod types;
pub mod verification;

pub use builder::{Transaction, TransactionBuilder, TxCodecError};
pub use signing::{sign_multisig, sign_transaction, SignatureBundle, SignatureEntry};
pub use types::{
    tx_types, Address, AddressKind, AssetId, CoinData, CoinFrom, CoinTo, LockKind, Nonce, TxHash,
};
pub use verification::{required_fee, validate_structure, ValidationError};
