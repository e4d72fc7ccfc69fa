//! Structural validation of transactions.
//!
//! Every transaction entering the mempool, and every transaction of a peer
//! block that this node has not seen before, must pass
//! [`validate_structure`]. The checks run cheapest first, so an oversized
//! or tampered transaction never costs a signature verification.
//!
//! Nothing here consults ledger state. Whether the debited accounts can
//! actually pay, and whether the nonces line up, is the ledger's call.

use std::collections::HashSet;

use chrono::Utc;
use thiserror::Error;

use super::builder::{Transaction, TxCodecError};
use super::signing::{SignatureBundle, SignatureEntry};
use super::types::{Address, AssetId, LockKind, TxHash};
use crate::config::ChainConfig;
use crate::crypto::verify_signature;
use crate::registry::TxRegister;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Why a transaction is structurally unacceptable.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("transaction type {tx_type} is not registered")]
    UnregisteredType { tx_type: u16 },

    #[error("hash mismatch: stored {stored}, computed {computed}")]
    HashMismatch { stored: TxHash, computed: TxHash },

    #[error(transparent)]
    Codec(#[from] TxCodecError),

    #[error("transaction is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },

    #[error("timestamp {time} is more than {max_secs}s ahead of {now}")]
    TimestampTooFarInFuture { time: u64, now: u64, max_secs: u64 },

    #[error("transaction type {tx_type} requires coin data")]
    MissingCoinData { tx_type: u16 },

    #[error("coin from chain {chain_id} on a single-chain transaction type")]
    ForeignFromChain { chain_id: u16 },

    #[error("duplicate coin from ({address}, {asset})")]
    DuplicateFrom { address: Address, asset: AssetId },

    #[error("contract address {address} cannot originate a user transaction")]
    ContractFrom { address: Address },

    #[error("amount {amount} exceeds the per-leg ceiling")]
    AmountTooLarge { amount: u128 },

    #[error("address {address} is locked")]
    LockedAddress { address: Address },

    #[error("transaction type {tx_type} cannot unlock funds")]
    UnlockNotAllowed { tx_type: u16 },

    #[error("coin to chain {chain_id} on a single-chain transaction type")]
    ForeignToChain { chain_id: u16 },

    #[error("zero-amount coin to {address}")]
    ZeroAmount { address: Address },

    #[error("duplicate coin to ({address}, {asset}, lock {lock_time})")]
    DuplicateTo {
        address: Address,
        asset: AssetId,
        lock_time: u64,
    },

    #[error("contract address {address} does not accept transaction type {tx_type}")]
    ContractRejectsType { address: Address, tx_type: u16 },

    #[error("declared fee {declared} is below the required {required}")]
    InsufficientFee { declared: u128, required: u128 },

    #[error("transaction is unsigned")]
    MissingSignature,

    #[error("signature by {public_key} does not verify")]
    InvalidSignature { public_key: String },

    #[error("no signer controls debited address {address}")]
    UnsignedFrom { address: Address },

    #[error("malformed multisig bundle: {reason}")]
    MalformedMultisig { reason: String },

    #[error("multisig keys do not derive debited address {address}")]
    MultisigAddressMismatch { address: Address },

    #[error("{signers} valid multisig signers, threshold is {threshold}")]
    MultisigBelowThreshold { signers: usize, threshold: u8 },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `tx` against its registered capabilities at `height`.
///
/// The checks, in order:
///
/// 1. **Hash**: the stored hash equals the recomputed one.
/// 2. **Size**: wire size within `max_tx_size`.
/// 3. **Timestamp**: not more than `max_future_time_secs` ahead.
/// 4. **CoinData presence**: required unless the type opts out.
/// 5. **CoinFrom rules**: originating chain, duplicates, contract origin,
///    amount ceiling, locked addresses, unlock permission.
/// 6. **CoinTo rules**: destination chain, zero amounts (height-gated),
///    duplicates, contract acceptance.
/// 7. **Fee**: declared main-asset fee covers the size-based minimum.
/// 8. **Signature**: ordinary or multisig, whichever the bundle carries.
pub fn validate_structure(
    tx: &Transaction,
    register: &TxRegister,
    config: &ChainConfig,
    height: u64,
) -> Result<(), ValidationError> {
    // 1. Hash integrity.
    let computed = tx.compute_hash();
    if computed != tx.hash() {
        return Err(ValidationError::HashMismatch {
            stored: tx.hash(),
            computed,
        });
    }

    // 2. Size ceiling.
    let size = tx.size()?;
    if size > config.max_tx_size {
        return Err(ValidationError::TooLarge {
            size,
            max: config.max_tx_size,
        });
    }

    // 3. Timestamp.
    let now = Utc::now().timestamp().max(0) as u64;
    if tx.time > now.saturating_add(config.max_future_time_secs) {
        return Err(ValidationError::TimestampTooFarInFuture {
            time: tx.time,
            now,
            max_secs: config.max_future_time_secs,
        });
    }

    // 4. CoinData presence.
    if register.coin_data_required && tx.coin_data.is_empty() {
        return Err(ValidationError::MissingCoinData {
            tx_type: tx.tx_type,
        });
    }

    check_coin_from(tx, register, config)?;
    check_coin_to(tx, register, config, height)?;

    // 7. Fee.
    if register.verify_fee {
        let required = required_fee(size, config.fee_unit_per_kb);
        let declared = tx.coin_data.fee_in(config.main_asset);
        if declared < required {
            return Err(ValidationError::InsufficientFee { declared, required });
        }
    }

    // 8. Signature.
    if register.verify_signature {
        match &tx.signature {
            None => return Err(ValidationError::MissingSignature),
            Some(SignatureBundle::Single(entries)) => check_single(tx, entries)?,
            Some(SignatureBundle::Multi {
                threshold,
                public_keys,
                signatures,
            }) => check_multisig(tx, *threshold, public_keys, signatures)?,
        }
    }

    Ok(())
}

/// Minimum fee for a transaction of `size` bytes: one unit per started KiB.
pub fn required_fee(size: usize, unit_per_kb: u128) -> u128 {
    let kib = (size as u128 + 1023) / 1024;
    kib.saturating_mul(unit_per_kb)
}

fn check_coin_from(
    tx: &Transaction,
    register: &TxRegister,
    config: &ChainConfig,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(tx.coin_data.from.len());
    for from in &tx.coin_data.from {
        if !register.cross_chain && from.address.chain_id != config.chain_id {
            return Err(ValidationError::ForeignFromChain {
                chain_id: from.address.chain_id,
            });
        }
        if !seen.insert((from.address, from.asset, from.nonce)) {
            return Err(ValidationError::DuplicateFrom {
                address: from.address,
                asset: from.asset,
            });
        }
        if from.address.is_contract() && !register.system_tx {
            return Err(ValidationError::ContractFrom {
                address: from.address,
            });
        }
        if from.amount > config.max_coin_amount {
            return Err(ValidationError::AmountTooLarge {
                amount: from.amount,
            });
        }
        if config.is_locked(&from.address) {
            return Err(ValidationError::LockedAddress {
                address: from.address,
            });
        }
        if from.lock == LockKind::Unlock && !register.unlock_tx {
            return Err(ValidationError::UnlockNotAllowed {
                tx_type: tx.tx_type,
            });
        }
    }
    Ok(())
}

fn check_coin_to(
    tx: &Transaction,
    register: &TxRegister,
    config: &ChainConfig,
    height: u64,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(tx.coin_data.to.len());
    for to in &tx.coin_data.to {
        if !register.cross_chain && to.address.chain_id != config.chain_id {
            return Err(ValidationError::ForeignToChain {
                chain_id: to.address.chain_id,
            });
        }
        if to.amount == 0 && height >= config.zero_amount_forbidden_height {
            return Err(ValidationError::ZeroAmount {
                address: to.address,
            });
        }
        if to.amount > config.max_coin_amount {
            return Err(ValidationError::AmountTooLarge { amount: to.amount });
        }
        if !seen.insert((to.address, to.asset, to.lock_time)) {
            return Err(ValidationError::DuplicateTo {
                address: to.address,
                asset: to.asset,
                lock_time: to.lock_time,
            });
        }
        if to.address.is_contract() && !config.contract_accepted_types.contains(&tx.tx_type) {
            return Err(ValidationError::ContractRejectsType {
                address: to.address,
                tx_type: tx.tx_type,
            });
        }
    }
    Ok(())
}

fn check_entries(tx: &Transaction, entries: &[SignatureEntry]) -> Result<(), ValidationError> {
    if entries.is_empty() {
        return Err(ValidationError::MissingSignature);
    }
    let message = tx.hash();
    for entry in entries {
        if !verify_signature(&entry.public_key, message.as_bytes(), &entry.signature) {
            return Err(ValidationError::InvalidSignature {
                public_key: hex::encode(entry.public_key),
            });
        }
    }
    Ok(())
}

/// Every signature must verify, and every debited address must be derived
/// from one of the signing keys.
fn check_single(tx: &Transaction, entries: &[SignatureEntry]) -> Result<(), ValidationError> {
    check_entries(tx, entries)?;
    for from in &tx.coin_data.from {
        let signed = entries
            .iter()
            .any(|e| Address::from_public_key(from.address.chain_id, &e.public_key) == from.address);
        if !signed {
            return Err(ValidationError::UnsignedFrom {
                address: from.address,
            });
        }
    }
    Ok(())
}

fn check_multisig(
    tx: &Transaction,
    threshold: u8,
    public_keys: &[[u8; 32]],
    signatures: &[SignatureEntry],
) -> Result<(), ValidationError> {
    if threshold == 0 || threshold as usize > public_keys.len() {
        return Err(ValidationError::MalformedMultisig {
            reason: format!("threshold {} of {} keys", threshold, public_keys.len()),
        });
    }
    let members: HashSet<&[u8; 32]> = public_keys.iter().collect();
    if members.len() != public_keys.len() {
        return Err(ValidationError::MalformedMultisig {
            reason: "duplicate member key".to_string(),
        });
    }

    for from in &tx.coin_data.from {
        if Address::multisig(from.address.chain_id, threshold, public_keys) != from.address {
            return Err(ValidationError::MultisigAddressMismatch {
                address: from.address,
            });
        }
    }

    check_entries(tx, signatures)?;
    let signers: HashSet<&[u8; 32]> = signatures
        .iter()
        .map(|e| &e.public_key)
        .filter(|k| members.contains(k))
        .collect();
    if signers.len() < threshold as usize {
        return Err(ValidationError::MultisigBelowThreshold {
            signers: signers.len(),
            threshold,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
