//! Transaction construction via the builder pattern.
//!
//! The [`TransactionBuilder`] collects the fields, and `.build()` hands back
//! an unsigned [`Transaction`] whose hash is fixed from that point on.
//! Signing happens in [`super::signing`]; since the signature bundle is
//! excluded from the hash, signing never changes it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::signing::SignatureBundle;
use super::types::{CoinData, CoinFrom, CoinTo, TxHash};
use crate::crypto::double_sha256;

/// Wire encoding failures.
#[derive(Debug, Error)]
pub enum TxCodecError {
    #[error("transaction encoding failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("transaction decoding failed: {0}")]
    Decode(#[source] bincode::Error),
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A Kiln transaction.
///
/// The hash is `double_sha256(signable_bytes)` and is computed once, by the
/// builder. It lives in a private field: fields can still be mutated after
/// construction (tests do it on purpose), but the stored hash never follows,
/// so tampering shows up as a hash mismatch during structural validation.
///
/// # Canonical Byte Format
///
/// [`Transaction::signable_bytes`] serializes, in order: type, time, remark,
/// tx data, every coinFrom, every coinTo. Variable-length fields are
/// length-prefixed, integers are fixed-width little-endian. The signature
/// bundle is excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    hash: TxHash,

    /// Type tag, resolved against the registry at validation time.
    pub tx_type: u16,

    /// Creation time, Unix seconds.
    pub time: u64,

    /// Free-form memo. Counts towards size and fee like everything else.
    pub remark: Vec<u8>,

    /// Module-specific payload (contract call arguments, cross-chain proofs,
    /// punish evidence, ...). Opaque to this crate.
    pub tx_data: Vec<u8>,

    pub coin_data: CoinData,

    /// `None` until signed. System transactions stay unsigned.
    pub signature: Option<SignatureBundle>,
}

impl Transaction {
    /// The hash fixed at construction time.
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Canonical bytes covered by the hash.
    pub fn signable_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128 + self.remark.len() + self.tx_data.len());

        buf.extend_from_slice(&self.tx_type.to_le_bytes());
        buf.extend_from_slice(&self.time.to_le_bytes());

        buf.extend_from_slice(&(self.remark.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.remark);
        buf.extend_from_slice(&(self.tx_data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.tx_data);

        buf.extend_from_slice(&(self.coin_data.from.len() as u16).to_le_bytes());
        for from in &self.coin_data.from {
            buf.extend_from_slice(&from.address.to_bytes());
            buf.extend_from_slice(&from.asset.chain_id.to_le_bytes());
            buf.extend_from_slice(&from.asset.asset_id.to_le_bytes());
            buf.extend_from_slice(&from.amount.to_le_bytes());
            buf.extend_from_slice(&from.nonce.0);
            buf.push(match from.lock {
                super::types::LockKind::Ordinary => 0,
                super::types::LockKind::Unlock => 1,
            });
        }

        buf.extend_from_slice(&(self.coin_data.to.len() as u16).to_le_bytes());
        for to in &self.coin_data.to {
            buf.extend_from_slice(&to.address.to_bytes());
            buf.extend_from_slice(&to.asset.chain_id.to_le_bytes());
            buf.extend_from_slice(&to.asset.asset_id.to_le_bytes());
            buf.extend_from_slice(&to.amount.to_le_bytes());
            buf.extend_from_slice(&to.lock_time.to_le_bytes());
        }

        buf
    }

    /// Recompute the hash from the current field values.
    pub fn compute_hash(&self) -> TxHash {
        TxHash(double_sha256(&self.signable_bytes()))
    }

    /// Encode to the wire form (bincode, hash included).
    pub fn to_wire(&self) -> Result<Vec<u8>, TxCodecError> {
        bincode::serialize(self).map_err(TxCodecError::Encode)
    }

    /// Decode a wire form. The embedded hash is taken as-is; structural
    /// validation is what checks it.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, TxCodecError> {
        bincode::deserialize(bytes).map_err(TxCodecError::Decode)
    }

    /// Serialized size in bytes, i.e. the length of [`to_wire`](Self::to_wire).
    pub fn size(&self) -> Result<usize, TxCodecError> {
        bincode::serialized_size(self)
            .map(|n| n as usize)
            .map_err(TxCodecError::Encode)
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}

// ---------------------------------------------------------------------------
// TransactionBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for unsigned [`Transaction`]s.
///
/// ```rust
/// use kiln_protocol::transaction::{TransactionBuilder, tx_types};
///
/// let tx = TransactionBuilder::new(tx_types::TRANSFER)
///     .time(1_700_000_000)
///     .remark(b"rent".to_vec())
///     .build();
/// assert_eq!(tx.hash(), tx.compute_hash());
/// ```
///
/// `time` defaults to the current UTC time in seconds.
pub struct TransactionBuilder {
    tx_type: u16,
    time: Option<u64>,
    remark: Vec<u8>,
    tx_data: Vec<u8>,
    coin_data: CoinData,
}

impl TransactionBuilder {
    pub fn new(tx_type: u16) -> Self {
        Self {
            tx_type,
            time: None,
            remark: Vec::new(),
            tx_data: Vec::new(),
            coin_data: CoinData::default(),
        }
    }

    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn remark(mut self, remark: Vec<u8>) -> Self {
        self.remark = remark;
        self
    }

    pub fn tx_data(mut self, tx_data: Vec<u8>) -> Self {
        self.tx_data = tx_data;
        self
    }

    /// Append a debit leg.
    pub fn from(mut self, from: CoinFrom) -> Self {
        self.coin_data.from.push(from);
        self
    }

    /// Append a credit leg.
    pub fn to(mut self, to: CoinTo) -> Self {
        self.coin_data.to.push(to);
        self
    }

    pub fn coin_data(mut self, coin_data: CoinData) -> Self {
        self.coin_data = coin_data;
        self
    }

    /// Fix the fields and compute the hash.
    pub fn build(self) -> Transaction {
        let time = self
            .time
            .unwrap_or_else(|| Utc::now().timestamp().max(0) as u64);
        let mut tx = Transaction {
            hash: TxHash([0u8; 32]),
            tx_type: self.tx_type,
            time,
            remark: self.remark,
            tx_data: self.tx_data,
            coin_data: self.coin_data,
            signature: None,
        };
        tx.hash = tx.compute_hash();
        tx
    }
}
