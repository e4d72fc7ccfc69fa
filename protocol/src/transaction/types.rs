//! Core value types for Kiln transactions.
//!
//! These form the vocabulary of every transaction: hashes, nonces,
//! addresses, assets, and the debit/credit legs that make up coinData.
//! Everything here is small and `Copy` where it can be, since the
//! validation hot path touches these types thousands of times per block.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::{blake3_hash, blake3_hash_multi};

// ---------------------------------------------------------------------------
// Transaction type codes
// ---------------------------------------------------------------------------

/// Well-known transaction type codes.
///
/// Types are plain `u16` tags rather than an enum: modules register their
/// own types at runtime through the [`Registry`](crate::registry::Registry),
/// and the core only needs to know a handful of them by name.
pub mod tx_types {
    pub const COIN_BASE: u16 = 1;
    pub const TRANSFER: u16 = 2;
    pub const ACCOUNT_ALIAS: u16 = 3;
    pub const REGISTER_AGENT: u16 = 4;
    pub const DEPOSIT: u16 = 5;
    pub const CANCEL_DEPOSIT: u16 = 6;
    pub const YELLOW_PUNISH: u16 = 7;
    pub const RED_PUNISH: u16 = 8;
    pub const STOP_AGENT: u16 = 9;
    pub const CROSS_CHAIN: u16 = 10;
    pub const CREATE_CONTRACT: u16 = 15;
    pub const CALL_CONTRACT: u16 = 16;
    pub const DELETE_CONTRACT: u16 = 17;
    pub const CONTRACT_TRANSFER: u16 = 18;
    pub const CONTRACT_RETURN_GAS: u16 = 19;
}

// ---------------------------------------------------------------------------
// TxHash
// ---------------------------------------------------------------------------

/// A 32-byte transaction hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Some(Self(bytes.try_into().ok()?))
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", &self.to_hex()[..16])
    }
}

// ---------------------------------------------------------------------------
// Nonce
// ---------------------------------------------------------------------------

/// An 8-byte spend-ordering nonce.
///
/// The nonce of a coinFrom is the tail of the hash of the previous
/// transaction that spent from the same (address, asset) pair. A fresh
/// account starts at [`Nonce::GENESIS`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Nonce(pub [u8; 8]);

impl Nonce {
    pub const GENESIS: Nonce = Nonce([0u8; 8]);

    /// The nonce a transaction hands to the next spend of the accounts it
    /// debits: the last 8 bytes of its hash.
    pub fn from_hash(hash: &TxHash) -> Self {
        let mut tail = [0u8; 8];
        tail.copy_from_slice(&hash.0[24..]);
        Nonce(tail)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", hex::encode(self.0))
    }
}

// ---------------------------------------------------------------------------
// AssetId
// ---------------------------------------------------------------------------

/// An asset, identified by its issuing chain and the asset number on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetId {
    pub chain_id: u16,
    pub asset_id: u16,
}

impl AssetId {
    pub const fn new(chain_id: u16, asset_id: u16) -> Self {
        Self { chain_id, asset_id }
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.chain_id, self.asset_id)
    }
}

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// What kind of account an address controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AddressKind {
    /// Derived from a single Ed25519 public key.
    Normal,
    /// A deployed contract. Only the contract engine can spend from it.
    Contract,
    /// An m-of-n multisig account.
    Multisig,
}

impl AddressKind {
    fn tag(self) -> u8 {
        match self {
            Self::Normal => 1,
            Self::Contract => 2,
            Self::Multisig => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Normal),
            2 => Some(Self::Contract),
            3 => Some(Self::Multisig),
            _ => None,
        }
    }
}

/// A chain-scoped account address.
///
/// Encoded as `chain_id (2, LE) || kind (1) || digest (20)` and displayed
/// as base58. Human-readable serializers (TOML, JSON) get the base58
/// string, binary ones get the 23 raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    pub chain_id: u16,
    pub kind: AddressKind,
    pub hash: [u8; 20],
}

/// Number of bytes in an encoded address.
pub const ADDRESS_LENGTH: usize = 23;

impl Address {
    pub fn new(chain_id: u16, kind: AddressKind, hash: [u8; 20]) -> Self {
        Self {
            chain_id,
            kind,
            hash,
        }
    }

    /// Derive the normal address controlled by `public_key`.
    pub fn from_public_key(chain_id: u16, public_key: &[u8; 32]) -> Self {
        Self::new(chain_id, AddressKind::Normal, truncate(blake3_hash(public_key)))
    }

    /// Derive the multisig address for an m-of-n key set.
    ///
    /// Member keys are sorted first, so the address does not depend on the
    /// order the wallet happened to list them in.
    pub fn multisig(chain_id: u16, threshold: u8, public_keys: &[[u8; 32]]) -> Self {
        let mut keys = public_keys.to_vec();
        keys.sort_unstable();
        let threshold_bytes = [threshold];
        let mut parts: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
        parts.push(&threshold_bytes);
        for key in &keys {
            parts.push(key.as_slice());
        }
        Self::new(
            chain_id,
            AddressKind::Multisig,
            truncate(blake3_hash_multi(&parts)),
        )
    }

    pub fn is_contract(&self) -> bool {
        self.kind == AddressKind::Contract
    }

    pub fn to_bytes(&self) -> [u8; ADDRESS_LENGTH] {
        let mut out = [0u8; ADDRESS_LENGTH];
        out[..2].copy_from_slice(&self.chain_id.to_le_bytes());
        out[2] = self.kind.tag();
        out[3..].copy_from_slice(&self.hash);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ADDRESS_LENGTH {
            return None;
        }
        let chain_id = u16::from_le_bytes([bytes[0], bytes[1]]);
        let kind = AddressKind::from_tag(bytes[2])?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&bytes[3..]);
        Some(Self::new(chain_id, kind, hash))
    }
}

fn truncate(digest: [u8; 32]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest[..20]);
    out
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.to_bytes()).into_string())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Error returned when parsing a base58 address fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddressParseError(pub String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressParseError(e.to_string()))?;
        Address::from_bytes(&bytes).ok_or_else(|| AddressParseError(s.to_string()))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            serializer.serialize_bytes(&self.to_bytes())
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            deserializer.deserialize_bytes(AddressBytesVisitor)
        }
    }
}

struct AddressBytesVisitor;

impl<'de> serde::de::Visitor<'de> for AddressBytesVisitor {
    type Value = Address;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ADDRESS_LENGTH} address bytes")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Address, E> {
        Address::from_bytes(v).ok_or_else(|| E::invalid_length(v.len(), &self))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Address, E> {
        self.visit_bytes(&v)
    }
}

// ---------------------------------------------------------------------------
// CoinData
// ---------------------------------------------------------------------------

/// Whether a debit leg spends ordinary funds or releases previously locked
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    Ordinary,
    Unlock,
}

/// A debit leg.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinFrom {
    pub address: Address,
    pub asset: AssetId,
    pub amount: u128,
    pub nonce: Nonce,
    pub lock: LockKind,
}

/// A credit leg. `lock_time == 0` means immediately spendable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinTo {
    pub address: Address,
    pub asset: AssetId,
    pub amount: u128,
    pub lock_time: u64,
}

/// The balance-changing payload of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinData {
    pub from: Vec<CoinFrom>,
    pub to: Vec<CoinTo>,
}

impl CoinData {
    pub fn is_empty(&self) -> bool {
        self.from.is_empty() && self.to.is_empty()
    }

    /// Sum of debits minus sum of credits in `asset`, i.e. what the
    /// transaction leaves behind as fee. Negative balances clamp to zero.
    pub fn fee_in(&self, asset: AssetId) -> u128 {
        let spent: u128 = self
            .from
            .iter()
            .filter(|f| f.asset == asset)
            .fold(0u128, |acc, f| acc.saturating_add(f.amount));
        let received: u128 = self
            .to
            .iter()
            .filter(|t| t.asset == asset)
            .fold(0u128, |acc, t| acc.saturating_add(t.amount));
        spent.saturating_sub(received)
    }
}
