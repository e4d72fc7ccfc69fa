//! Transaction signing with Ed25519 keypairs.
//!
//! Signers sign the 32 hash bytes, never the full payload: the hash already
//! commits to everything but the signature bundle, and it keeps hardware
//! signers from having to stream large contract payloads.
//!
//! Two bundle shapes exist. A [`SignatureBundle::Single`] carries one entry
//! per distinct signer, and every debited address must be derivable from
//! one of those keys. A [`SignatureBundle::Multi`] carries the full member
//! key set and threshold of an m-of-n account, so the verifier can rebuild
//! the multisig address, plus at least `threshold` member signatures.

use serde::{Deserialize, Serialize};

use super::builder::Transaction;
use crate::crypto::KilnKeypair;

/// One signer's public key and signature over the transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub public_key: [u8; 32],
    pub signature: Vec<u8>,
}

/// The signature bundle attached to a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureBundle {
    Single(Vec<SignatureEntry>),
    Multi {
        threshold: u8,
        public_keys: Vec<[u8; 32]>,
        signatures: Vec<SignatureEntry>,
    },
}

impl SignatureBundle {
    /// All signature entries, whatever the bundle shape.
    pub fn entries(&self) -> &[SignatureEntry] {
        match self {
            Self::Single(entries) => entries,
            Self::Multi { signatures, .. } => signatures,
        }
    }
}

/// Add `keypair`'s signature to an ordinary (non-multisig) transaction.
///
/// Calling it again with another keypair appends a second signer, which is
/// how a transaction debiting two accounts gets signed. An existing multisig
/// bundle is replaced.
pub fn sign_transaction<'a>(tx: &'a mut Transaction, keypair: &KilnKeypair) -> &'a Transaction {
    let entry = SignatureEntry {
        public_key: keypair.public_key_bytes(),
        signature: keypair.sign(tx.hash().as_bytes()),
    };
    match tx.signature.as_mut() {
        Some(SignatureBundle::Single(entries)) => entries.push(entry),
        _ => tx.signature = Some(SignatureBundle::Single(vec![entry])),
    }
    tx
}

/// Sign a multisig transaction with a subset of the member keys.
///
/// `public_keys` is the full member set the address was derived from;
/// `signers` are whichever members are signing now.
pub fn sign_multisig<'a>(
    tx: &'a mut Transaction,
    threshold: u8,
    public_keys: Vec<[u8; 32]>,
    signers: &[&KilnKeypair],
) -> &'a Transaction {
    let message = tx.hash();
    let signatures = signers
        .iter()
        .map(|kp| SignatureEntry {
            public_key: kp.public_key_bytes(),
            signature: kp.sign(message.as_bytes()),
        })
        .collect();
    tx.signature = Some(SignatureBundle::Multi {
        threshold,
        public_keys,
        signatures,
    });
    tx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
