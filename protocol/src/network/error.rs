//! Intake error taxonomy.

use thiserror::Error;

use crate::ledger::LedgerError;
use crate::storage::StoreError;
use crate::transaction::types::TxHash;
use crate::transaction::verification::ValidationError;

/// Why a submitted transaction was not admitted.
#[derive(Debug, Error)]
pub enum TxError {
    /// The node is syncing or rolling back and takes no new transactions.
    #[error("node is not accepting transactions")]
    NotAccepting,

    #[error("malformed transaction: {0}")]
    Malformed(#[from] ValidationError),

    #[error("transaction type {tx_type} cannot be submitted externally")]
    SystemTypeNotAccepted { tx_type: u16 },

    /// Permanent: spent nonce, insufficient balance.
    #[error("ledger rejected {hash}: {reason}")]
    LedgerRejected { hash: TxHash, reason: String },

    /// Retryable once the predecessor arrives.
    #[error("ledger cannot resolve the nonce chain of {hash}")]
    LedgerOrphan { hash: TxHash },

    /// Retryable once the pool drains. Nothing of the submission is kept.
    #[error("mempool is full ({capacity} transactions), {hash} not admitted")]
    MempoolFull { hash: TxHash, capacity: usize },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Result of a submission that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Already known. Not an error; nothing was done.
    Duplicate,
}
