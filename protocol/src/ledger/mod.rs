//! # Ledger Collaborator
//!
//! The ledger owns balances and nonces. The pipeline never touches either
//! directly; it asks the ledger three kinds of question:
//!
//! - **Intake**: can this transaction be applied on top of everything
//!   already admitted? ([`Ledger::commit_unconfirmed`])
//! - **Packaging and block verification**: replayed in this order from the
//!   confirmed state, which transactions pass, fail, or dangle on a missing
//!   predecessor? ([`Ledger::verify_coin_data_batch`], inside a session
//!   opened by [`Ledger::begin_batch_session`])
//! - **Housekeeping**: undo an admitted transaction
//!   ([`Ledger::rollback`]), apply a confirmed block
//!   ([`Ledger::commit_confirmed`]), and hand wallets the next nonce.
//!
//! [`MemoryLedger`] is the in-process implementation used by the node and
//! the test suites.

pub mod memory;

pub use memory::MemoryLedger;

use thiserror::Error;

use crate::transaction::builder::{Transaction, TxCodecError};
use crate::transaction::types::{Address, AssetId, Nonce, TxHash};

/// Ledger faults. A transaction the ledger refuses is not an error; it is
/// a [`CommitOutcome::Fail`] or a hash in [`BatchVerdict::fail`].
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger could not decode a batch entry: {0}")]
    Decode(#[from] TxCodecError),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Result of admitting one transaction on top of the unconfirmed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Success,
    /// A referenced nonce is unknown; may succeed once the predecessor
    /// arrives.
    Orphan,
    /// Permanently invalid: spent nonce, insufficient balance.
    Fail(String),
}

/// Result of a batch verification. Hashes not listed passed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchVerdict {
    pub fail: Vec<TxHash>,
    pub orphan: Vec<TxHash>,
}

impl BatchVerdict {
    /// Everything passed.
    pub fn is_clean(&self) -> bool {
        self.fail.is_empty() && self.orphan.is_empty()
    }
}

/// The ledger as seen from the pipeline. Calls are synchronous.
pub trait Ledger: Send + Sync {
    /// Start a fresh batch session from confirmed state, discarding any
    /// previous one.
    fn begin_batch_session(&self) -> Result<(), LedgerError>;

    /// Verify wire-encoded transactions, in order, within the current
    /// session. Passing transactions advance the session.
    fn verify_coin_data_batch(&self, batch: &[Vec<u8>]) -> Result<BatchVerdict, LedgerError>;

    fn commit_unconfirmed(&self, tx: &Transaction) -> Result<CommitOutcome, LedgerError>;

    /// Undo a previous successful `commit_unconfirmed`. Unknown
    /// transactions are ignored.
    fn rollback(&self, tx: &Transaction) -> Result<(), LedgerError>;

    /// Nonce the next spend from `(address, asset)` must carry.
    fn next_nonce(&self, address: &Address, asset: AssetId) -> Result<Nonce, LedgerError>;

    /// Apply a confirmed block's transactions.
    fn commit_confirmed(&self, txs: &[Transaction]) -> Result<(), LedgerError>;
}
