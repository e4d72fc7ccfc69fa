//! # Transaction Intake
//!
//! The path every transaction takes into the node, whether a wallet sent it
//! or a peer relayed it:
//!
//! ```text
//! accepting? → registered & user type? → duplicate? → validate_structure
//!   → ledger.commit_unconfirmed → unconfirmed store → mempool (if packaging)
//!   → recent filter → broadcast (or hash-only forward)
//! ```
//!
//! A transaction is admitted once the ledger, the unconfirmed store and,
//! on a packaging node, the mempool have all taken it. A full pool undoes
//! the first two. Everything after that (filter, propagation) is
//! best-effort and only logged when it fails.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info, warn};

use super::context::ChainContext;
use super::error::{SubmitOutcome, TxError};
use super::gossip::broadcast_with_retry;
use crate::ledger::CommitOutcome;
use crate::storage::BlockHeader;
use crate::transaction::builder::Transaction;
use crate::transaction::types::TxHash;
use crate::transaction::verification::{validate_structure, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Peer,
}

/// Intake service for one chain.
#[derive(Debug)]
pub struct TxService {
    ctx: Arc<ChainContext>,
    /// Hashes currently between the duplicate check and persistence.
    in_flight: DashSet<TxHash>,
}

/// Releases an in-flight claim when dropped.
struct InFlight<'a> {
    set: &'a DashSet<TxHash>,
    hash: TxHash,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.hash);
    }
}

impl TxService {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        Self {
            ctx,
            in_flight: DashSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.ctx
    }

    /// Submit a locally originated transaction.
    pub fn submit(&self, tx: Transaction) -> Result<SubmitOutcome, TxError> {
        self.admit(tx, Origin::Local)
    }

    /// Handle a transaction relayed by a peer. Echoes of anything handled
    /// recently are dropped before any validation.
    pub fn receive_from_peer(&self, tx: Transaction) -> Result<SubmitOutcome, TxError> {
        if self.ctx.recent.contains(&tx.hash(), self.ctx.now_millis()) {
            debug!(tx_hash = %tx.hash(), "recently seen, dropping relay");
            return Ok(SubmitOutcome::Duplicate);
        }
        self.admit(tx, Origin::Peer)
    }

    fn admit(&self, tx: Transaction, origin: Origin) -> Result<SubmitOutcome, TxError> {
        let ctx = &self.ctx;
        let hash = tx.hash();

        if !ctx.is_accepting() {
            return Err(TxError::NotAccepting);
        }

        let register = ctx
            .registry
            .get(tx.tx_type)
            .ok_or(ValidationError::UnregisteredType {
                tx_type: tx.tx_type,
            })?;
        if !register.is_user_submittable() {
            return Err(TxError::SystemTypeNotAccepted {
                tx_type: tx.tx_type,
            });
        }

        if !self.in_flight.insert(hash) {
            debug!(tx_hash = %hash, "concurrent submission in flight");
            return Ok(SubmitOutcome::Duplicate);
        }
        let _claim = InFlight {
            set: &self.in_flight,
            hash,
        };

        if ctx.confirmed.exists(&hash)? || ctx.unconfirmed.exists(&hash)? {
            debug!(tx_hash = %hash, "already known");
            return Ok(SubmitOutcome::Duplicate);
        }

        validate_structure(&tx, &register, &ctx.config, ctx.best_height() + 1)?;

        match ctx.ledger.commit_unconfirmed(&tx)? {
            CommitOutcome::Success => {}
            CommitOutcome::Orphan => {
                debug!(tx_hash = %hash, "ledger orphan");
                return Err(TxError::LedgerOrphan { hash });
            }
            CommitOutcome::Fail(reason) => {
                debug!(tx_hash = %hash, %reason, "ledger rejected");
                return Err(TxError::LedgerRejected { hash, reason });
            }
        }

        if let Err(e) = ctx.unconfirmed.put(&tx) {
            if let Err(rollback) = ctx.ledger.rollback(&tx) {
                warn!(tx_hash = %hash, error = %rollback, "ledger rollback failed");
            }
            return Err(e.into());
        }

        if ctx.is_packaging() && !ctx.mempool.add(tx.clone()) {
            if let Err(e) = ctx.ledger.rollback(&tx) {
                warn!(tx_hash = %hash, error = %e, "ledger rollback failed");
            }
            if let Err(e) = ctx.unconfirmed.remove(&hash) {
                warn!(tx_hash = %hash, error = %e, "failed to remove unqueued transaction");
            }
            let capacity = ctx.mempool.config().max_size;
            debug!(tx_hash = %hash, capacity, "mempool full");
            return Err(TxError::MempoolFull { hash, capacity });
        }

        ctx.recent.insert(hash, ctx.now_millis());

        if origin == Origin::Peer || register.hash_only_forward {
            if let Err(e) = ctx.network.forward_hash_only(&hash) {
                warn!(tx_hash = %hash, error = %e, "hash forward failed");
            }
        } else {
            let intake = &ctx.config.intake;
            let sent = broadcast_with_retry(
                ctx.network.as_ref(),
                &tx,
                intake.broadcast_attempts,
                Duration::from_millis(intake.broadcast_backoff_ms),
            );
            if !sent {
                warn!(
                    tx_hash = %hash,
                    attempts = intake.broadcast_attempts,
                    "broadcast failed on every attempt"
                );
            }
        }

        debug!(tx_hash = %hash, tx_type = tx.tx_type, ?origin, "transaction admitted");
        Ok(SubmitOutcome::Accepted)
    }

    /// Apply a confirmed block: move its transactions to the confirmed
    /// store, drop them from the pool and orphan tracker, settle the ledger
    /// and advance the best height.
    pub fn commit_block(&self, header: &BlockHeader, txs: &[Transaction]) -> Result<(), TxError> {
        let ctx = &self.ctx;
        for tx in txs {
            let hash = tx.hash();
            ctx.confirmed.put(tx)?;
            ctx.unconfirmed.remove(&hash)?;
            ctx.mempool.remove(&hash);
            ctx.orphans.clear(&hash);
        }
        ctx.ledger.commit_confirmed(txs)?;
        ctx.set_best_height(header.height);
        info!(
            height = header.height,
            block_hash = %header.hash_hex(),
            txs = txs.len(),
            "block committed"
        );
        Ok(())
    }
}
