//! # In-Memory Ledger
//!
//! A complete, if unpersisted, [`Ledger`]. Three layers of account state
//! sit behind a single lock:
//!
//! - **confirmed**: balance, last nonce and every nonce ever consumed, per
//!   (address, asset). Only [`Ledger::commit_confirmed`] writes it.
//! - **unconfirmed**: the nonce tip, debited amount and consumed nonces of
//!   everything admitted through intake but not yet in a block.
//! - **session**: the same shape, rebuilt from confirmed state by every
//!   [`Ledger::begin_batch_session`] and advanced by batch verification.
//!
//! ## Classification of a debit leg
//!
//! 1. `nonce == tip` and enough balance left: passes.
//! 2. `nonce` already consumed (confirmed or in the layer): fails. That is
//!    a double spend.
//! 3. Anything else: orphan. The predecessor it points at has not been
//!    seen yet.
//!
//! Credits only land on confirmation, so an unconfirmed incoming payment
//! can never fund an outgoing one.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use super::{BatchVerdict, CommitOutcome, Ledger, LedgerError};
use crate::transaction::builder::Transaction;
use crate::transaction::types::{Address, AssetId, LockKind, Nonce, TxHash};

type AccountKey = (Address, AssetId);

// ---------------------------------------------------------------------------
// Account layers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AccountState {
    balance: u128,
    nonce: Nonce,
    consumed: HashSet<Nonce>,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            balance: 0,
            nonce: Nonce::GENESIS,
            consumed: HashSet::new(),
        }
    }
}

/// Changes a layer (unconfirmed or session) makes on top of confirmed state.
#[derive(Debug, Clone, Default)]
struct Delta {
    tip: Option<Nonce>,
    debited: u128,
    consumed: HashSet<Nonce>,
}

impl Delta {
    fn is_empty(&self) -> bool {
        self.tip.is_none() && self.debited == 0 && self.consumed.is_empty()
    }
}

/// One applied debit leg, kept so it can be undone.
#[derive(Debug, Clone)]
struct AppliedLeg {
    key: AccountKey,
    prev_tip: Option<Nonce>,
    nonce: Nonce,
    amount: u128,
}

enum Verdict {
    Pass,
    Orphan,
    Fail(String),
}

#[derive(Debug, Default)]
struct LedgerState {
    accounts: HashMap<AccountKey, AccountState>,
    unconfirmed: HashMap<AccountKey, Delta>,
    admitted: HashMap<TxHash, Vec<AppliedLeg>>,
    session: HashMap<AccountKey, Delta>,
}

fn classify(
    accounts: &HashMap<AccountKey, AccountState>,
    layer: &HashMap<AccountKey, Delta>,
    tx: &Transaction,
) -> Verdict {
    let mut orphan = false;
    for from in &tx.coin_data.from {
        let key = (from.address, from.asset);
        let account = accounts.get(&key);
        let delta = layer.get(&key);
        let confirmed_nonce = account.map_or(Nonce::GENESIS, |a| a.nonce);
        let tip = delta.and_then(|d| d.tip).unwrap_or(confirmed_nonce);

        if from.nonce == tip {
            let balance = account.map_or(0, |a| a.balance);
            let debited = delta.map_or(0, |d| d.debited);
            if from.lock == LockKind::Ordinary && balance.saturating_sub(debited) < from.amount {
                return Verdict::Fail(format!(
                    "insufficient balance for {} in {}",
                    from.address, from.asset
                ));
            }
        } else if account.map_or(false, |a| a.consumed.contains(&from.nonce))
            || delta.map_or(false, |d| d.consumed.contains(&from.nonce))
        {
            return Verdict::Fail(format!("nonce {:?} already spent", from.nonce));
        } else {
            orphan = true;
        }
    }
    if orphan {
        Verdict::Orphan
    } else {
        Verdict::Pass
    }
}

fn apply(layer: &mut HashMap<AccountKey, Delta>, tx: &Transaction) -> Vec<AppliedLeg> {
    let next = Nonce::from_hash(&tx.hash());
    tx.coin_data
        .from
        .iter()
        .map(|from| {
            let key = (from.address, from.asset);
            let delta = layer.entry(key).or_default();
            let amount = match from.lock {
                LockKind::Ordinary => from.amount,
                LockKind::Unlock => 0,
            };
            let leg = AppliedLeg {
                key,
                prev_tip: delta.tip,
                nonce: from.nonce,
                amount,
            };
            delta.tip = Some(next);
            delta.consumed.insert(from.nonce);
            delta.debited = delta.debited.saturating_add(amount);
            leg
        })
        .collect()
}

fn prune(layer: &mut HashMap<AccountKey, Delta>, key: &AccountKey) {
    if layer.get(key).map_or(false, Delta::is_empty) {
        layer.remove(key);
    }
}

// ---------------------------------------------------------------------------
// MemoryLedger
// ---------------------------------------------------------------------------

/// Thread-safe in-memory ledger.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint `amount` into an account's confirmed balance. Genesis and test
    /// funding only.
    pub fn credit(&self, address: Address, asset: AssetId, amount: u128) {
        let mut state = self.state.write();
        let account = state.accounts.entry((address, asset)).or_default();
        account.balance = account.balance.saturating_add(amount);
    }

    /// Confirmed balance.
    pub fn balance(&self, address: &Address, asset: AssetId) -> u128 {
        self.state
            .read()
            .accounts
            .get(&(*address, asset))
            .map_or(0, |a| a.balance)
    }

    /// Number of transactions admitted but not yet confirmed.
    pub fn unconfirmed_count(&self) -> usize {
        self.state.read().admitted.len()
    }
}

impl Ledger for MemoryLedger {
    fn begin_batch_session(&self) -> Result<(), LedgerError> {
        self.state.write().session.clear();
        Ok(())
    }

    fn verify_coin_data_batch(&self, batch: &[Vec<u8>]) -> Result<BatchVerdict, LedgerError> {
        let txs = batch
            .iter()
            .map(|wire| Transaction::from_wire(wire))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guard = self.state.write();
        let state = &mut *guard;
        let mut verdict = BatchVerdict::default();
        for tx in &txs {
            match classify(&state.accounts, &state.session, tx) {
                Verdict::Pass => {
                    apply(&mut state.session, tx);
                }
                Verdict::Orphan => verdict.orphan.push(tx.hash()),
                Verdict::Fail(_) => verdict.fail.push(tx.hash()),
            }
        }
        Ok(verdict)
    }

    fn commit_unconfirmed(&self, tx: &Transaction) -> Result<CommitOutcome, LedgerError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if state.admitted.contains_key(&tx.hash()) {
            return Ok(CommitOutcome::Success);
        }
        match classify(&state.accounts, &state.unconfirmed, tx) {
            Verdict::Pass => {
                let legs = apply(&mut state.unconfirmed, tx);
                state.admitted.insert(tx.hash(), legs);
                Ok(CommitOutcome::Success)
            }
            Verdict::Orphan => Ok(CommitOutcome::Orphan),
            Verdict::Fail(reason) => Ok(CommitOutcome::Fail(reason)),
        }
    }

    fn rollback(&self, tx: &Transaction) -> Result<(), LedgerError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let Some(legs) = state.admitted.remove(&tx.hash()) else {
            return Ok(());
        };
        for leg in legs.iter().rev() {
            if let Some(delta) = state.unconfirmed.get_mut(&leg.key) {
                delta.tip = leg.prev_tip;
                delta.consumed.remove(&leg.nonce);
                delta.debited = delta.debited.saturating_sub(leg.amount);
            }
            prune(&mut state.unconfirmed, &leg.key);
        }
        Ok(())
    }

    fn next_nonce(&self, address: &Address, asset: AssetId) -> Result<Nonce, LedgerError> {
        let state = self.state.read();
        let key = (*address, asset);
        let confirmed = state.accounts.get(&key).map_or(Nonce::GENESIS, |a| a.nonce);
        Ok(state
            .unconfirmed
            .get(&key)
            .and_then(|d| d.tip)
            .unwrap_or(confirmed))
    }

    fn commit_confirmed(&self, txs: &[Transaction]) -> Result<(), LedgerError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        for tx in txs {
            let next = Nonce::from_hash(&tx.hash());
            for from in &tx.coin_data.from {
                let account = state.accounts.entry((from.address, from.asset)).or_default();
                if from.lock == LockKind::Ordinary {
                    account.balance = account.balance.saturating_sub(from.amount);
                }
                account.consumed.insert(from.nonce);
                account.nonce = next;
            }
            for to in &tx.coin_data.to {
                let account = state.accounts.entry((to.address, to.asset)).or_default();
                account.balance = account.balance.saturating_add(to.amount);
            }

            if let Some(legs) = state.admitted.remove(&tx.hash()) {
                for leg in legs {
                    if let Some(delta) = state.unconfirmed.get_mut(&leg.key) {
                        delta.debited = delta.debited.saturating_sub(leg.amount);
                        delta.consumed.remove(&leg.nonce);
                        if delta.tip == Some(next) {
                            delta.tip = None;
                        }
                    }
                    prune(&mut state.unconfirmed, &leg.key);
                }
            }
        }
        state.session.clear();
        Ok(())
    }
}
