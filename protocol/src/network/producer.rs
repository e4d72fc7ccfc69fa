//! # Block Packaging
//!
//! The `BlockPackager` turns the mempool into the transaction list of a
//! candidate block within a hard deadline and a byte budget.
//!
//! ## Stages
//!
//! ```text
//! 1. COLLECT   - poll the mempool; pre-filter; ledger-verify in sub-batches
//! 2. VALIDATE  - module execution + unified validators over the survivors;
//!                on any rejection, discard, re-verify from a fresh ledger
//!                session and go again (bounded loop, exits at a fixed point)
//! 3. ASSEMBLE  - pack-produce, append generated txs, final deadline and
//!                size checks; while module output overflows the budget,
//!                displace the newest originals and redo stages 2-3
//! 4. PUT BACK  - orphans and displaced txs return to the mempool front in
//!                their original relative order
//! ```
//!
//! Early exits: `Empty(InsufficientTime)` before anything is polled,
//! `Empty(ProtocolUpgrade)` when the upgrade signal is seen during
//! collection (everything held goes back unchanged). Any error, including
//! a missed deadline or module output that overflows the budget with no
//! originals left to displace, also puts every held transaction back before
//! it is returned. A partial block is never emitted.
//!
//! ## Ownership of polled transactions
//!
//! Once polled, a transaction is in exactly one of the round's lists
//! (`pending`, `accepted`, `displaced`) until it is packed, discarded or
//! put back. That is what lets any exit path restore the mempool by
//! draining those three lists.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::context::ChainContext;
use super::orphan::OrphanDecision;
use crate::ledger::LedgerError;
use crate::registry::{
    BlockContext, ExecutionSummary, ModuleError, ModuleVerifyMap, ProducePhase, Registry,
};
use crate::storage::StoreError;
use crate::transaction::builder::{Transaction, TxCodecError};
use crate::transaction::types::TxHash;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the consensus layer asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageRequest {
    /// Hard deadline, Unix milliseconds.
    pub end_timestamp_ms: u64,
    /// Byte budget for the serialized transaction list.
    pub max_tx_data_size: usize,
    /// Unix seconds.
    pub block_time: u64,
    pub pre_state_root: [u8; 32],
}

/// A polled transaction with its intake position and wire form.
#[derive(Debug, Clone)]
pub struct PackageWrapper {
    pub tx: Transaction,
    /// Position in this round's poll order. Put-back sorts on it.
    pub index: usize,
    pub wire: Vec<u8>,
}

impl PackageWrapper {
    pub fn hash(&self) -> TxHash {
        self.tx.hash()
    }

    pub fn size(&self) -> usize {
        self.wire.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedBlock {
    /// Original transactions in poll order, then generated ones.
    pub transactions: Vec<Transaction>,
    /// `None` when no module executed side effects.
    pub state_root: Option<[u8; 32]>,
    pub total_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    InsufficientTime,
    ProtocolUpgrade,
    PackagingDisabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackOutcome {
    Packed(PackedBlock),
    Empty(EmptyReason),
}

/// Packaging aborted. Every held transaction is back in the mempool.
#[derive(Debug, Error)]
pub enum PackageError {
    #[error("packaging missed its deadline during {stage}")]
    Timeout { stage: &'static str },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] TxCodecError),

    #[error("packed size {size} exceeds budget {budget}")]
    SizeBudgetExceeded { size: usize, budget: usize },
}

/// Transactions held by one packaging attempt.
#[derive(Debug, Default)]
struct Round {
    /// Collected, not yet ledger-verified.
    pending: Vec<PackageWrapper>,
    /// Passed ledger verification so far, in poll order.
    accepted: Vec<PackageWrapper>,
    /// Going back to the mempool: requeued orphans, capped or oversized txs.
    displaced: Vec<PackageWrapper>,
    seen: HashSet<TxHash>,
    /// Bytes of `pending` plus `accepted`.
    held_size: usize,
    next_index: usize,
}

impl Round {
    fn drain_all(&mut self) -> Vec<PackageWrapper> {
        let mut all = std::mem::take(&mut self.displaced);
        all.append(&mut self.accepted);
        all.append(&mut self.pending);
        self.held_size = 0;
        all
    }
}

// ---------------------------------------------------------------------------
// BlockPackager
// ---------------------------------------------------------------------------

pub struct BlockPackager {
    ctx: Arc<ChainContext>,
}

impl BlockPackager {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.ctx
    }

    /// Package a candidate block. See the module docs for the stages.
    pub fn package_basic(&self, request: &PackageRequest) -> Result<PackOutcome, PackageError> {
        let ctx = &self.ctx;
        if !ctx.is_packaging() {
            return Ok(PackOutcome::Empty(EmptyReason::PackagingDisabled));
        }

        let _guard = ctx.package_lock.lock();
        let started = ctx.now_millis();
        let remaining = request.end_timestamp_ms.saturating_sub(started);
        if remaining < ctx.config.package.reserve_ms {
            debug!(remaining_ms = remaining, "not enough time left to package");
            return Ok(PackOutcome::Empty(EmptyReason::InsufficientTime));
        }

        let block_ctx = BlockContext {
            height: ctx.best_height() + 1,
            block_time: request.block_time,
            pre_state_root: request.pre_state_root,
        };

        let mut round = Round::default();
        match self.run(&mut round, request, &block_ctx) {
            Ok(outcome) => {
                if let PackOutcome::Packed(block) = &outcome {
                    info!(
                        height = block_ctx.height,
                        txs = block.transactions.len(),
                        size = block.total_size,
                        elapsed_ms = ctx.now_millis().saturating_sub(started),
                        mempool = ctx.mempool.record_len(),
                        "block packaged"
                    );
                }
                Ok(outcome)
            }
            Err(e) => {
                let restored = self.put_back(round.drain_all());
                warn!(height = block_ctx.height, restored, error = %e, "packaging aborted");
                Err(e)
            }
        }
    }

    fn run(
        &self,
        round: &mut Round,
        request: &PackageRequest,
        block_ctx: &BlockContext,
    ) -> Result<PackOutcome, PackageError> {
        let ctx = &self.ctx;
        let cfg = &ctx.config.package;
        let end = request.end_timestamp_ms;
        let collect_deadline = end
            .saturating_sub(cfg.rpc_reserve_ms)
            .saturating_sub(cfg.module_reserve_ms);
        let assembly_deadline = end.saturating_sub(cfg.rpc_reserve_ms);
        let size_budget = request
            .max_tx_data_size
            .saturating_sub(cfg.module_output_reserve);

        // 1. Collect.
        ctx.ledger.begin_batch_session()?;
        let mut cross_chain = 0usize;
        loop {
            if ctx.upgrade_signal.is_raised() {
                let restored = self.put_back(round.drain_all());
                info!(restored, "protocol upgrade pending, packaging empty block");
                return Ok(PackOutcome::Empty(EmptyReason::ProtocolUpgrade));
            }
            if round.pending.len() + round.accepted.len() >= cfg.max_tx_count
                || ctx.now_millis() >= collect_deadline
            {
                break;
            }
            let Some(tx) = ctx.mempool.poll() else {
                break;
            };
            let hash = tx.hash();
            if !round.seen.insert(hash) {
                continue;
            }

            let index = round.next_index;
            round.next_index += 1;
            let wire = match tx.to_wire() {
                Ok(wire) => wire,
                Err(e) => {
                    self.discard(&tx, "unencodable");
                    debug!(tx_hash = %hash, error = %e, "dropping unencodable transaction");
                    continue;
                }
            };
            let wrapper = PackageWrapper { tx, index, wire };

            let confirmed = match ctx.confirmed.exists(&hash) {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    round.displaced.push(wrapper);
                    return Err(e.into());
                }
            };
            if confirmed {
                debug!(tx_hash = %hash, "already confirmed, clearing stale entry");
                if let Err(e) = ctx.unconfirmed.remove(&hash) {
                    warn!(tx_hash = %hash, error = %e, "failed to clear stale unconfirmed entry");
                }
                ctx.orphans.clear(&hash);
                continue;
            }

            let Some(register) = ctx.registry.get(wrapper.tx.tx_type) else {
                self.discard(&wrapper.tx, "type no longer registered");
                continue;
            };
            if register.module.as_str() == ctx.config.consensus_module
                && wrapper.tx.time.abs_diff(request.block_time) > cfg.consensus_window_secs
            {
                self.discard(&wrapper.tx, "outside consensus window");
                continue;
            }
            if register.module.as_str() == ctx.config.cross_chain_module {
                if cross_chain >= cfg.cross_chain_max_per_block {
                    round.displaced.push(wrapper);
                    continue;
                }
                cross_chain += 1;
            }
            if round.held_size + wrapper.size() > size_budget {
                debug!(
                    tx_hash = %hash,
                    size = wrapper.size(),
                    held = round.held_size,
                    budget = size_budget,
                    "size budget reached"
                );
                round.displaced.push(wrapper);
                break;
            }

            round.held_size += wrapper.size();
            round.pending.push(wrapper);
            if round.pending.len() >= cfg.batch_size {
                self.flush(round, true)?;
            }
        }
        self.flush(round, true)?;

        // 2-3. Validate to a fixed point, then assemble. When module output
        // pushes the block past the budget, the newest originals are
        // displaced and the module rounds run again over what is left.
        let mut rounds = 0u32;
        let mut shrinks = 0u32;
        let (execution, produced, transactions, total_size) = loop {
            let execution =
                self.validate_to_fixed_point(round, block_ctx, assembly_deadline, &mut rounds)?;

            if ctx.now_millis() >= assembly_deadline {
                return Err(PackageError::Timeout { stage: "assembly" });
            }
            let produce_groups = group_by_module(&ctx.registry, &round.accepted, |w| {
                ctx.registry
                    .get(w.tx.tx_type)
                    .map_or(false, |r| r.pack_produce)
            });
            let produced = if produce_groups.is_empty() {
                Default::default()
            } else {
                ctx.registry
                    .produce_groups(&produce_groups, block_ctx, ProducePhase::Package)?
            };
            let removed: HashSet<TxHash> = produced.removed.iter().copied().collect();

            let mut transactions = Vec::with_capacity(round.accepted.len());
            let mut total_size = 0usize;
            for wrapper in round.accepted.iter().filter(|w| !removed.contains(&w.hash())) {
                total_size += wrapper.size();
                transactions.push(wrapper.tx.clone());
            }
            for wire in execution.generated.iter().chain(produced.generated.iter()) {
                total_size += wire.len();
                transactions.push(Transaction::from_wire(wire)?);
            }
            if total_size <= request.max_tx_data_size {
                break (execution, produced, transactions, total_size);
            }
            if round.accepted.is_empty() {
                return Err(PackageError::SizeBudgetExceeded {
                    size: total_size,
                    budget: request.max_tx_data_size,
                });
            }

            let excess = total_size - request.max_tx_data_size;
            let mut freed = 0usize;
            while freed < excess {
                let Some(wrapper) = round.accepted.pop() else {
                    break;
                };
                freed += wrapper.size();
                round.held_size -= wrapper.size();
                round.displaced.push(wrapper);
            }
            shrinks += 1;
            debug!(
                size = total_size,
                budget = request.max_tx_data_size,
                freed,
                kept = round.accepted.len(),
                "module output over budget, displacing newest transactions"
            );
            round.pending = std::mem::take(&mut round.accepted);
            ctx.ledger.begin_batch_session()?;
            self.flush(round, false)?;
        };
        let removed: HashSet<TxHash> = produced.removed.iter().copied().collect();

        if ctx.now_millis() >= assembly_deadline {
            return Err(PackageError::Timeout { stage: "assembly" });
        }

        // 4. Commit the round: consumed inputs leave the store, displaced
        // transactions go back, packed ones lose their orphan history.
        for hash in &removed {
            if let Err(e) = ctx.unconfirmed.remove(hash) {
                warn!(tx_hash = %hash, error = %e, "failed to drop consumed input");
            }
        }
        for wrapper in &round.accepted {
            ctx.orphans.clear(&wrapper.hash());
        }
        round.accepted.clear();
        round.held_size = 0;
        let displaced = std::mem::take(&mut round.displaced);
        let restored = self.put_back(displaced);

        debug!(
            rounds,
            shrinks,
            restored,
            consumed = removed.len(),
            generated = execution.generated.len() + produced.generated.len(),
            "packaging round complete"
        );

        Ok(PackOutcome::Packed(PackedBlock {
            transactions,
            state_root: execution.state_root,
            total_size,
        }))
    }

    /// Run module execution and the unified validators over `accepted`
    /// until nothing is rejected. Rejected transactions are discarded and the
    /// survivors re-verified from a fresh ledger session before each retry.
    fn validate_to_fixed_point(
        &self,
        round: &mut Round,
        block_ctx: &BlockContext,
        assembly_deadline: u64,
        rounds: &mut u32,
    ) -> Result<ExecutionSummary, PackageError> {
        let ctx = &self.ctx;
        loop {
            if ctx.now_millis() >= assembly_deadline {
                return Err(PackageError::Timeout {
                    stage: "module validation",
                });
            }
            *rounds += 1;
            let groups = group_by_module(&ctx.registry, &round.accepted, |_| true);
            let execution = ctx.registry.execute_groups(&groups, block_ctx)?;
            let mut rejected: HashSet<TxHash> = execution.rejected.iter().copied().collect();
            rejected.extend(ctx.registry.validate_groups(&groups, block_ctx)?);
            if rejected.is_empty() {
                return Ok(execution);
            }

            debug!(round = *rounds, rejected = rejected.len(), "modules rejected transactions");
            let survivors = std::mem::take(&mut round.accepted);
            for wrapper in survivors {
                if rejected.contains(&wrapper.hash()) {
                    round.held_size -= wrapper.size();
                    self.discard(&wrapper.tx, "module rejected");
                } else {
                    round.pending.push(wrapper);
                }
            }
            ctx.ledger.begin_batch_session()?;
            self.flush(round, false)?;
        }
    }

    /// Ledger-verify everything in `pending`, one sub-batch at a time.
    /// Passing transactions move to `accepted`; orphans are requeued or
    /// discarded per the tracker, counted only when `counted`.
    fn flush(&self, round: &mut Round, counted: bool) -> Result<(), PackageError> {
        let ctx = &self.ctx;
        let batch_size = ctx.config.package.batch_size.max(1);
        while !round.pending.is_empty() {
            let n = round.pending.len().min(batch_size);
            let wires: Vec<Vec<u8>> = round.pending[..n].iter().map(|w| w.wire.clone()).collect();
            let verdict = ctx.ledger.verify_coin_data_batch(&wires)?;
            let fail: HashSet<TxHash> = verdict.fail.into_iter().collect();
            let orphan: HashSet<TxHash> = verdict.orphan.into_iter().collect();

            for wrapper in round.pending.drain(..n).collect::<Vec<_>>() {
                let hash = wrapper.hash();
                if fail.contains(&hash) {
                    round.held_size -= wrapper.size();
                    self.discard(&wrapper.tx, "ledger rejected");
                } else if orphan.contains(&hash) {
                    round.held_size -= wrapper.size();
                    let decision = if counted {
                        ctx.orphans.record(hash)
                    } else {
                        ctx.orphans.record_no_count(hash)
                    };
                    match decision {
                        OrphanDecision::Requeue => {
                            debug!(tx_hash = %hash, counted, "orphan requeued");
                            round.displaced.push(wrapper);
                        }
                        OrphanDecision::Discard => {
                            self.discard(&wrapper.tx, "orphan retries exhausted");
                        }
                    }
                } else {
                    round.accepted.push(wrapper);
                }
            }
        }
        Ok(())
    }

    /// Drop a transaction for good: undo its ledger admission and forget
    /// it. Failures here are logged, never propagated.
    fn discard(&self, tx: &Transaction, reason: &'static str) {
        let ctx = &self.ctx;
        let hash = tx.hash();
        if let Err(e) = ctx.ledger.rollback(tx) {
            warn!(tx_hash = %hash, error = %e, "ledger rollback failed");
        }
        if let Err(e) = ctx.unconfirmed.remove(&hash) {
            warn!(tx_hash = %hash, error = %e, "failed to remove discarded transaction");
        }
        ctx.orphans.clear(&hash);
        debug!(tx_hash = %hash, reason, "transaction discarded");
    }

    /// Reinsert at the mempool front so that the original relative order
    /// is restored. Returns how many went back.
    fn put_back(&self, mut wrappers: Vec<PackageWrapper>) -> usize {
        wrappers.sort_by(|a, b| b.index.cmp(&a.index));
        let count = wrappers.len();
        for wrapper in wrappers {
            self.ctx.mempool.offer_first(wrapper.tx);
        }
        count
    }
}

/// Group wire forms by owning module, keeping poll order within a group.
fn group_by_module<F>(registry: &Registry, wrappers: &[PackageWrapper], include: F) -> ModuleVerifyMap
where
    F: Fn(&PackageWrapper) -> bool,
{
    let mut groups = ModuleVerifyMap::new();
    for wrapper in wrappers.iter().filter(|w| include(w)) {
        if let Some(register) = registry.get(wrapper.tx.tx_type) {
            groups
                .entry(register.module)
                .or_default()
                .push(wrapper.wire.clone());
        }
    }
    groups
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::ledger::MemoryLedger;
    use crate::network::context::ManualClock;
    use crate::registry::{ExecutionOutcome, ModuleHandler, ProduceOutcome, TxRegister};
    use crate::storage::TxStore;
    use crate::transaction::builder::TransactionBuilder;
    use crate::transaction::types::{tx_types, Address, AssetId, CoinFrom, LockKind, Nonce};
    use parking_lot::Mutex;
    use std::time::Duration;

    const NOW_MS: u64 = 1_700_000_000_000;
    const BLOCK_TIME: u64 = 1_700_000_000;

    fn plain(tag: u32, remark_len: usize) -> Transaction {
        let mut remark = tag.to_le_bytes().to_vec();
        remark.resize(remark_len.max(4), 0);
        TransactionBuilder::new(tx_types::TRANSFER)
            .time(BLOCK_TIME)
            .remark(remark)
            .build()
    }

    fn with_from(tag: u32, nonce: Nonce, amount: u128) -> Transaction {
        TransactionBuilder::new(tx_types::TRANSFER)
            .time(BLOCK_TIME)
            .remark(tag.to_le_bytes().to_vec())
            .from(CoinFrom {
                address: Address::from_public_key(1, &[1u8; 32]),
                asset: AssetId::new(1, 1),
                amount,
                nonce,
                lock: LockKind::Ordinary,
            })
            .build()
    }

    struct Fixture {
        packager: BlockPackager,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(config: ChainConfig, registry: Registry) -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW_MS));
        let ctx = ChainContext::builder(config)
            .registry(Arc::new(registry))
            .ledger(Arc::new(MemoryLedger::new()))
            .clock(clock.clone())
            .build()
            .unwrap();
        Fixture {
            packager: BlockPackager::new(Arc::new(ctx)),
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ChainConfig::default(), Registry::with_builtin_types())
    }

    fn request(budget: usize) -> PackageRequest {
        PackageRequest {
            end_timestamp_ms: NOW_MS + 10_000,
            max_tx_data_size: budget,
            block_time: BLOCK_TIME,
            pre_state_root: [0u8; 32],
        }
    }

    fn packed(outcome: PackOutcome) -> PackedBlock {
        match outcome {
            PackOutcome::Packed(block) => block,
            other => panic!("expected Packed, got {:?}", other),
        }
    }

    fn hashes(txs: &[Transaction]) -> Vec<TxHash> {
        txs.iter().map(Transaction::hash).collect()
    }

    /// Rejects a fixed set of hashes on validation.
    struct Reject {
        hashes: Vec<TxHash>,
    }

    impl ModuleHandler for Reject {
        fn validate(&self, txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
            Ok(txs
                .iter()
                .filter_map(|w| Transaction::from_wire(w).ok())
                .map(|t| t.hash())
                .filter(|h| self.hashes.contains(h))
                .collect())
        }
    }

    /// Consumes every input and emits one generated tx per call.
    struct Merge {
        calls: Mutex<u32>,
    }

    impl ModuleHandler for Merge {
        fn validate(&self, _txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
            Ok(Vec::new())
        }

        fn pack_produce(
            &self,
            txs: &[Vec<u8>],
            ctx: &BlockContext,
            _phase: ProducePhase,
        ) -> Result<ProduceOutcome, ModuleError> {
            *self.calls.lock() += 1;
            let removed = txs
                .iter()
                .filter_map(|w| Transaction::from_wire(w).ok())
                .map(|t| t.hash())
                .collect();
            let generated = TransactionBuilder::new(tx_types::CONTRACT_TRANSFER)
                .time(ctx.block_time)
                .remark(vec![0u8; 64])
                .build()
                .to_wire()
                .map_err(|e| ModuleError::Failed {
                    module: "sc".into(),
                    reason: e.to_string(),
                })?;
            Ok(ProduceOutcome {
                generated: vec![generated],
                removed,
            })
        }
    }

    /// Moves the clock past every deadline on validation.
    struct Slow {
        clock: Arc<ManualClock>,
    }

    impl ModuleHandler for Slow {
        fn validate(&self, _txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
            self.clock.advance(Duration::from_secs(60));
            Ok(Vec::new())
        }
    }

    // -- 1. Early exits -----------------------------------------------------

    #[test]
    fn test_insufficient_time_is_empty() {
        let f = fixture();
        f.packager.context().mempool.add(plain(1, 10));
        let mut req = request(1_000_000);
        req.end_timestamp_ms = NOW_MS + 100;
        assert_eq!(
            f.packager.package_basic(&req).unwrap(),
            PackOutcome::Empty(EmptyReason::InsufficientTime)
        );
        assert_eq!(f.packager.context().mempool.record_len(), 1);
    }

    #[test]
    fn test_packaging_disabled_is_empty() {
        let f = fixture();
        f.packager.context().set_packaging(false);
        assert_eq!(
            f.packager.package_basic(&request(1_000)).unwrap(),
            PackOutcome::Empty(EmptyReason::PackagingDisabled)
        );
    }

    #[test]
    fn test_upgrade_signal_returns_everything() {
        let f = fixture();
        let ctx = f.packager.context();
        let txs: Vec<_> = (0..3).map(|i| plain(i, 10)).collect();
        for tx in &txs {
            ctx.mempool.add(tx.clone());
        }
        ctx.upgrade_signal.raise();
        assert_eq!(
            f.packager.package_basic(&request(1_000_000)).unwrap(),
            PackOutcome::Empty(EmptyReason::ProtocolUpgrade)
        );
        for tx in &txs {
            assert_eq!(ctx.mempool.poll().as_ref(), Some(tx));
        }
    }

    // -- 2. Collection ------------------------------------------------------

    #[test]
    fn test_packs_in_poll_order() {
        let f = fixture();
        let ctx = f.packager.context();
        let txs: Vec<_> = (0..5).map(|i| plain(i, 10)).collect();
        for tx in &txs {
            ctx.mempool.add(tx.clone());
        }
        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(hashes(&block.transactions), hashes(&txs));
        assert_eq!(block.state_root, None);
        assert!(ctx.mempool.is_empty());
    }

    #[test]
    fn test_max_tx_count() {
        let mut config = ChainConfig::default();
        config.package.max_tx_count = 2;
        let f = fixture_with(config, Registry::with_builtin_types());
        let ctx = f.packager.context();
        for i in 0..4 {
            ctx.mempool.add(plain(i, 10));
        }
        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(ctx.mempool.record_len(), 2);
    }

    #[test]
    fn test_confirmed_entries_are_dropped() {
        let f = fixture();
        let ctx = f.packager.context();
        let stale = plain(1, 10);
        ctx.confirmed.put(&stale).unwrap();
        ctx.unconfirmed.put(&stale).unwrap();
        ctx.mempool.add(stale.clone());

        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert!(block.transactions.is_empty());
        assert!(!ctx.unconfirmed.exists(&stale.hash()).unwrap());
        assert!(ctx.mempool.is_empty());
    }

    #[test]
    fn test_oversized_tx_goes_back_to_front() {
        let f = fixture();
        let ctx = f.packager.context();
        let small = plain(1, 10);
        let big = plain(2, 5_000);
        let tail = plain(3, 10);
        ctx.mempool.add(small.clone());
        ctx.mempool.add(big.clone());
        ctx.mempool.add(tail.clone());

        let budget = small.size().unwrap() + 100;
        let block = packed(f.packager.package_basic(&request(budget)).unwrap());
        assert_eq!(hashes(&block.transactions), vec![small.hash()]);
        assert!(block.total_size <= budget);
        assert_eq!(ctx.mempool.poll(), Some(big));
        assert_eq!(ctx.mempool.poll(), Some(tail));
    }

    #[test]
    fn test_consensus_window_filter() {
        let f = fixture();
        let ctx = f.packager.context();
        ctx.registry
            .register_type(TxRegister::new(tx_types::YELLOW_PUNISH, crate::config::MODULE_CONSENSUS));
        let stale = TransactionBuilder::new(tx_types::YELLOW_PUNISH)
            .time(BLOCK_TIME - 10_000)
            .build();
        let fresh = TransactionBuilder::new(tx_types::YELLOW_PUNISH)
            .time(BLOCK_TIME - 5)
            .build();
        ctx.mempool.add(stale);
        ctx.mempool.add(fresh.clone());

        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(hashes(&block.transactions), vec![fresh.hash()]);
        assert!(ctx.mempool.is_empty());
    }

    #[test]
    fn test_cross_chain_cap_displaces_excess() {
        let mut config = ChainConfig::default();
        config.package.cross_chain_max_per_block = 1;
        let f = fixture_with(config, Registry::with_builtin_types());
        let ctx = f.packager.context();
        ctx.registry.register_type(TxRegister {
            cross_chain: true,
            ..TxRegister::new(tx_types::CROSS_CHAIN, crate::config::MODULE_CROSS_CHAIN)
        });
        let cc: Vec<_> = (0..3u8)
            .map(|i| {
                TransactionBuilder::new(tx_types::CROSS_CHAIN)
                    .time(BLOCK_TIME)
                    .remark(vec![i])
                    .build()
            })
            .collect();
        for tx in &cc {
            ctx.mempool.add(tx.clone());
        }
        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(hashes(&block.transactions), vec![cc[0].hash()]);
        assert_eq!(ctx.mempool.poll().as_ref(), Some(&cc[1]));
        assert_eq!(ctx.mempool.poll().as_ref(), Some(&cc[2]));
    }

    // -- 3. Ledger verdicts -------------------------------------------------

    #[test]
    fn test_ledger_failure_is_discarded() {
        let f = fixture();
        let ctx = f.packager.context();
        // Genesis nonce but no funds.
        let broke = with_from(1, Nonce::GENESIS, 10);
        ctx.unconfirmed.put(&broke).unwrap();
        ctx.mempool.add(broke.clone());
        ctx.mempool.add(plain(2, 10));

        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(block.transactions.len(), 1);
        assert!(!ctx.unconfirmed.exists(&broke.hash()).unwrap());
        assert!(ctx.mempool.is_empty());
    }

    #[test]
    fn test_orphan_is_requeued_and_counted() {
        let f = fixture();
        let ctx = f.packager.context();
        let orphan = with_from(1, Nonce([7u8; 8]), 10);
        ctx.mempool.add(orphan.clone());

        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert!(block.transactions.is_empty());
        assert!(ctx.mempool.contains(&orphan.hash()));
        assert_eq!(ctx.orphans.count(&orphan.hash()), 1);
    }

    // -- 4. Modules ---------------------------------------------------------

    #[test]
    fn test_module_rejection_loops_to_fixed_point() {
        let f = fixture();
        let ctx = f.packager.context();
        let keep = plain(1, 10);
        let bad = plain(2, 10);
        ctx.registry.register_module(
            crate::config::MODULE_TRANSACTION,
            vec![TxRegister::new(tx_types::TRANSFER, "")],
            Arc::new(Reject {
                hashes: vec![bad.hash()],
            }),
        );
        ctx.unconfirmed.put(&bad).unwrap();
        ctx.mempool.add(keep.clone());
        ctx.mempool.add(bad.clone());

        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(hashes(&block.transactions), vec![keep.hash()]);
        assert!(!ctx.unconfirmed.exists(&bad.hash()).unwrap());
        assert!(ctx.mempool.is_empty());
    }

    #[test]
    fn test_pack_produce_replaces_inputs() {
        let f = fixture();
        let ctx = f.packager.context();
        let merge = Arc::new(Merge {
            calls: Mutex::new(0),
        });
        ctx.registry.register_module(
            crate::config::MODULE_CONTRACT,
            vec![
                TxRegister {
                    pack_produce: true,
                    ..TxRegister::new(tx_types::CALL_CONTRACT, "")
                },
                TxRegister::generated(tx_types::CONTRACT_TRANSFER, ""),
            ],
            merge.clone(),
        );
        let call = TransactionBuilder::new(tx_types::CALL_CONTRACT)
            .time(BLOCK_TIME)
            .build();
        let transfer = plain(1, 10);
        ctx.unconfirmed.put(&call).unwrap();
        ctx.mempool.add(call.clone());
        ctx.mempool.add(transfer.clone());

        let block = packed(f.packager.package_basic(&request(1_000_000)).unwrap());
        assert_eq!(*merge.calls.lock(), 1);
        assert_eq!(block.transactions.len(), 2);
        assert_eq!(block.transactions[0].hash(), transfer.hash());
        assert_eq!(block.transactions[1].tx_type, tx_types::CONTRACT_TRANSFER);
        assert!(!ctx.unconfirmed.exists(&call.hash()).unwrap());
    }

    // -- 5. Failures restore the pool --------------------------------------

    #[test]
    fn test_timeout_restores_held_transactions() {
        let f = fixture();
        let ctx = f.packager.context();
        ctx.registry.register_module(
            crate::config::MODULE_TRANSACTION,
            vec![TxRegister::new(tx_types::TRANSFER, "")],
            Arc::new(Slow {
                clock: f.clock.clone(),
            }),
        );
        let txs: Vec<_> = (0..3).map(|i| plain(i, 10)).collect();
        for tx in &txs {
            ctx.mempool.add(tx.clone());
        }
        match f.packager.package_basic(&request(1_000_000)) {
            Err(PackageError::Timeout { .. }) => {}
            other => panic!("expected Timeout, got {:?}", other),
        }
        for tx in &txs {
            assert_eq!(ctx.mempool.poll().as_ref(), Some(tx));
        }
    }

    #[test]
    fn test_module_output_over_budget_displaces_newest() {
        let f = fixture();
        let ctx = f.packager.context();
        ctx.registry.register_module(
            crate::config::MODULE_CONTRACT,
            vec![
                TxRegister {
                    pack_produce: true,
                    ..TxRegister::new(tx_types::CALL_CONTRACT, "")
                },
                TxRegister::generated(tx_types::CONTRACT_TRANSFER, ""),
            ],
            Arc::new(Merge {
                calls: Mutex::new(0),
            }),
        );
        let filler = plain(1, 200);
        let call = TransactionBuilder::new(tx_types::CALL_CONTRACT)
            .time(BLOCK_TIME)
            .build();
        ctx.mempool.add(filler.clone());
        ctx.mempool.add(call.clone());

        // Room for the inputs, not for the generated output on top.
        let budget = filler.size().unwrap() + call.size().unwrap();
        let block = packed(f.packager.package_basic(&request(budget)).unwrap());
        assert_eq!(hashes(&block.transactions), vec![filler.hash()]);
        assert!(block.total_size <= budget);
        assert_eq!(ctx.mempool.poll(), Some(call));
        assert!(ctx.mempool.is_empty());
    }

    /// Emits one refund per executed group.
    struct Refund;

    impl ModuleHandler for Refund {
        fn validate(&self, _txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
            Ok(Vec::new())
        }

        fn execute(
            &self,
            _txs: &[Vec<u8>],
            ctx: &BlockContext,
            state_root: [u8; 32],
        ) -> Result<Option<ExecutionOutcome>, ModuleError> {
            let refund = TransactionBuilder::new(tx_types::CONTRACT_RETURN_GAS)
                .time(ctx.block_time)
                .remark(vec![0u8; 64])
                .build()
                .to_wire()
                .map_err(|e| ModuleError::Failed {
                    module: "sc".into(),
                    reason: e.to_string(),
                })?;
            Ok(Some(ExecutionOutcome {
                state_root,
                generated: vec![refund],
                rejected: Vec::new(),
            }))
        }
    }

    #[test]
    fn test_full_pool_with_executing_module_still_packs() {
        let f = fixture();
        let ctx = f.packager.context();
        ctx.registry.register_module(
            crate::config::MODULE_CONTRACT,
            vec![
                TxRegister::new(tx_types::CALL_CONTRACT, ""),
                TxRegister::generated(tx_types::CONTRACT_RETURN_GAS, ""),
            ],
            Arc::new(Refund),
        );
        let call = TransactionBuilder::new(tx_types::CALL_CONTRACT)
            .time(BLOCK_TIME)
            .build();
        let transfers: Vec<_> = (0..50).map(|i| plain(i, 200)).collect();
        ctx.mempool.add(call.clone());
        for tx in &transfers {
            ctx.mempool.add(tx.clone());
        }

        // Consecutive rounds keep making progress instead of failing on the
        // same overflowing selection.
        let budget = 2_000;
        let mut packed_count = 0;
        for _ in 0..3 {
            let block = packed(f.packager.package_basic(&request(budget)).unwrap());
            assert!(block.total_size <= budget);
            assert!(!block.transactions.is_empty());
            packed_count += block
                .transactions
                .iter()
                .filter(|t| t.tx_type != tx_types::CONTRACT_RETURN_GAS)
                .count();
        }
        assert_eq!(ctx.mempool.record_len(), 51 - packed_count);

        // Order is preserved: the next transaction out is the oldest left.
        let next = ctx.mempool.poll().unwrap();
        let expected = &transfers[packed_count - 1];
        assert_eq!(next.hash(), expected.hash());
    }
}
