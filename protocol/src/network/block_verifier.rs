//! # Block Verification
//!
//! Trust-nothing re-validation of a block proposed by a peer. The same
//! ledger and module collaborators the packager used are asked the same
//! questions; any single failing step fails the whole block.
//!
//! ## Steps
//!
//! ```text
//! 1. decode; every embedded hash recomputes; header hash and tx root
//!    match the list
//! 2. no duplicate hashes, at most one of each singleton type
//! 3. nothing already confirmed
//! 4. structural validation, in parallel, of every tx whose stored
//!    unconfirmed record is missing or differs from the block's copy
//!    (identical known txs were validated at intake)
//! 5. ledger batch verification of the non-generated txs, in block order
//! 6. module execution and unified validation of the non-generated txs
//! 7. recomputed state root == declared state root, bit for bit
//! 8. generated txs == execute output + pack_produce(Verify) output over
//!    the block's pack-produce inputs, as a multiset; no input the modules
//!    report as consumed is in the block
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use super::context::ChainContext;
use crate::ledger::LedgerError;
use crate::registry::{BlockContext, ModuleError, ModuleVerifyMap, ProducePhase, TxRegister};
use crate::storage::{BlockHeader, StoreError};
use crate::transaction::builder::{Transaction, TxCodecError};
use crate::transaction::types::TxHash;
use crate::transaction::verification::{validate_structure, ValidationError};

/// Why a block was rejected, or why verification could not finish.
#[derive(Debug, Error)]
pub enum BlockVerifyError {
    #[error("undecodable transaction: {0}")]
    Codec(#[from] TxCodecError),

    #[error("header does not match the transaction list")]
    HeaderMismatch,

    #[error("transaction type {tx_type} is not registered")]
    UnregisteredType { tx_type: u16 },

    #[error("more than one transaction of singleton type {tx_type}")]
    DuplicateSingleton { tx_type: u16 },

    #[error("transaction {hash} appears twice")]
    DuplicateTransaction { hash: TxHash },

    #[error("transaction {hash} is already confirmed")]
    AlreadyConfirmed { hash: TxHash },

    #[error("transaction {hash} is invalid: {source}")]
    Invalid {
        hash: TxHash,
        #[source]
        source: ValidationError,
    },

    #[error("ledger rejected {hash}")]
    LedgerRejected { hash: TxHash },

    #[error("ledger cannot resolve the nonce chain of {hash}")]
    LedgerOrphan { hash: TxHash },

    #[error("module rejected {hash}")]
    ModuleRejected { hash: TxHash },

    #[error("state root mismatch: declared {declared:?}, computed {computed:?}")]
    StateRootMismatch {
        declared: Option<[u8; 32]>,
        computed: Option<[u8; 32]>,
    },

    #[error("generated transactions do not match: block has {found}, modules produced {expected}")]
    GeneratedMismatch { expected: usize, found: usize },

    #[error("consumed input {hash} is still in the block")]
    RemovedPresent { hash: TxHash },

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("module error: {0}")]
    Module(#[from] ModuleError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

struct Entry {
    tx: Transaction,
    register: TxRegister,
    wire: Vec<u8>,
}

pub struct BlockVerifier {
    ctx: Arc<ChainContext>,
}

impl BlockVerifier {
    pub fn new(ctx: Arc<ChainContext>) -> Self {
        Self { ctx }
    }

    /// Verify a peer block's transactions against `header`, starting from
    /// `pre_state_root`.
    pub fn verify_block_transactions(
        &self,
        txs: &[Vec<u8>],
        header: &BlockHeader,
        pre_state_root: [u8; 32],
    ) -> Result<(), BlockVerifyError> {
        let ctx = &self.ctx;
        // The ledger batch session is shared with packaging.
        let _guard = ctx.package_lock.lock();

        // 1. Decode and bind to the header.
        let mut entries = Vec::with_capacity(txs.len());
        for wire in txs {
            let tx = Transaction::from_wire(wire)?;
            let computed = tx.compute_hash();
            if computed != tx.hash() {
                return Err(BlockVerifyError::Invalid {
                    hash: tx.hash(),
                    source: ValidationError::HashMismatch {
                        stored: tx.hash(),
                        computed,
                    },
                });
            }
            let register = ctx
                .registry
                .get(tx.tx_type)
                .ok_or(BlockVerifyError::UnregisteredType { tx_type: tx.tx_type })?;
            entries.push(Entry {
                tx,
                register,
                wire: wire.clone(),
            });
        }
        let hashes: Vec<TxHash> = entries.iter().map(|e| e.tx.hash()).collect();
        if !header.matches(&hashes) {
            return Err(BlockVerifyError::HeaderMismatch);
        }

        // 2. Duplicates and singletons.
        let mut seen = HashSet::with_capacity(entries.len());
        let mut singletons = HashSet::new();
        for entry in &entries {
            let hash = entry.tx.hash();
            if !seen.insert(hash) {
                return Err(BlockVerifyError::DuplicateTransaction { hash });
            }
            if entry.register.singleton && !singletons.insert(entry.tx.tx_type) {
                return Err(BlockVerifyError::DuplicateSingleton {
                    tx_type: entry.tx.tx_type,
                });
            }
        }

        // 3. Already confirmed.
        let mut unknown = Vec::new();
        for entry in &entries {
            let hash = entry.tx.hash();
            if ctx.confirmed.exists(&hash)? {
                return Err(BlockVerifyError::AlreadyConfirmed { hash });
            }
            if ctx.unconfirmed.get(&hash)?.as_ref() != Some(&entry.tx) {
                unknown.push(entry);
            }
        }

        // 4. Parallel structural validation of unknown transactions.
        debug!(
            height = header.height,
            unknown = unknown.len(),
            total = entries.len(),
            "validating unseen transactions"
        );
        let config = &ctx.config;
        ctx.workers.install(|| {
            unknown.par_iter().try_for_each(|entry| {
                validate_structure(&entry.tx, &entry.register, config, header.height).map_err(
                    |source| BlockVerifyError::Invalid {
                        hash: entry.tx.hash(),
                        source,
                    },
                )
            })
        })?;

        // 5. Ledger, in block order, over everything the modules did not
        // generate.
        let originals: Vec<&Entry> = entries
            .iter()
            .filter(|e| !e.register.module_generated)
            .collect();
        ctx.ledger.begin_batch_session()?;
        let batch_size = config.package.batch_size.max(1);
        for chunk in originals.chunks(batch_size) {
            let wires: Vec<Vec<u8>> = chunk.iter().map(|e| e.wire.clone()).collect();
            let verdict = ctx.ledger.verify_coin_data_batch(&wires)?;
            if let Some(hash) = verdict.fail.first() {
                return Err(BlockVerifyError::LedgerRejected { hash: *hash });
            }
            if let Some(hash) = verdict.orphan.first() {
                return Err(BlockVerifyError::LedgerOrphan { hash: *hash });
            }
        }

        // 6. Modules.
        let block_ctx = BlockContext {
            height: header.height,
            block_time: header.time,
            pre_state_root,
        };
        let mut groups = ModuleVerifyMap::new();
        for entry in &originals {
            groups
                .entry(entry.register.module.clone())
                .or_default()
                .push(entry.wire.clone());
        }
        let execution = ctx.registry.execute_groups(&groups, &block_ctx)?;
        if let Some(hash) = execution.rejected.first() {
            return Err(BlockVerifyError::ModuleRejected { hash: *hash });
        }
        if let Some(hash) = ctx.registry.validate_groups(&groups, &block_ctx)?.first() {
            return Err(BlockVerifyError::ModuleRejected { hash: *hash });
        }

        // 7. State root.
        if execution.state_root != header.state_root {
            return Err(BlockVerifyError::StateRootMismatch {
                declared: header.state_root,
                computed: execution.state_root,
            });
        }

        // 8. Generated transactions must be reproducible. Modules see the
        // same inputs the packager gave them, minus whatever was consumed.
        let mut produce_groups = ModuleVerifyMap::new();
        for entry in originals.iter().filter(|e| e.register.pack_produce) {
            produce_groups
                .entry(entry.register.module.clone())
                .or_default()
                .push(entry.wire.clone());
        }
        let produced = if produce_groups.is_empty() {
            Default::default()
        } else {
            ctx.registry
                .produce_groups(&produce_groups, &block_ctx, ProducePhase::Verify)?
        };

        if let Some(hash) = produced.removed.iter().find(|h| seen.contains(h)) {
            return Err(BlockVerifyError::RemovedPresent { hash: *hash });
        }

        let mut expected: HashMap<TxHash, usize> = HashMap::new();
        for wire in execution.generated.iter().chain(produced.generated.iter()) {
            *expected.entry(Transaction::from_wire(wire)?.hash()).or_default() += 1;
        }
        let mut found: HashMap<TxHash, usize> = HashMap::new();
        for entry in entries.iter().filter(|e| e.register.module_generated) {
            *found.entry(entry.tx.hash()).or_default() += 1;
        }
        if expected != found {
            return Err(BlockVerifyError::GeneratedMismatch {
                expected: expected.values().sum(),
                found: found.values().sum(),
            });
        }

        info!(
            height = header.height,
            block_hash = %header.hash_hex(),
            txs = entries.len(),
            "block transactions verified"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChainConfig;
    use crate::ledger::MemoryLedger;
    use crate::registry::{ExecutionOutcome, ModuleHandler, ProduceOutcome, Registry};
    use crate::storage::TxStore;
    use crate::transaction::builder::TransactionBuilder;
    use crate::transaction::signing::{SignatureBundle, SignatureEntry};
    use crate::transaction::types::{tx_types, Address, AssetId, CoinFrom, CoinTo, LockKind, Nonce};

    const BLOCK_TIME: u64 = 1_700_000_000;

    fn verifier() -> BlockVerifier {
        let ctx = ChainContext::builder(ChainConfig::default())
            .ledger(Arc::new(MemoryLedger::new()))
            .build()
            .unwrap();
        BlockVerifier::new(Arc::new(ctx))
    }

    fn plain(tag: u8) -> Transaction {
        TransactionBuilder::new(tx_types::TRANSFER)
            .time(BLOCK_TIME)
            .remark(vec![tag])
            .build()
    }

    fn coinbase(tag: u8) -> Transaction {
        TransactionBuilder::new(tx_types::COIN_BASE)
            .time(BLOCK_TIME)
            .remark(vec![tag])
            .build()
    }

    /// Store txs as already admitted so structural validation is skipped.
    fn known(v: &BlockVerifier, txs: &[Transaction]) {
        for tx in txs {
            v.ctx.unconfirmed.put(tx).unwrap();
        }
    }

    fn block(txs: &[Transaction], state_root: Option<[u8; 32]>) -> (Vec<Vec<u8>>, BlockHeader) {
        let wires = txs.iter().map(|t| t.to_wire().unwrap()).collect();
        let hashes: Vec<TxHash> = txs.iter().map(Transaction::hash).collect();
        let header = BlockHeader::new(1, [0u8; 32], BLOCK_TIME, "peer".into(), state_root, &hashes);
        (wires, header)
    }

    struct Bump;

    impl ModuleHandler for Bump {
        fn validate(&self, _txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
            Ok(Vec::new())
        }

        fn execute(
            &self,
            _txs: &[Vec<u8>],
            _ctx: &BlockContext,
            mut state_root: [u8; 32],
        ) -> Result<Option<ExecutionOutcome>, ModuleError> {
            state_root[31] ^= 0xff;
            Ok(Some(ExecutionOutcome {
                state_root,
                generated: Vec::new(),
                rejected: Vec::new(),
            }))
        }
    }

    // -- 1. Accept ----------------------------------------------------------

    #[test]
    fn test_known_block_verifies() {
        let v = verifier();
        let txs = vec![coinbase(0), plain(1), plain(2)];
        known(&v, &txs);
        let (wires, header) = block(&txs, None);
        v.verify_block_transactions(&wires, &header, [0u8; 32]).unwrap();
    }

    #[test]
    fn test_state_root_recomputed() {
        let v = verifier();
        v.ctx.registry.register_module(
            crate::config::MODULE_TRANSACTION,
            vec![TxRegister::new(tx_types::TRANSFER, "")],
            Arc::new(Bump),
        );
        let txs = vec![plain(1)];
        known(&v, &txs);
        let mut root = [0u8; 32];
        root[31] = 0xff;
        let (wires, header) = block(&txs, Some(root));
        v.verify_block_transactions(&wires, &header, [0u8; 32]).unwrap();
    }

    // -- 2. Reject ----------------------------------------------------------

    #[test]
    fn test_header_mismatch() {
        let v = verifier();
        let txs = vec![plain(1), plain(2)];
        known(&v, &txs);
        let (wires, _) = block(&txs, None);
        let (_, other_header) = block(&txs[..1], None);
        match v.verify_block_transactions(&wires, &other_header, [0u8; 32]) {
            Err(BlockVerifyError::HeaderMismatch) => {}
            other => panic!("expected HeaderMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_two_coinbases_rejected() {
        let v = verifier();
        let txs = vec![coinbase(0), coinbase(1)];
        known(&v, &txs);
        let (wires, header) = block(&txs, None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::DuplicateSingleton {
                tx_type: tx_types::COIN_BASE,
            }) => {}
            other => panic!("expected DuplicateSingleton, got {:?}", other),
        }
    }

    #[test]
    fn test_confirmed_tx_rejected() {
        let v = verifier();
        let txs = vec![plain(1)];
        v.ctx.confirmed.put(&txs[0]).unwrap();
        let (wires, header) = block(&txs, None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::AlreadyConfirmed { .. }) => {}
            other => panic!("expected AlreadyConfirmed, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tampered_tx_rejected() {
        let v = verifier();
        let mut tampered = plain(1);
        tampered.remark = vec![42];
        let (wires, header) = block(&[tampered], None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::Invalid {
                source: ValidationError::HashMismatch { .. },
                ..
            }) => {}
            other => panic!("expected Invalid(HashMismatch), got {:?}", other),
        }
    }

    #[test]
    fn test_known_hash_with_altered_payee_rejected() {
        let v = verifier();
        let honest = TransactionBuilder::new(tx_types::TRANSFER)
            .time(BLOCK_TIME)
            .to(CoinTo {
                address: Address::from_public_key(1, &[7u8; 32]),
                asset: AssetId::new(1, 1),
                amount: 500,
                lock_time: 0,
            })
            .build();
        known(&v, std::slice::from_ref(&honest));

        let mut forged = honest.clone();
        forged.coin_data.to[0].address = Address::from_public_key(1, &[8u8; 32]);
        forged.coin_data.to[0].amount = 1;
        assert_eq!(forged.hash(), honest.hash());

        let (wires, header) = block(&[forged], None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::Invalid {
                source: ValidationError::HashMismatch { .. },
                ..
            }) => {}
            other => panic!("expected Invalid(HashMismatch), got {:?}", other),
        }
    }

    #[test]
    fn test_known_hash_with_swapped_signature_revalidated() {
        let v = verifier();
        let stored = plain(1);
        known(&v, std::slice::from_ref(&stored));

        let mut swapped = stored.clone();
        swapped.signature = Some(SignatureBundle::Single(vec![SignatureEntry {
            public_key: [9u8; 32],
            signature: vec![0u8; 64],
        }]));
        assert_eq!(swapped.hash(), swapped.compute_hash());

        let (wires, header) = block(&[swapped], None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::Invalid { .. }) => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_ledger_failure_rejects_block() {
        let v = verifier();
        let broke = TransactionBuilder::new(tx_types::TRANSFER)
            .time(BLOCK_TIME)
            .from(CoinFrom {
                address: Address::from_public_key(1, &[1u8; 32]),
                asset: AssetId::new(1, 1),
                amount: 10,
                nonce: Nonce::GENESIS,
                lock: LockKind::Ordinary,
            })
            .build();
        known(&v, std::slice::from_ref(&broke));
        let (wires, header) = block(&[broke], None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::LedgerRejected { .. }) => {}
            other => panic!("expected LedgerRejected, got {:?}", other),
        }
    }

    #[test]
    fn test_state_root_mismatch() {
        let v = verifier();
        v.ctx.registry.register_module(
            crate::config::MODULE_TRANSACTION,
            vec![TxRegister::new(tx_types::TRANSFER, "")],
            Arc::new(Bump),
        );
        let txs = vec![plain(1)];
        known(&v, &txs);
        let (wires, header) = block(&txs, Some([0u8; 32]));
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::StateRootMismatch { .. }) => {}
            other => panic!("expected StateRootMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_unexplained_generated_tx_rejected() {
        let v = verifier();
        let registry: &Registry = &v.ctx.registry;
        struct Silent;
        impl ModuleHandler for Silent {
            fn validate(&self, _txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
                Ok(Vec::new())
            }
        }
        registry.register_module(
            crate::config::MODULE_CONTRACT,
            vec![TxRegister::generated(tx_types::CONTRACT_RETURN_GAS, "")],
            Arc::new(Silent),
        );
        let refund = TransactionBuilder::new(tx_types::CONTRACT_RETURN_GAS)
            .time(BLOCK_TIME)
            .build();
        known(&v, std::slice::from_ref(&refund));
        let (wires, header) = block(&[refund], None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::GeneratedMismatch {
                expected: 0,
                found: 1,
            }) => {}
            other => panic!("expected GeneratedMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_consumed_input_in_block_rejected() {
        let v = verifier();
        struct Consume;
        impl ModuleHandler for Consume {
            fn validate(&self, _txs: &[Vec<u8>], _ctx: &BlockContext) -> Result<Vec<TxHash>, ModuleError> {
                Ok(Vec::new())
            }

            fn pack_produce(
                &self,
                txs: &[Vec<u8>],
                _ctx: &BlockContext,
                _phase: ProducePhase,
            ) -> Result<ProduceOutcome, ModuleError> {
                let removed = txs
                    .iter()
                    .filter_map(|w| Transaction::from_wire(w).ok())
                    .map(|t| t.hash())
                    .collect();
                Ok(ProduceOutcome {
                    generated: Vec::new(),
                    removed,
                })
            }
        }
        v.ctx.registry.register_module(
            crate::config::MODULE_CONTRACT,
            vec![TxRegister {
                pack_produce: true,
                ..TxRegister::new(tx_types::CALL_CONTRACT, "")
            }],
            Arc::new(Consume),
        );
        let call = TransactionBuilder::new(tx_types::CALL_CONTRACT)
            .time(BLOCK_TIME)
            .build();
        known(&v, std::slice::from_ref(&call));
        let (wires, header) = block(std::slice::from_ref(&call), None);
        match v.verify_block_transactions(&wires, &header, [0u8; 32]) {
            Err(BlockVerifyError::RemovedPresent { hash }) => assert_eq!(hash, call.hash()),
            other => panic!("expected RemovedPresent, got {:?}", other),
        }
    }
}
