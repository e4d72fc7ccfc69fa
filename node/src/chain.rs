//! # Chain Runner
//!
//! Wires one chain's pipeline to sled storage and drives packaging rounds.
//! A round packages a candidate block, commits it locally when it carries
//! transactions, and persists its header.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use kiln_protocol::ledger::{CommitOutcome, Ledger, MemoryLedger};
use kiln_protocol::network::{
    BlockPackager, ChainContext, Clock, PackOutcome, PackageRequest, SystemClock, TxService,
};
use kiln_protocol::storage::{BlockHeader, KilnDB, TxStore};
use kiln_protocol::transaction::{Transaction, TxHash};

use crate::config::NodeConfig;
use crate::metrics::NodeMetrics;

/// One chain instance with its storage, intake and packager.
pub struct ChainRunner {
    ctx: Arc<ChainContext>,
    service: TxService,
    packager: BlockPackager,
    db: KilnDB,
    metrics: Arc<NodeMetrics>,
    packer: String,
    interval_ms: u64,
    max_block_bytes: usize,
}

impl ChainRunner {
    /// Build the chain context over `db`, mint genesis balances and reload
    /// whatever was still unconfirmed when the node last stopped.
    pub fn open(config: &NodeConfig, db: KilnDB, metrics: Arc<NodeMetrics>) -> Result<Self> {
        Self::open_with_clock(config, db, metrics, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: &NodeConfig,
        db: KilnDB,
        metrics: Arc<NodeMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ledger = Arc::new(MemoryLedger::new());
        for account in &config.genesis {
            let asset = account.asset.unwrap_or(config.chain.main_asset);
            ledger.credit(account.address, asset, u128::from(account.amount));
        }

        let best_height = db.best_height().context("failed to read best height")?;
        let ctx = ChainContext::builder(config.chain.clone())
            .unconfirmed_store(Arc::new(db.unconfirmed()))
            .confirmed_store(Arc::new(db.confirmed()))
            .ledger(ledger.clone())
            .clock(clock)
            .best_height(best_height)
            .build()
            .context("failed to build chain context")?;
        let ctx = Arc::new(ctx);

        let runner = Self {
            service: TxService::new(ctx.clone()),
            packager: BlockPackager::new(ctx.clone()),
            ctx,
            db,
            metrics,
            packer: config.node.packer.clone(),
            interval_ms: config.node.block_interval_ms,
            max_block_bytes: config.node.max_block_bytes,
        };
        runner.restore_unconfirmed(ledger.as_ref())?;
        runner.metrics.block_height.set(best_height as i64);
        Ok(runner)
    }

    pub fn context(&self) -> &Arc<ChainContext> {
        &self.ctx
    }

    /// Re-admit stored unconfirmed transactions. The store iterates in hash
    /// order, so chained spends are retried until no pass makes progress.
    fn restore_unconfirmed(&self, ledger: &dyn Ledger) -> Result<()> {
        let store = self.db.unconfirmed();
        let mut pending = store
            .load_all()
            .context("failed to load unconfirmed transactions")?;
        let total = pending.len();
        let mut restored = 0usize;

        loop {
            let before = pending.len();
            let mut waiting = Vec::new();
            for tx in pending {
                match ledger.commit_unconfirmed(&tx)? {
                    CommitOutcome::Success => {
                        if self.ctx.mempool.add(tx.clone()) {
                            restored += 1;
                        } else {
                            warn!(tx_hash = %tx.hash(), "mempool full, dropping stored transaction");
                            ledger.rollback(&tx)?;
                            store.remove(&tx.hash())?;
                        }
                    }
                    CommitOutcome::Orphan => waiting.push(tx),
                    CommitOutcome::Fail(reason) => {
                        debug!(tx_hash = %tx.hash(), %reason, "dropping stale unconfirmed transaction");
                        store.remove(&tx.hash())?;
                    }
                }
            }
            pending = waiting;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        // Whatever is still orphaned has lost its predecessor for good.
        for tx in &pending {
            store.remove(&tx.hash())?;
        }

        if total > 0 {
            info!(total, restored, dropped = total - restored, "unconfirmed transactions reloaded");
        }
        self.metrics.mempool_depth.set(self.ctx.mempool.record_len() as i64);
        Ok(())
    }

    /// One packaging round. Returns the committed header, or `None` when
    /// the round produced nothing to commit.
    pub fn package_round(&self) -> Result<Option<BlockHeader>> {
        let started = Instant::now();
        let now = self.ctx.now_millis();
        let height = self.ctx.best_height() + 1;
        let parent = self
            .db
            .get_header(height - 1)
            .context("failed to read parent header")?;
        let request = PackageRequest {
            end_timestamp_ms: now + self.interval_ms,
            max_tx_data_size: self.max_block_bytes,
            block_time: now / 1_000,
            pre_state_root: parent
                .as_ref()
                .and_then(|h| h.state_root)
                .unwrap_or([0u8; 32]),
        };

        let outcome = self.packager.package_basic(&request);
        self.metrics
            .packaging_latency_seconds
            .observe(started.elapsed().as_secs_f64());
        self.metrics
            .mempool_depth
            .set(self.ctx.mempool.record_len() as i64);

        let block = match outcome {
            Ok(PackOutcome::Packed(block)) => block,
            Ok(PackOutcome::Empty(reason)) => {
                debug!(height, ?reason, "empty packaging round");
                self.metrics.record_empty(reason);
                return Ok(None);
            }
            Err(e) => {
                self.metrics.packaging_failures_total.inc();
                warn!(height, error = %e, "packaging round failed");
                return Ok(None);
            }
        };
        if block.transactions.is_empty() {
            return Ok(None);
        }

        let hashes: Vec<TxHash> = block.transactions.iter().map(Transaction::hash).collect();
        let header = BlockHeader::new(
            height,
            parent.map_or([0u8; 32], |h| h.hash),
            request.block_time,
            self.packer.clone(),
            block.state_root,
            &hashes,
        );
        self.service
            .commit_block(&header, &block.transactions)
            .with_context(|| format!("failed to commit block {height}"))?;
        self.db
            .put_header(&header)
            .with_context(|| format!("failed to persist header {height}"))?;

        self.metrics.blocks_packaged_total.inc();
        self.metrics
            .transactions_packaged_total
            .inc_by(block.transactions.len() as u64);
        self.metrics.block_height.set(height as i64);
        self.metrics
            .mempool_depth
            .set(self.ctx.mempool.record_len() as i64);
        Ok(Some(header))
    }

    /// Stop accepting and packaging, then flush storage.
    pub fn shutdown(&self) -> Result<()> {
        self.ctx.set_accepting(false);
        self.ctx.set_packaging(false);
        self.db.flush().context("failed to flush database")?;
        info!(height = self.ctx.best_height(), "chain stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenesisAccount;
    use kiln_protocol::crypto::KilnKeypair;
    use kiln_protocol::network::{ManualClock, SubmitOutcome};
    use kiln_protocol::transaction::{
        sign_transaction, tx_types, Address, CoinFrom, CoinTo, LockKind, Nonce,
        TransactionBuilder,
    };

    const NOW_MS: u64 = 1_700_000_000_000;

    fn alice() -> KilnKeypair {
        KilnKeypair::from_seed(&[5u8; 32])
    }

    fn address(key: &KilnKeypair) -> Address {
        Address::from_public_key(1, &key.public_key_bytes())
    }

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.chain.intake.broadcast_backoff_ms = 0;
        config.chain.verify_workers = 1;
        config.genesis.push(GenesisAccount {
            address: address(&alice()),
            asset: None,
            amount: 100_000_000,
        });
        config
    }

    fn spend(nonce: Nonce, tag: u8) -> Transaction {
        let key = alice();
        let mut tx = TransactionBuilder::new(tx_types::TRANSFER)
            .time(NOW_MS / 1_000)
            .remark(vec![tag])
            .from(CoinFrom {
                address: address(&key),
                asset: config().chain.main_asset,
                amount: 1_000_000,
                nonce,
                lock: LockKind::Ordinary,
            })
            .to(CoinTo {
                address: Address::from_public_key(1, &[0xb0; 32]),
                asset: config().chain.main_asset,
                amount: 500_000,
                lock_time: 0,
            })
            .build();
        sign_transaction(&mut tx, &key);
        tx
    }

    fn runner(db: KilnDB) -> ChainRunner {
        ChainRunner::open_with_clock(
            &config(),
            db,
            Arc::new(NodeMetrics::new().unwrap()),
            Arc::new(ManualClock::new(NOW_MS)),
        )
        .unwrap()
    }

    #[test]
    fn test_round_commits_and_persists_header() {
        let db = KilnDB::open_temporary().unwrap();
        let runner = runner(db.clone());
        let tx = spend(Nonce::GENESIS, 0);
        assert_eq!(runner.service.submit(tx.clone()).unwrap(), SubmitOutcome::Accepted);

        let header = runner.package_round().unwrap().expect("block");
        assert_eq!(header.height, 1);
        assert!(header.matches(&[tx.hash()]));
        assert_eq!(db.best_height().unwrap(), 1);
        assert_eq!(db.get_header(1).unwrap(), Some(header.clone()));
        assert!(db.confirmed().exists(&tx.hash()).unwrap());
        assert!(!db.unconfirmed().exists(&tx.hash()).unwrap());
        assert_eq!(runner.metrics.blocks_packaged_total.get(), 1);
        assert_eq!(runner.metrics.transactions_packaged_total.get(), 1);

        // Next block links to the previous one.
        let next = spend(Nonce::from_hash(&tx.hash()), 1);
        runner.service.submit(next).unwrap();
        let second = runner.package_round().unwrap().expect("block");
        assert_eq!(second.height, 2);
        assert_eq!(second.parent_hash, header.hash);
    }

    #[test]
    fn test_empty_pool_commits_nothing() {
        let db = KilnDB::open_temporary().unwrap();
        let runner = runner(db.clone());
        assert_eq!(runner.package_round().unwrap(), None);
        assert_eq!(db.best_height().unwrap(), 0);
        assert_eq!(runner.metrics.blocks_packaged_total.get(), 0);
    }

    #[test]
    fn test_disabled_packaging_counts_empty_round() {
        let db = KilnDB::open_temporary().unwrap();
        let runner = runner(db);
        runner.context().set_packaging(false);
        assert_eq!(runner.package_round().unwrap(), None);
        assert_eq!(
            runner
                .metrics
                .empty_rounds_total
                .with_label_values(&["packaging_disabled"])
                .get(),
            1
        );
    }

    #[test]
    fn test_restart_reloads_chained_unconfirmed() {
        let dir = tempfile::tempdir().unwrap();
        let first = spend(Nonce::GENESIS, 0);
        let second = spend(Nonce::from_hash(&first.hash()), 1);
        {
            let runner = runner(KilnDB::open(dir.path()).unwrap());
            runner.service.submit(first.clone()).unwrap();
            runner.service.submit(second.clone()).unwrap();
            runner.shutdown().unwrap();
        }

        let runner = runner(KilnDB::open(dir.path()).unwrap());
        assert_eq!(runner.context().mempool.record_len(), 2);
        let header = runner.package_round().unwrap().expect("block");
        assert!(header.matches(&[first.hash(), second.hash()]));
    }
}
