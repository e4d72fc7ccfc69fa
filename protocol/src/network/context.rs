//! # Chain Context
//!
//! Everything one chain instance owns: its mempool, orphan counters,
//! registry, stores, collaborators and control flags. Every pipeline entry
//! point takes an `Arc<ChainContext>`; there is no process-wide state, so
//! several chains can run side by side in one process.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;
use tracing::info;

use super::gossip::{LoopbackNetwork, Network, RecentTxFilter};
use super::mempool::Mempool;
use super::orphan::OrphanTracker;
use crate::config::{ChainConfig, ConfigError};
use crate::ledger::{Ledger, MemoryLedger};
use crate::registry::Registry;
use crate::storage::{MemoryTxStore, TxStore};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Wall-clock source for deadlines and TTLs.
pub trait Clock: Send + Sync {
    /// Unix milliseconds.
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(now_millis),
        }
    }

    pub fn set(&self, now_millis: u64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// ProtocolSignal
// ---------------------------------------------------------------------------

/// Raised by the upgrade machinery when a protocol version change is
/// pending. The packager checks it between units of work. Clones share the
/// flag.
#[derive(Debug, Clone, Default)]
pub struct ProtocolSignal(Arc<AtomicBool>);

impl ProtocolSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// ChainContext
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("invalid chain config: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to start verification workers: {0}")]
    Workers(#[from] ThreadPoolBuildError),
}

/// Per-chain state shared by intake, packager and verifier.
pub struct ChainContext {
    pub config: ChainConfig,
    pub mempool: Mempool,
    pub orphans: OrphanTracker,
    pub registry: Arc<Registry>,
    pub unconfirmed: Arc<dyn TxStore>,
    pub confirmed: Arc<dyn TxStore>,
    pub ledger: Arc<dyn Ledger>,
    pub network: Arc<dyn Network>,
    pub clock: Arc<dyn Clock>,
    pub recent: RecentTxFilter,
    pub upgrade_signal: ProtocolSignal,
    accepting: AtomicBool,
    packaging: AtomicBool,
    best_height: AtomicU64,
    /// One packaging attempt or block verification at a time.
    pub(crate) package_lock: Mutex<()>,
    /// Structural validation of peer blocks.
    pub(crate) workers: ThreadPool,
}

impl fmt::Debug for ChainContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainContext")
            .field("chain_id", &self.config.chain_id)
            .field("mempool", &self.mempool)
            .field("orphans", &self.orphans.len())
            .field("registry", &self.registry)
            .field("accepting", &self.is_accepting())
            .field("packaging", &self.is_packaging())
            .field("best_height", &self.best_height())
            .finish()
    }
}

impl ChainContext {
    pub fn builder(config: ChainConfig) -> ChainContextBuilder {
        ChainContextBuilder::new(config)
    }

    pub fn chain_id(&self) -> u16 {
        self.config.chain_id
    }

    /// Whether intake currently admits transactions. Cleared during block
    /// sync and rollback.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Whether this node packages blocks, and therefore keeps a mempool.
    pub fn is_packaging(&self) -> bool {
        self.packaging.load(Ordering::SeqCst)
    }

    pub fn set_packaging(&self, packaging: bool) {
        self.packaging.store(packaging, Ordering::SeqCst);
    }

    pub fn best_height(&self) -> u64 {
        self.best_height.load(Ordering::SeqCst)
    }

    pub fn set_best_height(&self, height: u64) {
        self.best_height.store(height, Ordering::SeqCst);
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// Builder for [`ChainContext`]. Anything not supplied gets an in-memory
/// default.
pub struct ChainContextBuilder {
    config: ChainConfig,
    registry: Option<Arc<Registry>>,
    unconfirmed: Option<Arc<dyn TxStore>>,
    confirmed: Option<Arc<dyn TxStore>>,
    ledger: Option<Arc<dyn Ledger>>,
    network: Option<Arc<dyn Network>>,
    clock: Option<Arc<dyn Clock>>,
    best_height: u64,
}

impl ChainContextBuilder {
    fn new(config: ChainConfig) -> Self {
        Self {
            config,
            registry: None,
            unconfirmed: None,
            confirmed: None,
            ledger: None,
            network: None,
            clock: None,
            best_height: 0,
        }
    }

    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn unconfirmed_store(mut self, store: Arc<dyn TxStore>) -> Self {
        self.unconfirmed = Some(store);
        self
    }

    pub fn confirmed_store(mut self, store: Arc<dyn TxStore>) -> Self {
        self.confirmed = Some(store);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn network(mut self, network: Arc<dyn Network>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn best_height(mut self, height: u64) -> Self {
        self.best_height = height;
        self
    }

    pub fn build(self) -> Result<ChainContext, ContextError> {
        self.config.validate()?;

        let workers = self.config.effective_verify_workers();
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kiln-verify-{i}"))
            .build()?;

        let intake = &self.config.intake;
        let recent = RecentTxFilter::new(
            Duration::from_secs(intake.recent_ttl_secs),
            intake.recent_capacity,
        );

        info!(
            chain_id = self.config.chain_id,
            workers,
            mempool_size = self.config.mempool.max_size,
            "chain context ready"
        );

        Ok(ChainContext {
            mempool: Mempool::new(self.config.mempool.clone()),
            orphans: OrphanTracker::new(self.config.package.orphan_max_retries),
            registry: self
                .registry
                .unwrap_or_else(|| Arc::new(Registry::with_builtin_types())),
            unconfirmed: self
                .unconfirmed
                .unwrap_or_else(|| Arc::new(MemoryTxStore::new())),
            confirmed: self
                .confirmed
                .unwrap_or_else(|| Arc::new(MemoryTxStore::new())),
            ledger: self.ledger.unwrap_or_else(|| Arc::new(MemoryLedger::new())),
            network: self
                .network
                .unwrap_or_else(|| Arc::new(LoopbackNetwork::new())),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            recent,
            upgrade_signal: ProtocolSignal::default(),
            accepting: AtomicBool::new(true),
            packaging: AtomicBool::new(true),
            best_height: AtomicU64::new(self.best_height),
            package_lock: Mutex::new(()),
            workers: pool,
            config: self.config,
        })
    }
}
