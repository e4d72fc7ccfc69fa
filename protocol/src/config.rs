//! # Chain Configuration & Constants
//!
//! Every magic number of the intake and packaging pipeline lives here,
//! together with [`ChainConfig`], the per-chain bundle of those numbers
//! that the node loads from TOML. The constants are the defaults; the
//! config is what the code actually reads.
//!
//! Timing constants are in milliseconds unless the name says otherwise.
//! Transaction and block times are Unix seconds, packaging deadlines are
//! Unix milliseconds. Mixing the two is the classic way to produce a block
//! that is either a thousand times too early or never.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::mempool::MempoolConfig;
use crate::transaction::types::{tx_types, Address, AssetId};

// ---------------------------------------------------------------------------
// Chain Identity
// ---------------------------------------------------------------------------

/// Chain id used when none is configured.
pub const DEFAULT_CHAIN_ID: u16 = 1;

/// The asset fees are paid in: asset 1 of the local chain.
pub const DEFAULT_MAIN_ASSET: AssetId = AssetId::new(DEFAULT_CHAIN_ID, 1);

/// Module codes the pipeline needs to recognise by name.
pub const MODULE_CONSENSUS: &str = "cs";
pub const MODULE_CROSS_CHAIN: &str = "cc";
pub const MODULE_CONTRACT: &str = "sc";
pub const MODULE_TRANSACTION: &str = "tx";

// ---------------------------------------------------------------------------
// Transaction Limits
// ---------------------------------------------------------------------------

/// Hard ceiling on a single transaction's wire size: 300 KiB. Contract
/// deployments are the only thing that ever gets close.
pub const MAX_TX_SIZE_BYTES: usize = 300 * 1024;

/// Largest amount a single coin leg may carry.
pub const MAX_COIN_AMOUNT: u128 = 1_000_000_000_000_000_000_000_000_000;

/// Fee per started KiB of wire size, in the main asset's smallest unit.
pub const FEE_UNIT_PER_KB: u128 = 100_000;

/// How far into the future a transaction timestamp may be: 10 minutes.
pub const MAX_FUTURE_TIME_SECS: u64 = 600;

// ---------------------------------------------------------------------------
// Packaging
// ---------------------------------------------------------------------------

/// Below this much remaining time, packaging does not even start.
pub const PACKAGE_RESERVE_MS: u64 = 500;

/// Trailing margin kept free for block assembly and the RPC reply.
pub const PACKAGE_RPC_RESERVE_MS: u64 = 200;

/// Time held back after collection for module validation rounds.
pub const PACKAGE_MODULE_RESERVE_MS: u64 = 300;

/// Upper bound on transactions drained from the mempool per attempt.
pub const PACKAGE_TX_MAX_COUNT: usize = 10_000;

/// Transactions per ledger batch-verification call.
pub const VERIFY_BATCH_SIZE: usize = 2_000;

/// A consensus-module transaction must be within this many seconds of the
/// target block time.
pub const CONSENSUS_TX_WINDOW_SECS: u64 = 600;

/// Cross-chain transactions per block.
pub const CROSS_CHAIN_TX_PER_BLOCK: usize = 500;

/// Orphan results tolerated per transaction before it is discarded.
pub const ORPHAN_MAX_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Intake
// ---------------------------------------------------------------------------

/// Broadcast attempts per admitted transaction.
pub const BROADCAST_ATTEMPTS: u32 = 3;

/// Fixed pause between broadcast attempts.
pub const BROADCAST_BACKOFF_MS: u64 = 1_000;

/// How long a recently seen hash suppresses rebroadcast echoes.
pub const RECENT_TX_TTL_SECS: u64 = 60;

/// Capacity of the recent-hash filter before old entries are evicted.
pub const RECENT_TX_CAPACITY: usize = 100_000;

// ---------------------------------------------------------------------------
// ChainConfig
// ---------------------------------------------------------------------------

/// Errors from [`ChainConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("main asset {asset} does not belong to chain {chain_id}")]
    ForeignMainAsset { asset: AssetId, chain_id: u16 },
}

/// Packaging knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    pub reserve_ms: u64,
    pub rpc_reserve_ms: u64,
    pub module_reserve_ms: u64,
    pub max_tx_count: usize,
    pub batch_size: usize,
    pub consensus_window_secs: u64,
    pub cross_chain_max_per_block: usize,
    pub orphan_max_retries: u32,
    /// Bytes of the size budget held back for module-generated
    /// transactions.
    pub module_output_reserve: usize,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            reserve_ms: PACKAGE_RESERVE_MS,
            rpc_reserve_ms: PACKAGE_RPC_RESERVE_MS,
            module_reserve_ms: PACKAGE_MODULE_RESERVE_MS,
            max_tx_count: PACKAGE_TX_MAX_COUNT,
            batch_size: VERIFY_BATCH_SIZE,
            consensus_window_secs: CONSENSUS_TX_WINDOW_SECS,
            cross_chain_max_per_block: CROSS_CHAIN_TX_PER_BLOCK,
            orphan_max_retries: ORPHAN_MAX_RETRIES,
            module_output_reserve: 0,
        }
    }
}

/// Intake knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    pub broadcast_attempts: u32,
    pub broadcast_backoff_ms: u64,
    pub recent_ttl_secs: u64,
    pub recent_capacity: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            broadcast_attempts: BROADCAST_ATTEMPTS,
            broadcast_backoff_ms: BROADCAST_BACKOFF_MS,
            recent_ttl_secs: RECENT_TX_TTL_SECS,
            recent_capacity: RECENT_TX_CAPACITY,
        }
    }
}

/// Everything one chain instance needs to know about its own rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub chain_id: u16,
    pub main_asset: AssetId,
    pub max_tx_size: usize,
    pub max_coin_amount: u128,
    pub fee_unit_per_kb: u128,
    pub max_future_time_secs: u64,
    /// From this height on, zero-amount credit legs are rejected.
    pub zero_amount_forbidden_height: u64,
    /// Addresses whose funds are frozen.
    pub locked_addresses: Vec<Address>,
    /// The only transaction types allowed to credit a contract address.
    pub contract_accepted_types: Vec<u16>,
    pub consensus_module: String,
    pub cross_chain_module: String,
    /// Block-verification worker threads. 0 means one per CPU.
    pub verify_workers: usize,
    pub mempool: MempoolConfig,
    pub package: PackageConfig,
    pub intake: IntakeConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: DEFAULT_CHAIN_ID,
            main_asset: DEFAULT_MAIN_ASSET,
            max_tx_size: MAX_TX_SIZE_BYTES,
            max_coin_amount: MAX_COIN_AMOUNT,
            fee_unit_per_kb: FEE_UNIT_PER_KB,
            max_future_time_secs: MAX_FUTURE_TIME_SECS,
            zero_amount_forbidden_height: 0,
            locked_addresses: Vec::new(),
            contract_accepted_types: vec![
                tx_types::CALL_CONTRACT,
                tx_types::CONTRACT_TRANSFER,
                tx_types::CROSS_CHAIN,
            ],
            consensus_module: MODULE_CONSENSUS.to_string(),
            cross_chain_module: MODULE_CROSS_CHAIN.to_string(),
            verify_workers: 0,
            mempool: MempoolConfig::default(),
            package: PackageConfig::default(),
            intake: IntakeConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Default config for another chain id, main asset included.
    pub fn for_chain(chain_id: u16) -> Self {
        Self {
            chain_id,
            main_asset: AssetId::new(chain_id, 1),
            ..Self::default()
        }
    }

    /// Reject configurations that would make the pipeline spin or divide
    /// by zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_tx_size", self.max_tx_size),
            ("mempool.max_size", self.mempool.max_size),
            ("package.max_tx_count", self.package.max_tx_count),
            ("package.batch_size", self.package.batch_size),
            (
                "intake.broadcast_attempts",
                self.intake.broadcast_attempts as usize,
            ),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.main_asset.chain_id != self.chain_id {
            return Err(ConfigError::ForeignMainAsset {
                asset: self.main_asset,
                chain_id: self.chain_id,
            });
        }
        Ok(())
    }

    /// Worker count for the verification pool.
    pub fn effective_verify_workers(&self) -> usize {
        if self.verify_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.verify_workers
        }
    }

    pub fn is_locked(&self, address: &Address) -> bool {
        self.locked_addresses.contains(address)
    }
}
