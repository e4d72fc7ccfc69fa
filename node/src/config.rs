//! # Node Configuration
//!
//! The node reads one TOML file with three parts:
//!
//! ```toml
//! [node]
//! data_dir = "./kiln-data"
//! metrics_port = 9742
//! block_interval_ms = 2000
//! max_block_bytes = 2097152
//! packer = "node-1"
//!
//! [chain]
//! chain_id = 1
//! verify_workers = 0
//!
//! [chain.package]
//! batch_size = 2000
//!
//! [[genesis]]
//! address = "<base58 address>"
//! amount = 100000000000
//! ```
//!
//! Every key is optional; missing ones take the protocol defaults. CLI
//! flags override the file afterwards.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use kiln_protocol::config::ChainConfig;
use kiln_protocol::transaction::{Address, AssetId};

/// Default Prometheus port.
pub const DEFAULT_METRICS_PORT: u16 = 9742;

/// Default time between packaging rounds.
pub const DEFAULT_BLOCK_INTERVAL_MS: u64 = 2_000;

/// Default byte budget for one block's transaction list.
pub const DEFAULT_MAX_BLOCK_BYTES: usize = 2 * 1024 * 1024;

/// Config file written by `kiln-node init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Kiln node configuration.
# Every key is optional; omitted keys take the protocol defaults.

[node]
data_dir = "./kiln-data"
metrics_port = 9742
block_interval_ms = 2000
max_block_bytes = 2097152
packer = "kiln-node"

[chain]
chain_id = 1
# 0 means one block-verification worker per CPU.
verify_workers = 0

[chain.mempool]
max_size = 100000

[chain.package]
batch_size = 2000
orphan_max_retries = 5

[chain.intake]
broadcast_attempts = 3
broadcast_backoff_ms = 1000
"#;

/// Settings of this process, as opposed to the chain's rules.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: PathBuf,
    pub metrics_port: u16,
    pub block_interval_ms: u64,
    pub max_block_bytes: usize,
    /// Recorded as the packer of every block this node assembles.
    pub packer: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./kiln-data"),
            metrics_port: DEFAULT_METRICS_PORT,
            block_interval_ms: DEFAULT_BLOCK_INTERVAL_MS,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            packer: "kiln-node".to_string(),
        }
    }
}

/// A balance minted into the in-memory ledger at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GenesisAccount {
    pub address: Address,
    /// Defaults to the chain's main asset.
    pub asset: Option<AssetId>,
    pub amount: u64,
}

/// Everything in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub chain: ChainConfig,
    pub genesis: Vec<GenesisAccount>,
}

impl NodeConfig {
    /// Parse a TOML document and validate the chain section.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(text).context("invalid node configuration")?;
        config.chain.validate().context("invalid chain configuration")?;
        if config.node.block_interval_ms == 0 {
            anyhow::bail!("node.block_interval_ms must be greater than zero");
        }
        Ok(config)
    }

    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Load `path` when given, otherwise `config.toml` inside `data_dir` if
    /// it exists, otherwise defaults.
    pub fn resolve(path: Option<&Path>, data_dir: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Some(dir) = data_dir {
            let candidate = dir.join("config.toml");
            if candidate.exists() {
                return Self::load(&candidate);
            }
        }
        Ok(Self::default())
    }
}
