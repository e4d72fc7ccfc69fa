//! # CLI Interface
//!
//! Command-line arguments for `kiln-node`, via `clap` derive. Three
//! subcommands: `run`, `init` and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Kiln block packaging node.
///
/// Accepts transactions into a mempool and assembles a candidate block
/// from it on a fixed interval, exposing Prometheus metrics while it runs.
#[derive(Parser, Debug)]
#[command(
    name = "kiln-node",
    about = "Kiln block packaging node",
    version,
    propagate_version = true
)]
pub struct KilnNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Create a data directory with a default `config.toml`.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for `run`. Flags override the config file.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    ///
    /// When omitted, the node looks for `config.toml` in the data directory.
    #[arg(long, short = 'c', env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory holding the transaction stores and block headers.
    #[arg(long, short = 'd', env = "KILN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "KILN_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Milliseconds between packaging rounds.
    #[arg(long, env = "KILN_BLOCK_INTERVAL_MS")]
    pub block_interval_ms: Option<u64>,

    /// Byte budget of one block's transaction list.
    #[arg(long, env = "KILN_MAX_BLOCK_BYTES")]
    pub max_block_bytes: Option<usize>,

    /// Log output format.
    #[arg(long, value_enum, env = "KILN_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "kiln_node=info,kiln_protocol=info")]
    pub log_level: String,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Data directory to initialize.
    #[arg(long, short = 'd', env = "KILN_DATA_DIR", default_value = "./kiln-data")]
    pub data_dir: PathBuf,

    /// Overwrite an existing `config.toml`.
    #[arg(long)]
    pub force: bool,
}
