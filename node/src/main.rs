// Copyright (c) 2026 Kiln Contributors. MIT License.
// See LICENSE for details.

//! # Kiln Node
//!
//! Entry point for the `kiln-node` binary. Parses CLI arguments, loads the
//! TOML config, initializes logging and metrics, and drives packaging
//! rounds for one chain until a shutdown signal arrives.
//!
//! - `run`    : start the node
//! - `init`   : create a data directory with a default config
//! - `version`: print build version information

mod chain;
mod cli;
mod config;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use kiln_protocol::storage::KilnDB;

use chain::ChainRunner;
use cli::{Commands, KilnNodeCli};
use config::{NodeConfig, DEFAULT_CONFIG_TEMPLATE};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KilnNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Apply CLI overrides on top of the loaded file.
fn apply_overrides(config: &mut NodeConfig, args: &cli::RunArgs) {
    if let Some(dir) = &args.data_dir {
        config.node.data_dir = dir.clone();
    }
    if let Some(port) = args.metrics_port {
        config.node.metrics_port = port;
    }
    if let Some(interval) = args.block_interval_ms {
        config.node.block_interval_ms = interval;
    }
    if let Some(bytes) = args.max_block_bytes {
        config.node.max_block_bytes = bytes;
    }
}

async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, args.log_format);

    let mut config = NodeConfig::resolve(args.config.as_deref(), args.data_dir.as_deref())?;
    apply_overrides(&mut config, &args);
    anyhow::ensure!(
        config.node.block_interval_ms > 0,
        "block interval must be greater than zero"
    );

    tracing::info!(
        chain_id = config.chain.chain_id,
        data_dir = %config.node.data_dir.display(),
        metrics_port = config.node.metrics_port,
        block_interval_ms = config.node.block_interval_ms,
        max_block_bytes = config.node.max_block_bytes,
        "starting kiln-node"
    );

    // --- Persistent storage ---
    let db_path = config.node.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = KilnDB::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Chain ---
    let runner = Arc::new(ChainRunner::open(&config, db, Arc::clone(&node_metrics))?);
    tracing::info!(
        height = runner.context().best_height(),
        pooled = runner.context().mempool.record_len(),
        "chain ready"
    );

    // --- Packaging loop ---
    let (stop_tx, stop_rx) = watch::channel(false);
    let packaging_loop =
        spawn_packaging_loop(Arc::clone(&runner), config.node.block_interval_ms, stop_rx);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", config.node.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!(error = %e, "metrics server error");
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    // Let an in-flight round finish before storage is flushed.
    let _ = stop_tx.send(true);
    if let Err(e) = packaging_loop.await {
        tracing::error!(error = %e, "packaging loop ended abnormally");
    }
    runner.shutdown()?;
    tracing::info!("kiln-node stopped");
    Ok(())
}

/// Run one packaging round per tick until `stop` flips. A round already
/// running when `stop` flips is completed before the task returns.
fn spawn_packaging_loop(
    runner: Arc<ChainRunner>,
    interval_ms: u64,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => break,
            }
            let round_runner = Arc::clone(&runner);
            match tokio::task::spawn_blocking(move || round_runner.package_round()).await {
                Ok(Ok(Some(header))) => {
                    tracing::debug!(height = header.height, hash = %header.hash_hex(), "round committed");
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "packaging round failed to commit"),
                Err(e) => tracing::error!(error = %e, "packaging task panicked"),
            }
        }
        tracing::debug!("packaging loop stopped");
    })
}

/// Create the data directory and write a default `config.toml` into it.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("kiln_node=info", logging::LogFormat::Pretty);

    let config_path = write_default_config(&args.data_dir, args.force)?;
    tracing::info!(config = %config_path.display(), "node initialized");
    println!("Node initialized.");
    println!("  Data directory : {}", args.data_dir.display());
    println!("  Config         : {}", config_path.display());
    Ok(())
}

fn write_default_config(data_dir: &Path, force: bool) -> Result<PathBuf> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let config_path = data_dir.join("config.toml");
    if config_path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }
    let rendered = DEFAULT_CONFIG_TEMPLATE.replace(
        "data_dir = \"./kiln-data\"",
        &format!("data_dir = {:?}", data_dir.display().to_string()),
    );
    std::fs::write(&config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(config_path)
}

fn print_version() {
    println!("kiln-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc     {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
