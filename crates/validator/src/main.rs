//! BFT devnet node
//!
//! Runs a local network of validators in one process. Blocks, state and
//! WALs are kept under the data directory, so a restart picks up where the
//! previous run stopped.

use anyhow::Result;
use bft_consensus::types::block::short_hex;
use bft_consensus::ConsensusEvent;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;
mod devnet;

use config::NodeConfig;

/// BFT consensus devnet
#[derive(Parser, Debug)]
#[command(name = "bft-node")]
#[command(about = "Local devnet of round-based BFT validators", long_about = None)]
struct Args {
    /// JSON node configuration
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of validators (overrides the config file)
    #[arg(long)]
    validators: Option<usize>,

    /// Data directory for blocks, state and WALs
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Stop after committing this height (0 = run until Ctrl+C)
    #[arg(long, default_value = "0")]
    heights: i64,

    /// Only log our own messages in the WAL
    #[arg(long)]
    wal_light: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(n) = args.validators {
        anyhow::ensure!(n > 0, "--validators must be at least 1");
        config.validators = n;
    }
    if args.wal_light {
        config.consensus.wal_light = true;
    }

    tracing::info!("Starting BFT devnet");
    tracing::info!("  Chain: {}", config.consensus.chain_id);
    tracing::info!("  Validators: {}", config.validators);
    tracing::info!("  Data directory: {:?}", args.data_dir);

    let nodes = devnet::launch(&config, &args.data_dir)?;
    let mut events = nodes[0].consensus_state().subscribe();

    // every node sees every tx, as if the mempools gossiped
    let mempools: Vec<_> = nodes.iter().map(|n| n.mempool.clone()).collect();
    let tx_interval = config.tx_interval_ms;
    let tx_generator = tokio::spawn(async move {
        if tx_interval == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_millis(tx_interval));
        let mut n = 0u64;
        loop {
            ticker.tick().await;
            let tx = format!("key{}=value{}", n, n).into_bytes();
            for mempool in &mempools {
                mempool.add_tx(tx.clone());
            }
            n += 1;
        }
    });

    tracing::info!("Devnet running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ConsensusEvent::NewBlock(block)) => {
                    tracing::info!(
                        "Committed block {} ({}) with {} txs, proposer {}",
                        block.height(),
                        short_hex(&block.hash()),
                        block.txs.len(),
                        short_hex(&block.header.proposer_address)
                    );
                    if args.heights > 0 && block.height() >= args.heights {
                        tracing::info!("Reached height {}", args.heights);
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Skipped {} consensus events", n),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
        }
    }

    tx_generator.abort();
    for node in nodes {
        node.stop();
    }
    tracing::info!("Devnet stopped");

    Ok(())
}
