//! BFT consensus simulator
//!
//! Runs a set of in-process validators through consecutive heights and logs
//! every decided block. Useful for watching the protocol under different
//! timeouts and with some validators offline.

use anyhow::Result;
use bft_consensus::ConsensusConfig;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod network;

use network::Network;

/// In-process BFT consensus network
#[derive(Parser, Debug)]
#[command(name = "bft-sim")]
#[command(about = "Run Tendermint-style consensus between in-process validators", long_about = None)]
struct Args {
    /// Number of validators
    #[arg(long, default_value = "4")]
    validators: usize,

    /// Validators that never come online
    #[arg(long, default_value = "0")]
    offline: usize,

    /// Heights to decide before exiting
    #[arg(long, default_value = "5")]
    heights: u64,

    /// Transactions submitted before each height
    #[arg(long, default_value = "8")]
    txs_per_height: usize,

    /// Give up on a height after this many seconds
    #[arg(long, default_value = "60")]
    height_timeout_secs: u64,

    /// Consensus config file (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => ConsensusConfig::from_json_file(path)?,
        None => ConsensusConfig::default(),
    };

    tracing::info!("Starting BFT simulator");
    tracing::info!("  Validators: {} ({} offline)", args.validators, args.offline);
    tracing::info!("  Heights: {}", args.heights);
    tracing::info!(
        "  Propose timeout: {}ms + {}ms/round",
        config.propose_timeout_base_ms,
        config.propose_timeout_delta_ms
    );

    let network = Network::new(args.validators, args.offline, config)?;
    let timeout = Duration::from_secs(args.height_timeout_secs);

    tokio::select! {
        result = run(&network, &args, timeout) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    tracing::info!(
        "Simulator stopped at height {} ({} evidence records)",
        network.tip_height(),
        network.evidence_count()
    );
    Ok(())
}

async fn run(network: &Network, args: &Args, timeout: Duration) -> Result<()> {
    for _ in 0..args.heights {
        let height = network.tip_height() + 1;
        for i in 0..args.txs_per_height {
            let tx = format!("tx-{}-{}-{}", height, i, chrono::Utc::now().timestamp_millis());
            network.submit(tx.into_bytes())?;
        }

        let report = network.run_height(timeout).await?;
        tracing::info!(
            "Height {} decided: block {} in round {} with {} txs ({:?})",
            report.height,
            report.block.hash(),
            report.round,
            report.block.transactions.len(),
            report.elapsed
        );
    }
    Ok(())
}
