//! wslat binary
//!
//! Measures how quickly market-data updates reach this host under one
//! connection strategy. Loads configuration, applies command-line
//! overrides, runs the harness for the measurement window, and writes one
//! gzipped JSONL series per logical connection.
//!
//! Usage:
//!   wslat -f BTCUSDT -n 4 -t 60 -m MWST

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use wslat_core::config::AppConfig;
use wslat_core::types::StrategyKind;
use wslat_harness::{export, Harness, TracingObserver};

/// WebSocket market-data latency harness
#[derive(Parser, Debug)]
#[command(name = "wslat", about = "Measure market-data delivery delay per connection strategy")]
struct Args {
    /// Instrument ticker to subscribe to (e.g., BTCUSDT).
    #[arg(short = 'f', long = "future")]
    future: String,

    /// Number of logical connections.
    #[arg(short = 'n', long = "connections")]
    connections: Option<usize>,

    /// Measurement window in seconds.
    #[arg(short = 't', long = "timeout")]
    timeout: Option<u64>,

    /// Strategy: MWMT / thread-per-socket, MWST / task-per-socket,
    /// SWST / shared-socket.
    #[arg(short = 'm', long = "method")]
    method: Option<StrategyKind>,

    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory, overrides `output.data_dir`.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = AppConfig::load(args.config)?;

    config.feed.ticker = args.future;
    if let Some(n) = args.connections {
        config.run.connections = n;
    }
    if let Some(secs) = args.timeout {
        config.run.duration_secs = secs;
    }
    if let Some(kind) = args.method {
        config.run.strategy = kind;
    }
    if let Some(dir) = args.output {
        config.output.data_dir = dir;
    }
    config.validate()?;

    wslat_core::logging::init_tracing(&config.logging)?;

    tracing::info!(
        strategy = %config.run.strategy,
        label = config.run.strategy.label(),
        stream = %config.feed.stream_name(),
        connections = config.run.connections,
        duration_secs = config.run.duration_secs,
        url = %config.feed.ws_url,
        "starting wslat"
    );

    let harness = Harness::from_config(&config, Arc::new(TracingObserver))?;
    let result = harness.run()?;
    let paths = export::write_run(&result, &config.output.data_dir)?;

    tracing::info!(
        files = paths.len(),
        dir = %export::run_dir(&config.output.data_dir, &result).display(),
        "results written"
    );
    Ok(())
}
