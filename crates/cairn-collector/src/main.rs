//! Cairn collector binary.
//!
//! # Usage
//!
//! ```bash
//! # Observe the devices listed in collector.json, events to stdout
//! cairn-collector --config collector.json
//!
//! # Fixed source port and a JSON-lines file sink
//! cairn-collector --config collector.json --bind 0.0.0.0:5682 --sink readings.jsonl
//! ```

use std::{net::SocketAddr, path::PathBuf};

use cairn_collector::{
    Collector, CollectorConfig, JsonLinesSink, SystemEnv, UdpTransport, run_sink,
};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Capacity of the collector-to-sink event channel.
const EVENT_CHANNEL: usize = 256;

/// CoAP telemetry collector
#[derive(Parser, Debug)]
#[command(name = "cairn-collector")]
#[command(about = "CoAP telemetry collector")]
#[command(version)]
struct Args {
    /// Path to the device configuration file (JSON)
    #[arg(short, long, default_value = "collector.json")]
    config: PathBuf,

    /// Address to bind the shared UDP socket to
    #[arg(short, long, default_value = "0.0.0.0:5682")]
    bind: SocketAddr,

    /// Write events to this JSON-lines file instead of stdout
    #[arg(short, long)]
    sink: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer().with_writer(std::io::stderr)).with(filter).init();

    let config = CollectorConfig::load(&args.config)?;
    tracing::info!(devices = config.devices.len(), "cairn collector starting");

    let transport = UdpTransport::bind(args.bind).await?;

    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL);
    let sink = match &args.sink {
        Some(path) => JsonLinesSink::file(path)?,
        None => JsonLinesSink::stdout(),
    };
    let sink_task = tokio::spawn(run_sink(events_rx, sink));

    let collector = Collector::new(SystemEnv::new(), transport, config, events_tx);
    let result = collector.run().await;

    // Device tasks are gone once run() returns; let the sink drain.
    sink_task.await?;

    result.map_err(Into::into)
}
