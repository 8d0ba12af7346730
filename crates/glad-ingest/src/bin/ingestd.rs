// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! glad-ingestd - Global LAD ingest daemon.
//!
//! Usage:
//!   glad-ingestd
//!   glad-ingestd --port 8901 --max-clients 32
//!   glad-ingestd --config ingest.json --data-source both --bus-topic mpcs.eha
//!   glad-ingestd --print-config > ingest.json

use anyhow::Context;
use clap::Parser;
use glad_ingest::{DataSource, GlobalLadIngest, IngestConfig, LocalBus, MemorySink, WaitStrategy};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "glad-ingestd")]
#[command(about = "Ingest spacecraft telemetry into the Global LAD")]
#[command(version)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP port for the socket feed (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Feeds to run: socket, bus or both (overrides config)
    #[arg(long)]
    data_source: Option<DataSource>,

    /// Bus topic to subscribe to (repeatable, overrides config)
    #[arg(long = "bus-topic")]
    bus_topics: Vec<String>,

    /// Wait strategy for client and bus rings: block, sleep, yield, spin
    #[arg(long)]
    wait_strategy: Option<WaitStrategy>,

    /// Maximum concurrent socket clients
    #[arg(long)]
    max_clients: Option<usize>,

    /// Side store for closed-client summaries (JSON lines)
    #[arg(long)]
    closed_log: Option<PathBuf>,

    /// Metrics report interval in seconds (0 = off)
    #[arg(long)]
    report_interval: Option<u64>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> anyhow::Result<IngestConfig> {
    let mut config = match &args.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => IngestConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind_address = bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", bind))?;
    }
    if let Some(source) = args.data_source {
        config.data_source = source;
    }
    if !args.bus_topics.is_empty() {
        config.bus_topics = args.bus_topics.clone();
    }
    if let Some(wait) = args.wait_strategy {
        config.client_wait_strategy = wait;
        config.bus_wait_strategy = wait;
    }
    if args.max_clients.is_some() {
        config.max_clients = args.max_clients;
    }
    if let Some(path) = &args.closed_log {
        config.closed_clients_path = Some(path.clone());
    }
    if let Some(secs) = args.report_interval {
        config.metrics_report_interval_secs = secs;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    info!("Global LAD ingest v{}", env!("CARGO_PKG_VERSION"));
    info!("Data source: {:?}", config.data_source);

    let sink = Arc::new(MemorySink::new(config.sink_capacity));
    let mut builder = GlobalLadIngest::builder(config.clone()).sink(sink.clone());
    if config.data_source.uses_bus() {
        // Broker clients plug in through MessageBus; standalone runs use the
        // in-process bus.
        warn!("No broker client configured; bus feed uses the in-process bus");
        builder = builder.bus(Arc::new(LocalBus::new()));
    }
    let ingest = builder.start().context("starting ingest")?;

    if let Some(addr) = ingest.local_addr() {
        info!("Socket feed listening on {}", addr);
    }
    info!("Press Ctrl+C to stop.");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut last_report = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));

        if last_report.elapsed() >= Duration::from_secs(30) {
            let stats = ingest.stats();
            let open = stats.socket.as_ref().map(|s| s.open_client_count).unwrap_or(0);
            info!(
                "Clients: {} open | records: socket {} bus {} | LAD entries: {}",
                open,
                stats.metrics.socket.processed.records,
                stats.metrics.bus.processed.records,
                sink.len()
            );
            last_report = Instant::now();
        }
    }

    info!("Shutting down...");
    ingest.close();
    println!("{}", serde_json::to_string_pretty(&ingest.stats_json())?);
    Ok(())
}
