// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! glad-load - Bulk load a binary GLAD capture.
//!
//! Usage:
//!   glad-load --input pass.glad                      # stream to localhost:8900
//!   glad-load --input pass.glad --host ops2 --port 8901
//!   glad-load --input pass.glad --direct             # decode locally, print JSON lines

use anyhow::Context;
use clap::Parser;
use glad_ingest::{DirectLoader, GladFrameCodec, IngestConfig, MemorySink, SocketLoader};
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "glad-load")]
#[command(about = "Bulk load a binary GLAD capture")]
#[command(version)]
struct Args {
    /// Capture file to load
    #[arg(short, long)]
    input: PathBuf,

    /// Decode locally instead of sending to a server
    #[arg(long)]
    direct: bool,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "8900")]
    port: u16,

    /// Connection retries (default from config: 10)
    #[arg(long)]
    retries: Option<u32>,

    /// Delay between retries in milliseconds (default from config: 2000)
    #[arg(long)]
    retry_delay_ms: Option<u64>,

    /// Configuration file supplying loader defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Direct mode: print decoded records as JSON lines
    #[arg(long)]
    print: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {}:{}", host, port))?
        .next()
        .with_context(|| format!("no address for {}:{}", host, port))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => IngestConfig::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => IngestConfig::default(),
    };

    let summary = if args.direct {
        let sink = Arc::new(MemorySink::new(config.sink_capacity));
        let loader = DirectLoader::new(Arc::new(GladFrameCodec::new()), sink.clone());
        let summary = loader
            .load_file(&args.input)
            .with_context(|| format!("loading {}", args.input.display()))?;

        if args.print {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for record in sink.drain() {
                writeln!(out, "{}", serde_json::to_string(&record)?)?;
            }
        }
        summary
    } else {
        let addr = resolve(&args.host, args.port)?;
        let mut loader = SocketLoader::from_config(addr, &config);
        if let Some(retries) = args.retries {
            loader = loader.retries(retries);
        }
        if let Some(ms) = args.retry_delay_ms {
            loader = loader.retry_delay(Duration::from_millis(ms));
        }
        loader
            .load_file(&args.input)
            .with_context(|| format!("sending {} to {}", args.input.display(), addr))?
    };

    info!(
        "Loaded {} bytes ({} records, {} decode errors) in {} ms",
        summary.bytes, summary.records, summary.decode_errors, summary.elapsed_ms
    );
    Ok(())
}
