//! Netgauge - Network Measurement Client
//!
//! Runs one latency, download and upload measurement against a netgauge
//! server and prints the result.

use anyhow::{Context, Result};
use clap::Parser;
use netgauge::config::Config;
use netgauge::output::{self, OutputManager, ReportFormat};
use netgauge::session::{ProgressEvent, Session};
use netgauge::transport::{Transport, WsTransport};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "netgauge")]
#[command(author = "Florian Schüller <schuellerf@gmail.com>")]
#[command(version = "0.1.0")]
#[command(about = "Latency, jitter and throughput measurement", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "client.conf")]
    config: PathBuf,

    /// Server URL, overrides the configuration file
    #[arg(short, long)]
    server: Option<String>,

    /// Write the report to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Report file format
    #[arg(short, long, value_enum)]
    format: Option<ReportFormat>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.into())
        )
        .init();

    info!("Netgauge v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        let config = Config::load(&args.config)?;
        info!("Loaded configuration from {:?}", args.config);
        config
    } else {
        warn!("No configuration at {:?}, using defaults", args.config);
        Config::default()
    };
    if let Some(server) = args.server {
        config.general.server_url = server;
    }
    if let Some(path) = &args.output {
        config.output.report_path = Some(path.display().to_string());
    }
    if let Some(format) = args.format {
        config.output.format = format;
    }

    run_measurement(&config).await
}

async fn run_measurement(config: &Config) -> Result<()> {
    let mut conn = WsTransport::connect(
        &config.general.server_url,
        config.general.send_queue_depth,
        Duration::from_millis(config.general.connect_timeout_ms),
    )
    .await
    .with_context(|| format!("Failed to reach server {}", config.general.server_url))?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    let session = Session::new(config.session_config()).with_observer(events_tx);

    let console = OutputManager::new(config.output.use_colors);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            console.update(&event);
        }
    });

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling measurement");
            cancel.cancel();
        }
    });

    info!("Measuring against {} (Press Ctrl+C to stop)", config.general.server_url);
    let result = session.start(&mut conn).await;
    conn.close();

    // Closing the observer channel ends the printer
    drop(session);
    let _ = printer.await;

    let report = result.context("Measurement failed")?;

    let summary = OutputManager::new(config.output.use_colors);
    summary.print_summary(&report);

    if let Some(path) = &config.output.report_path {
        let path = PathBuf::from(path);
        output::export_report(&report, &path, config.output.format)?;
        info!("Report written to {:?}", path);
    }

    Ok(())
}
