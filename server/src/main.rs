//! Netgauge Server - WebSocket measurement peer
//!
//! Answers latency probes, streams download chunks and counts upload chunks
//! for netgauge clients.

mod config;
mod handlers;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use futures::SinkExt;
use handlers::ServerContext;
use protocol::{ControlMessage, error_codes};
use session::ConnectionRegistry;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author = "Florian Schüller <schuellerf@gmail.com>")]
#[command(version)]
#[command(about = "Netgauge server - network measurement peer", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "server.conf")]
    config: String,

    /// Listen port, overrides the configuration file
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting Netgauge server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if Path::new(&args.config).exists() {
        let config = config::Config::load(&args.config)
            .context("Failed to load configuration")?;
        info!("Loaded configuration from: {}", args.config);
        config
    } else {
        warn!("No configuration at {}, using defaults", args.config);
        config::Config::default()
    };
    if let Some(port) = args.port {
        config.general.bind_port = port;
    }

    let registry = Arc::new(ConnectionRegistry::new(config.general.max_concurrent_clients));
    let ctx = Arc::new(ServerContext::new(
        config.limits.clone(),
        config.logging.log_echo_requests,
        registry.clone(),
    ));

    // Bind TCP listener
    let bind_addr = format!("{}:{}", config.general.bind_address, config.general.bind_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .context(format!("Failed to bind to {}", bind_addr))?;

    info!("Server listening on ws://{}", bind_addr);
    info!("Max concurrent clients: {}", config.general.max_concurrent_clients);
    info!(
        "Limits: chunk {} bytes, duration {} ms",
        config.limits.max_chunk_size, config.limits.max_duration_ms
    );

    // Spawn status task
    let status_registry = registry.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let active = status_registry.active_connections().await;
            if active > 0 {
                debug!("Active connections: {}", active);
            }
        }
    });

    // Main accept loop
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, client_addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        handle_client(stream, client_addr, ctx).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Upgrade a TCP connection and serve it, or turn it away when full
async fn handle_client(stream: TcpStream, client_addr: SocketAddr, ctx: Arc<ServerContext>) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed from {}: {}", client_addr, e);
            return;
        }
    };

    match ctx.registry.register(client_addr).await {
        Ok(connection_id) => {
            info!("Connection {} from {}", connection_id, client_addr);
            handlers::serve_connection(ws, connection_id, ctx).await;
        }
        Err(e) => {
            warn!("Rejecting {}: {}", client_addr, e);
            let notice = ControlMessage::error(error_codes::UNAVAILABLE, e.to_string());
            if let Ok(json) = notice.to_json() {
                let _ = ws.send(Message::Text(json)).await;
            }
            let _ = ws.close(None).await;
        }
    }
}
