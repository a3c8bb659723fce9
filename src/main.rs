//! Socksroute - SOCKS5 endpoint with a routing dialer
//!
//! This is the main entry point for the Socksroute application.

use anyhow::{Context, Result};
use clap::Parser;
use socksroute::config::load_config;
use socksroute::dialer::{DirectDialer, RoutingDialer};
use socksroute::netstack::{NicId, PacketLink, SmolStack};
use socksroute::socks::Socks5Server;
use socksroute::transport::SocketOpts;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Socksroute - SOCKS5 endpoint routing literal IPv4 traffic through a userspace stack
#[derive(Parser, Debug)]
#[command(name = "socksroute")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    let config = load_config(&args.config)?;

    info!("Socksroute v{}", socksroute::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!(
        "Virtual stack: {}/{} on nic{}",
        config.stack.self_ip, config.stack.prefix_len, config.stack.nic_id
    );

    let link = PacketLink::udp(&config.stack.link).await?;
    let stack = SmolStack::start(&config.stack, link).context("Failed to start virtual stack")?;

    let direct = DirectDialer::new(SocketOpts::from_direct_config(&config.direct));
    let dialer = RoutingDialer::new(
        Arc::new(stack),
        config.stack.self_ip,
        NicId(config.stack.nic_id),
        direct,
    );

    let server = Socks5Server::new(config.socks.clone(), Arc::new(dialer));
    let shutdown = server.shutdown_token();

    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    if let Err(e) = server.listen_and_serve(&config.socks.listen_addr).await {
        error!("{}", e);
        return Err(e.into());
    }

    info!("Socksroute stopped");
    Ok(())
}

/// Wait for Ctrl+C, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
            }
            Err(e) => {
                error!("Failed to setup SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// Setup logging based on command line flags
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
