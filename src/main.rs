//! mixproxy - Mixed-Protocol Forward Proxy
//!
//! This is the main entry point for the mixproxy binary.

use anyhow::Result;
use clap::Parser;
use mixproxy::config::load_config;
use mixproxy::Proxy;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Mixed SOCKS5 / SOCKS4 / HTTP forward proxy on a single port
#[derive(Parser, Debug)]
#[command(name = "mixproxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// TCP endpoint to listen on (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

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

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => Default::default(),
    };

    let log_level = config
        .proxy
        .log_level
        .clone()
        .unwrap_or_else(|| args.log_level.clone());
    setup_logging(&log_level, args.json_log || config.proxy.json_log)?;

    let bind = args.bind.unwrap_or_else(|| config.proxy.bind.clone());

    info!("mixproxy v{}", mixproxy::VERSION);
    info!("Listening on {}", bind);

    let cancel = CancellationToken::new();

    // Handle Ctrl+C and termination signals (cross-platform)
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::error!("Failed to setup SIGTERM handler: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        shutdown.cancel();
    });

    Proxy::builder()
        .bind_address(bind)
        .allow_udp(config.proxy.allow_udp)
        .request_timeout(Duration::from_secs(config.proxy.request_timeout))
        .cancel_token(cancel)
        .build()
        .listen_and_serve()
        .await
}

/// Setup logging based on configuration
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
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
