//! devproxy - Main entry point
//!
//! A development HTTP/HTTPS forwarding proxy

use anyhow::{Context, Result};
use clap::Parser;
use devproxy::{CertificateManager, JsonFileStore, LogLevel, LogLevelHook, ProxyServer, ServerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter};

/// devproxy - A development HTTP/HTTPS forwarding proxy
#[derive(Parser, Debug)]
#[command(name = "devproxy")]
#[command(author = "devproxy Contributors")]
#[command(version)]
#[command(about = "A development HTTP/HTTPS forwarding proxy")]
struct Args {
    /// Config document, created on first save
    #[arg(long, env = "CONFIG_PATH", default_value = "./config.json")]
    config: PathBuf,

    /// Port to listen on, overrides the config document
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Log level, overrides the config document
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Where the self-signed certificate is kept
    #[arg(long, env = "CERTS_DIR", default_value = "./.certs")]
    certs_dir: PathBuf,
}

/// Install the subscriber and return a hook that swaps its level
fn init_logging(level: LogLevel) -> LogLevelHook {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(level.as_directive()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false).compact())
        .init();

    Arc::new(move |level: LogLevel| {
        if let Err(e) = handle.reload(EnvFilter::new(level.as_directive())) {
            warn!("Failed to change log level: {}", e);
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let store = Arc::new(JsonFileStore::new(&args.config));
    let mut config = store.load().context("failed to load config")?;

    // Command line overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let log_hook = init_logging(config.log_level);

    info!("Starting devproxy v{}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", store.path().display());

    let certificates = CertificateManager::new(&args.certs_dir)?;
    info!("Certificate directory: {}", args.certs_dir.display());

    let options = ServerOptions {
        store: Some(store),
        certificates: Some(certificates),
        log_hook: Some(log_hook),
    };

    let server = ProxyServer::start(config, options)
        .await
        .context("failed to start proxy")?;

    if let Some(addr) = server.local_addr() {
        let scheme = if server.is_tls() { "https" } else { "http" };
        info!("devproxy listening on {}://{}", scheme, addr);
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.stop().await;

    Ok(())
}
