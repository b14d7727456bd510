//! Glyphcast Server - standalone headless conferencing hub.
//!
//! Hosts the hub without any terminal rendering of its own: clients connect
//! over TCP, and each receives a personalized ASCII composite of the other
//! participants plus a mixed Opus stream.

mod config;

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use glyphcast_core::{Hub, LoggingHubEvents};

use crate::config::ServerConfig;

/// Glyphcast Server - headless terminal video conferencing hub.
#[derive(Parser, Debug)]
#[command(name = "glyphcast-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "GLYPHCAST_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "GLYPHCAST_PORT")]
    port: Option<u16>,

    /// Session password (overrides config file).
    #[arg(long, env = "GLYPHCAST_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Identity key path (overrides config file).
    #[arg(short = 'i', long, env = "GLYPHCAST_IDENTITY_KEY")]
    identity_key: Option<PathBuf>,

    /// Disable encryption (requires --allow-plaintext as well).
    #[arg(long)]
    no_encryption: bool,

    /// Explicit opt-in for running without encryption.
    #[arg(long)]
    allow_plaintext: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Glyphcast Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(password) = args.password {
        config.password = Some(password);
    }
    if let Some(identity_key) = args.identity_key {
        config.identity_key = Some(identity_key);
    }
    if args.no_encryption {
        config.encryption = false;
    }
    if args.allow_plaintext {
        config.allow_plaintext = true;
    }

    log::info!(
        "Configuration: port={}, max_clients={}, encryption={}, password={}, identity={}",
        config.port,
        config.max_clients,
        config.encryption,
        if config.password.is_some() { "set" } else { "none" },
        config
            .identity_key
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".into()),
    );

    let host_config = config.to_host_config()?;
    let hub = Hub::new(host_config, Arc::new(LoggingHubEvents))
        .context("Failed to create hub")?;
    hub.start().context("Failed to start hub")?;
    log::info!("Hub started on port {}", config.port);

    wait_for_shutdown()?;
    log::info!("Shutdown signal received, cleaning up...");

    hub.stop();
    log::info!("Shutdown complete");
    Ok(())
}

/// Blocks until Ctrl+C or SIGTERM.
fn wait_for_shutdown() -> Result<()> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to install signal handler")?;
    rx.recv().context("Signal channel closed")?;
    Ok(())
}
