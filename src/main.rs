//! Session Connector
//!
//! Connects to the messaging backend's real-time channel, registers and
//! authenticates the session, and holds it open until interrupted.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use session_connector::config::CONFIG_FILE;
use session_connector::{ConnectorConfig, Environment, SessionConnector, SessionReader};

/// Session Connector
///
/// Real-time session bootstrap for the messaging client
#[derive(Parser, Debug)]
#[command(name = "session-connector")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Deployment environment (overrides the config file)
    #[arg(long, value_enum)]
    env: Option<Environment>,

    /// Backend origin, e.g. https://chat.example.com (overrides the config file)
    #[arg(long)]
    origin: Option<String>,

    /// Credential presented when connecting (overrides the config file)
    #[arg(long)]
    token: Option<String>,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    write_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file and apply command-line overrides
    fn resolve_config(&self) -> anyhow::Result<ConnectorConfig> {
        let mut config = ConnectorConfig::load(&self.config)?;
        if let Some(env) = self.env {
            config.environment = env;
        }
        if self.origin.is_some() {
            config.origin = self.origin.clone();
        }
        if self.token.is_some() {
            config.token = self.token.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Session Connector v{}", env!("CARGO_PKG_VERSION"));

    let config = args.resolve_config()?;
    if args.write_config {
        config.validate()?;
        config.save(&args.config)?;
        info!("Configuration written to {}", args.config.display());
        return Ok(());
    }

    info!("Connecting to {}", config.socket_url()?);

    let connector = SessionConnector::from_config(&config)?;
    info!("Activation {} started", connector.id());

    let reader = connector.reader();
    let watcher = tokio::spawn(report_changes(reader));

    shutdown_signal().await;
    info!("Tearing down session...");
    connector.deactivate().await?;
    watcher.abort();

    info!("Session closed");
    Ok(())
}

/// Log every publish and withdrawal of the connection
async fn report_changes(mut reader: SessionReader) {
    while let Ok(change) = reader.changed().await {
        match change {
            Some(connection) => info!(
                "Session ready: socket {} for user {}",
                connection.socket_id(),
                connection.user()
            ),
            None => warn!("Session connection withdrawn"),
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
