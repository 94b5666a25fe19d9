//! Blocksync - Synchronous Block-Level Replication Daemon
//!
//! `blocksyncd` runs one replicated resource in either the primary or the
//! secondary role.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blocksync::config::BlocksyncConfig;
use blocksync::engine::Engine;
use blocksync::error::{Error, Result};
use blocksync::gateway::SocketGateway;
use blocksync::secondary::{init_resource, Secondary};

/// Exit code for configuration and setup failures
const EX_CONFIG: u8 = 2;
/// Exit code for a fatal runtime failure
const EX_FATAL: u8 = 3;

/// Blocksync - Synchronous Block-Level Replication Daemon
#[derive(Parser)]
#[command(name = "blocksyncd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "blocksync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the resource in the primary role
    Primary,

    /// Run the resource in the secondary role
    Secondary,

    /// Create the persisted state for a fresh resource
    Init {
        /// Initialize for the primary role (also creates the extent map)
        #[arg(long)]
        primary: bool,
    },

    /// Validate the configuration file
    Validate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match BlocksyncConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {:?}: {}", cli.config, e);
            return ExitCode::from(EX_CONFIG);
        }
    };

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .to_string();
    init_logging(&level);

    let result = match cli.command {
        Commands::Primary => run_primary(config).await,
        Commands::Secondary => run_secondary(config).await,
        Commands::Init { primary } => run_init(config, primary).await,
        Commands::Validate => {
            println!("configuration ok: resource {}", config.resource.name);
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            match err {
                Error::Config(_) | Error::ConfigParse(_) | Error::Metadata(_) => {
                    ExitCode::from(EX_CONFIG)
                }
                _ => ExitCode::from(EX_FATAL),
            }
        }
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Signal a shutdown watch on Ctrl-C / SIGTERM
fn shutdown_channel() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("termination signal received");
        let _ = tx.send(true);
    });
    rx
}

/// Run the primary role with the socket gateway
async fn run_primary(config: BlocksyncConfig) -> Result<()> {
    tracing::info!(resource = %config.resource.name, "starting primary");

    let gateway = Arc::new(
        SocketGateway::bind(&config.gateway.listen_address, config.engine.max_io_size).await?,
    );
    let engine = Engine::new(config, gateway).await?;
    engine.run(shutdown_channel()).await
}

/// Run the secondary role
async fn run_secondary(config: BlocksyncConfig) -> Result<()> {
    tracing::info!(resource = %config.resource.name, "starting secondary");

    let secondary = Secondary::new(config).await?;
    secondary.run(shutdown_channel()).await
}

/// Create metadata, backing image and (for the primary) the extent map
async fn run_init(config: BlocksyncConfig, primary: bool) -> Result<()> {
    init_resource(&config, primary).await?;
    tracing::info!(
        resource = %config.resource.name,
        role = if primary { "primary" } else { "secondary" },
        "resource initialized"
    );
    Ok(())
}
