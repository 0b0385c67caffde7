//! Hermes - coordination core for multi-agent systems
//!
//! Runs the broker, review orchestrator and pending operation queue as one
//! supervised process.

use clap::{Parser, Subcommand};
use hermes_core::{
    error::Result, runtime::registry::ServiceRegistry, CoordinationEngine, HermesConfig, Store,
};
use std::path::PathBuf;
use tracing::{debug, info, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "hermes")]
#[command(about = "Actor-based coordination core for multi-agent systems", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Configuration file (defaults to $XDG_DATA_HOME/hermes/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides the config file and HERMES_DB_PATH)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the coordination engine until interrupted
    Serve,

    /// Expire overdue queued operations and prune messages past retention, then exit
    Sweep,
}

fn load_config(cli: &Cli) -> Result<HermesConfig> {
    let path = cli.config.clone().unwrap_or_else(HermesConfig::default_path);
    let mut config = HermesConfig::load(&path)?;
    config.apply_env();
    if let Some(db_path) = &cli.db_path {
        config.storage.path = db_path.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn start_engine(config: HermesConfig) -> Result<CoordinationEngine> {
    let store = Store::open(&config.storage).await?;
    CoordinationEngine::start(config, store, ServiceRegistry::global()).await
}

async fn serve(config: HermesConfig) -> Result<()> {
    let engine = start_engine(config).await?;
    info!(
        "Hermes serving from {} (Ctrl-C to stop)",
        engine.store().path().display()
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping gracefully...");

    engine.stop().await?;
    info!("Hermes shut down complete");
    Ok(())
}

async fn sweep(config: HermesConfig) -> Result<()> {
    let engine = start_engine(config).await?;
    let report = engine.sweep().await;
    engine.stop().await?;

    let report = report?;
    println!(
        "Expired {} queued operations, pruned {} messages",
        report.expired_operations, report.pruned_messages
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::new(format!(
        "hermes={},hermes_core={},ractor=warn",
        level.as_str().to_lowercase(),
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Write logs to stderr, not stdout
        .init();

    debug!("Hermes v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Sweep => sweep(config).await,
    }
}
