use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use alertd::collector;
use alertd::config::Config;
use alertd::scheduler::Scheduler;
use alertd::Engine;

#[derive(Parser, Debug)]
#[command(name = "alertd", about = "Metric ingestion and alerting engine")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/alertd/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("alertd {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    // Initialize logging
    init_logging(&config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.engine.hostname,
        "Starting alertd"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Engine terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(&config.engine.log_level)
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let engine = Engine::from_config(&config).await?;
    engine.bootstrap(&config)?;

    let collectors = collector::create_collectors(&config, &engine.storage)?;
    let scheduler = Scheduler::new(&engine, collectors, config.scheduler.clone());

    let token = CancellationToken::new();
    let handles = scheduler.spawn(token.clone());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, stopping scheduler");

    token.cancel();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Scheduler task ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
