//! Scorekeeper
//!
//! Loads the exercise configuration, restores state from the local database
//! and runs the scoring loop until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use scorekeeper::{
    load_injects_file, EngineConfig, LocalStorage, ScoreStorage, ScoringEngine, ServiceChecker,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "scorekeeper")]
#[command(about = "Round-based scoring engine for cyber-defense exercises")]
struct Args {
    /// Exercise configuration (TOML)
    #[arg(short, long, default_value = "scorekeeper.toml", env = "SCOREKEEPER_CONFIG")]
    config: PathBuf,

    /// SQLite database path
    #[arg(short, long, default_value = "data/scorekeeper.db", env = "SCOREKEEPER_DATABASE")]
    database: PathBuf,

    /// Injects file (TOML), optional
    #[arg(short, long, default_value = "injects.toml", env = "SCOREKEEPER_INJECTS")]
    injects: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scorekeeper=debug".parse().unwrap())
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Starting scorekeeper");
    info!("  Config: {}", args.config.display());
    info!("  Database: {}", args.database.display());

    let config = EngineConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let zone = config.inject_timezone()?;
    let check_timeout = Duration::from_secs(config.check_timeout);

    let storage: Arc<dyn ScoreStorage> = Arc::new(
        LocalStorage::open(&args.database)
            .with_context(|| format!("failed to open {}", args.database.display()))?,
    );
    let engine = ScoringEngine::bootstrap(config, storage).context("bootstrap failed")?;

    let injects = load_injects_file(&args.injects, zone)?;
    engine.seed_injects(injects)?;

    let checker = Arc::new(ServiceChecker::new(check_timeout)?);
    let scheduler = engine.spawn_scheduler(checker);

    info!("Scorekeeper ready at round {}", engine.current_round());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested, finishing current round");

    scheduler.shutdown();
    if let Err(e) = scheduler.task_handle.await {
        error!("Scheduler task ended abnormally: {}", e);
    }

    info!("Scorekeeper stopped at round {}", engine.current_round());
    Ok(())
}
