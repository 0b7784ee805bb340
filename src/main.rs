// src/main.rs

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tether::backend::{ApiBackend, FsProbe};
use tether::config::Config;
use tether::events::EventBus;
use tether::queue::QueueManager;
use tether::session::pool::{PoolConfig, SessionPool};
use tether::store::SqliteRepository;

#[derive(Parser)]
#[command(name = "tether", about = "Session orchestration for AI chat backends")]
struct Cli {
    /// Config file path (defaults to the platform config dir)
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    info!("Starting Tether");
    info!("Database: {}", config.database_url);
    info!("Default model: {}", config.default_model);
    if config.api_key.is_none() {
        info!("No API key configured; api-backed turns will be rejected upstream");
    }

    let repo = Arc::new(SqliteRepository::connect(&config.database_url).await?);
    let events = EventBus::new();
    let backend = Arc::new(ApiBackend::new(
        config.api_url.clone(),
        config.api_key.clone().unwrap_or_default(),
        config.default_model.clone(),
    ));

    let pool = Arc::new(SessionPool::new(
        repo.clone(),
        backend,
        events.clone(),
        PoolConfig {
            capacity: config.pool_capacity,
            max_turns: config.max_turns,
            project_roots: config.project_roots.clone(),
        },
    ));

    let queue = QueueManager::new(
        pool,
        repo,
        events,
        Arc::new(FsProbe),
        None,
        config.terminal_models.clone(),
    );
    queue.attach().await;

    // Recover chats a crash left persisted as "scheduled".
    for record in queue_recovery_candidates(&queue).await {
        queue.on_resource_discovered(&record).await;
    }

    info!("Ready; waiting for shutdown signal");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    queue.shutdown().await;
    Ok(())
}

async fn queue_recovery_candidates(queue: &Arc<QueueManager>) -> Vec<String> {
    match queue.scheduled_paths().await {
        Ok(paths) => paths,
        Err(e) => {
            tracing::warn!(error = %e, "Startup recovery scan failed");
            Vec::new()
        }
    }
}
