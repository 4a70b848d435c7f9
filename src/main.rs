use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use regional_recs::api::{self, AppState};
use regional_recs::data::{BatchStatus, BatchType};
use regional_recs::scheduler::Scheduler;
use regional_recs::{BatchOrchestrator, Config, ModelRegistry, RecommendationStore, SqliteStore};

#[derive(Parser)]
#[command(name = "regional-recs")]
#[command(about = "Regional ALS recommendation service: batch pipeline and read API")]
struct Args {
    /// Host to bind the server to (overrides HOST)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind the server to (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve precomputed recommendations over HTTP
    Serve,
    /// Run a single batch and exit
    Batch {
        /// full or incremental
        #[arg(short, long, default_value = "full")]
        mode: String,

        /// Restrict the run to one configured region
        #[arg(short, long)]
        region: Option<String>,
    },
    /// Run batches on the configured schedule until interrupted
    Scheduler,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);

    info!("Starting {}", config.service_name);
    info!("Regions: {:?}", config.regions);
    info!("Model directory: {:?}", config.model_dir);

    let store: Arc<dyn RecommendationStore> = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .context("Failed to open recommendation store")?,
    );
    let models = Arc::new(ModelRegistry::new(&config.model_dir));

    match args.command {
        Command::Serve => serve(store, models, config).await,
        Command::Batch { mode, region } => {
            let mode: BatchType = mode.parse().context("Invalid batch mode")?;
            let orchestrator = BatchOrchestrator::new(store, models, config);
            let log = orchestrator.run_batch(mode, region.as_deref()).await?;
            info!(
                "Batch {} {}: {} users, {} recommendations",
                log.batch_id,
                log.status.as_str(),
                log.processed_users,
                log.total_recommendations
            );
            if log.status == BatchStatus::Failed {
                bail!(
                    "Batch {} failed: {}",
                    log.batch_id,
                    log.error_message.unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Scheduler => {
            let batch_config = config.batch.clone();
            let orchestrator = Arc::new(BatchOrchestrator::new(Arc::clone(&store), models, config));
            Scheduler::new(orchestrator, store, batch_config)
                .run(shutdown_signal())
                .await;
            Ok(())
        }
    }
}

async fn serve(
    store: Arc<dyn RecommendationStore>,
    models: Arc<ModelRegistry>,
    config: Arc<Config>,
) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port)
        .parse::<SocketAddr>()
        .context("Invalid address")?;
    let app = api::router(AppState::new(store, models, config));

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
