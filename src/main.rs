use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use subwarden::broker::Broker;
use subwarden::config::Config;
use subwarden::database::{JobDatabase, User};
use subwarden::logbus::LogBus;
use subwarden::pipeline::PipelineOptions;
use subwarden::state::AppState;
use subwarden::supervisor::Supervisor;
use subwarden::worker::spawn_workers;
use subwarden::{api, processor};

#[derive(Parser)]
#[command(name = "subwarden", version, about = "Subtitle-acquisition job service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the control plane: HTTP API, WebSocket log streaming and the
    /// embedded worker pool.
    Serve,
    /// Worker script: process one folder (spawned by the supervisor).
    Process {
        #[arg(long)]
        folder: PathBuf,
        #[arg(long, default_value = "ro")]
        language: String,
        #[arg(long, default_value = "info")]
        log_level: String,
        #[arg(long)]
        skip_sync: bool,
        #[arg(long)]
        skip_translation: bool,
    },
    /// Mark orphaned non-terminal jobs as CANCELLED.
    CancelStuck,
}

fn init_tracing(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Process {
            folder,
            language,
            log_level,
            skip_sync,
            skip_translation,
        }) => {
            init_tracing(&log_level);
            let config = Config::load()?;
            let options = PipelineOptions {
                skip_sync,
                skip_translation,
            };
            subwarden::services::translate::init_usage_cache();
            let summary = processor::process_folder(&config, &folder, &language, options).await?;
            subwarden::services::translate::teardown_usage_cache();
            if summary.failed > 0 {
                std::process::exit(1);
            }
        }
        Some(Commands::CancelStuck) => {
            init_tracing("info");
            let config = Config::load()?;
            let database = JobDatabase::new(&config.database_url).await?;
            match database.cancel_stuck_jobs().await {
                Ok(cancelled) if cancelled.is_empty() => info!("✅ No stuck jobs found"),
                Ok(cancelled) => {
                    info!("✅ Cancelled {} stuck jobs: {:?}", cancelled.len(), cancelled)
                }
                Err(e) => {
                    error!("❌ Failed to cancel stuck jobs: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Some(Commands::Serve) | None => {
            init_tracing("info");
            serve().await?;
        }
    }

    Ok(())
}

async fn serve() -> anyhow::Result<()> {
    let mut config = Config::load()?;
    let database = JobDatabase::new(&config.database_url).await?;

    // Fallback chain: database overrides beat environment beats defaults,
    // computed once here.
    let overrides = database.get_setting_overrides().await?;
    config.apply_overrides(&overrides);
    config.validate()?;

    bootstrap_admin(&database).await?;

    let logbus = Arc::new(LogBus::new(config.jobs.log_history_max_items));
    let broker = Arc::new(Broker::new(config.jobs.max_retries));
    let shutdown = CancellationToken::new();

    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        database.clone(),
        logbus.clone(),
    ));
    let worker_handles = spawn_workers(
        config.server.worker_concurrency,
        broker.clone(),
        supervisor,
        shutdown.clone(),
    );

    let bind_addr = config.server.bind_addr.clone();
    let worker_concurrency = config.server.worker_concurrency;
    let state = AppState::new(config, database, logbus, broker, shutdown.clone());
    let router = api::build_router(state);

    info!("");
    info!("🚀 ═══════════════════════════════════════════");
    info!("🚀          SUBWARDEN CONTROL PLANE");
    info!("🚀 ═══════════════════════════════════════════");
    info!("🌐 HTTP/WS: {}", bind_addr);
    info!("⚙️  Worker slots: {}", worker_concurrency);
    info!("🔄 Ready to accept subtitle jobs...");
    info!("");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received; closing streams and workers");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(())
}

/// First-run bootstrap: without any user row the API would be unusable, so
/// an initial superuser with a generated token is created and printed once.
async fn bootstrap_admin(database: &JobDatabase) -> anyhow::Result<()> {
    if database.count_users().await? > 0 {
        return Ok(());
    }
    let token = uuid::Uuid::new_v4().to_string();
    let admin = User {
        id: uuid::Uuid::new_v4().to_string(),
        email: "admin@localhost".to_string(),
        role: "admin".to_string(),
        is_superuser: true,
        is_service_account: false,
        api_token: Some(token.clone()),
    };
    database.insert_user(&admin).await?;
    info!("Created initial superuser '{}' with API token: {}", admin.email, token);
    Ok(())
}
