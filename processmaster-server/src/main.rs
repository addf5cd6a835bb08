use std::sync::Arc;

use clap::Parser;
use processmaster_core::models::Role;
use processmaster_core::{vision_backend, LocalObjectStore, ObjectStore, ProcessMasterConfig};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use processmaster_server::http::{self, AppState};
use processmaster_server::subsystems::auth::AuthGateway;
use processmaster_server::subsystems::jobs::{self, JobQueue};
use processmaster_server::subsystems::synthesis::{PipelineJobHandler, StoreOrHttpFetcher};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "processmaster.toml")]
    config: String,

    /// Check database connectivity and exit.
    #[arg(long)]
    health: bool,

    /// Apply migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Create a local account with this email and exit.
    #[arg(long, requires = "password")]
    create_user: Option<String>,

    #[arg(long, env = "PROCESSMASTER_BOOTSTRAP_PASSWORD")]
    password: Option<String>,

    #[arg(long, default_value = "user")]
    role: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match ProcessMasterConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; the configured level is added as a directive on top of RUST_LOG
    let level: tracing::Level = config.service.log_level.parse().unwrap_or(tracing::Level::INFO);
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    // Connect to DB
    let pool = match processmaster_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match processmaster_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ ProcessMaster DB health check passed");
        return Ok(());
    }

    processmaster_core::db::run_migrations(&pool).await?;
    if args.migrate_only {
        println!("✅ Migrations applied");
        return Ok(());
    }

    let auth = AuthGateway::from_config(pool.clone(), config.auth.clone())?;

    if let Some(email) = args.create_user {
        let role: Role = args
            .role
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid --role: {}", e))?;
        let password = args.password.unwrap_or_default();
        let user = auth.create_local_user(&email, &password, role).await?;
        println!("✅ Created {} ({}) with role {}", user.email, user.id, user.role);
        return Ok(());
    }

    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(&config.storage)?);
    let vision = vision_backend(config.vision.clone())?;
    let fetcher = Arc::new(StoreOrHttpFetcher::new(store.clone()));

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Job workers and the recovery sweep
    let (queue, job_rx) = JobQueue::new(pool.clone(), config.jobs.clone());
    let handler = Arc::new(PipelineJobHandler::new(
        pool.clone(),
        vision.clone(),
        fetcher.clone(),
        config.vision.concurrency,
    ));
    queue.spawn_workers(job_rx, handler, &tx);
    tokio::spawn(jobs::run_recovery_loop(queue.clone(), tx.subscribe()));

    let state = Arc::new(AppState {
        pool,
        vision,
        store,
        fetcher,
        auth: Arc::new(auth),
        jobs: queue,
        config,
    });

    http::start_http_server(state, tx.subscribe()).await?;

    Ok(())
}
