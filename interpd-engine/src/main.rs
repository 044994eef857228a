//! interpd-engine - Automatic interpreter assignment service
//!
//! Runs the HTTP API plus two background loops: the pool ticker
//! (threshold/deadline batches) and the load monitor (auto mode switch,
//! degradation re-evaluation).

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use interpd_common::clock::{Clock, SystemClock};
use interpd_common::config::EngineConfig;
use interpd_common::db::init::init_database;
use interpd_common::events::EventBus;
use interpd_engine::commit::CommitConfig;
use interpd_engine::monitor;
use interpd_engine::orchestrator::Engine;
use interpd_engine::policy::PolicyStore;
use interpd_engine::pool::Pool;
use interpd_engine::recovery::DegradationState;
use interpd_engine::scheduler;
use interpd_engine::{build_router, AppState};

#[derive(Debug, Parser)]
#[command(name = "interpd-engine", about = "Automatic interpreter assignment engine")]
struct Cli {
    /// SQLite database file
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long)]
    bind_addr: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting interpd-engine v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = EngineConfig::load(
        cli.db_path.as_deref(),
        cli.bind_addr.as_deref(),
        cli.config.as_deref(),
    )?;
    info!("Database path: {}", config.db_path.display());

    let db = match init_database(&config.db_path).await {
        Ok(db) => {
            info!("Database ready");
            db
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return Err(e.into());
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine = Engine::new(
        db.clone(),
        clock.clone(),
        PolicyStore::new(db.clone(), clock.clone()),
        Pool::new(db, clock, config.pool_stale_minutes),
        EventBus::default(),
        CommitConfig {
            retries: config.commit_retries,
            backoff_ms: config.commit_backoff_ms,
            lock_wait_ms: config.lock_wait_ms,
        },
        DegradationState::default(),
    );

    let cancel = CancellationToken::new();
    let pool_ticker = tokio::spawn(scheduler::run_pool_ticker(
        engine.clone(),
        config.pool_tick_secs,
        cancel.clone(),
    ));
    let monitor_ticker = tokio::spawn(scheduler::run_monitor_ticker(
        engine.clone(),
        config.monitor_tick_secs,
        monitor::LoadThresholds::default(),
        monitor::default_preferences(),
        cancel.clone(),
    ));

    let app = build_router(AppState::new(engine));
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("interpd-engine listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    cancel.cancel();
    let _ = pool_ticker.await;
    let _ = monitor_ticker.await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
