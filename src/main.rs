use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod detector;
mod error;
mod odds;
mod scheduler;

use api::AppState;
use config::Config;
use db::Database;
use detector::Detector;
use odds::{OddsProvider, TheOddsApi};
use scheduler::Scheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database
    let db = Database::open(&config.database_path)
        .with_context(|| format!("opening database {}", config.database_path))?;
    info!("Database opened: {}", config.database_path);

    let scheduler_config = config.scheduler_config();

    // Build odds providers
    let mut providers: Vec<Arc<dyn OddsProvider>> = Vec::new();
    match config.odds_api_key.as_deref() {
        Some(key) => {
            let mut bookmakers: Vec<String> = scheduler_config
                .tracked_sportsbooks
                .iter()
                .cloned()
                .collect();
            bookmakers.sort();
            providers.push(Arc::new(TheOddsApi::new(
                key,
                &config.odds_api_url,
                bookmakers,
            )?));
        }
        None => warn!("ODDS_API_KEY not set; ingestion cycles will fail until a provider is configured"),
    }
    info!("Configured {} odds provider(s)", providers.len());

    let detector_config = config.detector_config();
    info!(
        "Detection: strategy={:?} window={} threshold={}c cooldown={}m",
        detector_config.strategy,
        detector_config.window_size,
        detector_config.movement_threshold,
        detector_config.cooldown_minutes
    );
    let detector = Detector::new(db.clone(), detector_config);
    let scheduler = Scheduler::new(db.clone(), detector, providers, scheduler_config);

    // Shutdown fan-out: Ctrl-C stops the scheduler loop and the API server
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let scheduler_task = tokio::spawn(scheduler.clone().run(shutdown_rx.clone()));

    // Start the JSON API server
    let app = api::router(AppState {
        db: db.clone(),
        scheduler,
    });
    let addr: SocketAddr = config.api_addr.parse()?;
    info!("API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    if let Err(e) = scheduler_task.await {
        warn!("Scheduler task ended abnormally: {}", e);
    }
    Ok(())
}
