//! Kindling - warmup engine entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use kindling_api::{create_router, AppState};
use kindling_common::config::{Config, LoggingConfig};
use kindling_core::{Collaborators, Engine};
use kindling_storage::{DatabasePool, Repositories};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Optional explicit config path, otherwise the default locations
    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load_layered(Some(&path))?,
        None => Config::load()?,
    };
    config.validate()?;

    init_logging(&config.logging);
    info!(node = %config.server.hostname, "Starting Kindling warmup engine...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    db_pool.migrate().await?;

    let repos = Repositories::postgres(db_pool.clone());
    let collaborators = Collaborators::from_config(&config, &repos)?;
    let engine = Engine::new(config.clone(), repos, collaborators)?;
    engine.seed_templates().await?;

    let recurring = engine.recurring();
    recurring.register_defaults(Utc::now()).await?;

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    // Queue workers
    for _ in 0..config.queue.workers.max(1) {
        let worker = engine.worker();
        let shutdown = shutdown.clone();
        tasks.spawn(async move { worker.run(shutdown).await });
    }
    info!(workers = config.queue.workers.max(1), "Queue workers started");

    // Recurring ticker
    {
        let shutdown = shutdown.clone();
        tasks.spawn(async move { recurring.run(shutdown).await });
    }

    // API server
    if config.api.enabled {
        let addr = format!("{}:{}", config.server.bind_address, config.api.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind API server on {}", addr))?;
        let app = create_router(AppState::new(engine.clone(), Some(db_pool.clone())));
        let shutdown = shutdown.clone();

        info!("Starting API server on {}", addr);
        tasks.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("API server error: {}", e);
            }
        });
    } else {
        info!("API server disabled");
    }

    info!("Kindling started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Task failed during shutdown: {}", e);
        }
    }

    info!("Kindling shutdown complete");

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match logging.level.as_str() {
        "info" => EnvFilter::new("info,kindling=debug"),
        level => EnvFilter::new(level),
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
