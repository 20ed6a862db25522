use std::sync::Arc;

use crop_queue::{
    app_state::{self, Backends},
    config::{AppConfig, JobBackend},
    services::{processor::ImageProcessor, worker},
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting crop worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    if config.job_backend == JobBackend::Memory {
        panic!("The standalone worker needs a shared backend; set JOB_BACKEND=redis");
    }

    tracing::info!("Connecting to Redis");
    let backends = Backends::connect(&config)
        .await
        .expect("Failed to connect to job backends");

    let storage = app_state::init_storage(&config)
        .await
        .expect("Failed to prepare upload storage");

    let name = config.worker_name();
    if config.stable_worker_name().is_none() {
        tracing::warn!(worker = %name, "Neither WORKER_NAME nor HOSTNAME set; unacknowledged tasks will not be recovered after a restart");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = worker::spawn_pool(
        config.worker_concurrency,
        &name,
        backends.task_queue(),
        storage,
        Arc::new(ImageProcessor::default()),
        shutdown_rx,
    );

    tracing::info!(worker = %name, concurrency = config.worker_concurrency, "Worker pool running");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, draining workers");
        }
        _ = async { while workers.join_next().await.is_some() {} } => {
            tracing::warn!("All workers exited");
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }

    tracing::info!("Worker shut down");
}
