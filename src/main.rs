use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crop_queue::app_state::{self, AppState, Backends, StartupError};
use crop_queue::config::{AppConfig, JobBackend};
use crop_queue::routes;
use crop_queue::services::processor::ImageProcessor;
use crop_queue::services::worker;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    if config.job_backend == JobBackend::Memory && config.embedded_workers == 0 {
        panic!("{}", StartupError::MemoryBackendWithoutWorkers);
    }

    tracing::info!("Initializing crop-queue server");

    let prometheus_handle =
        routes::metrics::install_recorder().expect("Failed to install Prometheus metrics recorder");

    tracing::info!(backend = ?config.job_backend, "Connecting to job store and task broker");
    let backends = Backends::connect(&config)
        .await
        .expect("Failed to connect to job backends");

    let storage = app_state::init_storage(&config)
        .await
        .expect("Failed to prepare upload storage");

    let queue = backends.task_queue();
    let state = AppState::new(
        queue.clone(),
        storage.clone(),
        Duration::from_secs(config.fetch_timeout_secs),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = worker::spawn_pool(
        config.embedded_workers,
        &config.worker_name(),
        queue,
        storage,
        Arc::new(ImageProcessor::default()),
        shutdown_rx,
    );
    if config.embedded_workers > 0 {
        tracing::info!(count = config.embedded_workers, "Started embedded workers");
    }

    let app = routes::metrics::with_metrics(
        routes::router(state, config.max_upload_bytes),
        prometheus_handle,
    );

    tracing::info!("Starting crop-queue on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    let _ = shutdown_tx.send(true);
    while workers.join_next().await.is_some() {}
}
