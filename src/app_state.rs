use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AppConfig, JobBackend};
use crate::services::{
    job_store::{JobStore, JobStoreError, MemoryJobStore},
    queue::{Broker, MemoryBroker, QueueError, RedisBroker, TaskQueue},
    redis_store::RedisJobStore,
    status::StatusService,
    storage::{StorageError, UploadStorage},
    submission::SubmissionService,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub storage: Arc<UploadStorage>,
    pub submission: Arc<SubmissionService>,
    pub status: Arc<StatusService>,
}

impl AppState {
    pub fn new(queue: TaskQueue, storage: Arc<UploadStorage>, fetch_timeout: Duration) -> Self {
        Self {
            submission: Arc::new(SubmissionService::new(storage.clone(), queue.clone())),
            status: Arc::new(StatusService::new(queue.store().clone(), fetch_timeout)),
            queue,
            storage,
        }
    }
}

/// Job store and broker selected by configuration, checked for reachability.
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
}

impl Backends {
    pub async fn connect(config: &AppConfig) -> Result<Self, StartupError> {
        let backends = match config.job_backend {
            JobBackend::Redis => Self {
                store: Arc::new(RedisJobStore::new(
                    &config.redis_url,
                    Duration::from_secs(config.job_ttl_secs),
                )?),
                broker: Arc::new(RedisBroker::new(&config.redis_url)?),
            },
            JobBackend::Memory => Self {
                store: Arc::new(
                    MemoryJobStore::new().with_ttl(Duration::from_secs(config.job_ttl_secs)),
                ),
                broker: Arc::new(MemoryBroker::new()),
            },
        };

        backends.store.health_check().await?;
        backends.broker.health_check().await?;
        Ok(backends)
    }

    pub fn task_queue(&self) -> TaskQueue {
        TaskQueue::new(self.broker.clone(), self.store.clone())
    }
}

/// Storage rooted at the configured directories, created if missing.
pub async fn init_storage(config: &AppConfig) -> Result<Arc<UploadStorage>, StartupError> {
    let storage = UploadStorage::new(
        PathBuf::from(&config.upload_dir),
        PathBuf::from(&config.output_dir),
    );
    storage.ensure_dirs().await?;
    Ok(Arc::new(storage))
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Job store unavailable: {0}")]
    Store(#[from] JobStoreError),

    #[error("Task broker unavailable: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("Memory backend needs EMBEDDED_WORKERS > 0 in the server process")]
    MemoryBackendWithoutWorkers,
}
