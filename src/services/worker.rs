use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::models::job::{ErrorDetail, JobState};
use crate::services::job_store::JobStoreError;
use crate::services::processor::{ImageProcessor, ProcessingError};
use crate::services::queue::{Delivery, QueueError, TaskQueue};
use crate::services::storage::UploadStorage;

const MAX_INFRA_ATTEMPTS: u32 = 5;
const DEQUEUE_WAIT: Duration = Duration::from_secs(1);

/// Exponential backoff for infrastructure retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(5))
    }
}

/// Errors that may succeed if the same call is repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for JobStoreError {
    fn is_transient(&self) -> bool {
        JobStoreError::is_transient(self)
    }
}

impl Transient for QueueError {
    fn is_transient(&self) -> bool {
        QueueError::is_transient(self)
    }
}

/// Run `op`, retrying transient failures with backoff.
pub async fn retry_transient<T, E, F, Fut>(what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::default();
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < MAX_INFRA_ATTEMPTS => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    operation = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient infrastructure error, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Why a delivery could not be processed to a recorded outcome.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Job store error: {0}")]
    Store(#[from] JobStoreError),
}

impl Transient for WorkerError {
    fn is_transient(&self) -> bool {
        match self {
            WorkerError::Store(e) => e.is_transient(),
        }
    }
}

/// Pulls crop tasks, runs them and records progress and outcome.
///
/// The worker is the only writer of the jobs it dequeues.
pub struct Worker {
    name: String,
    queue: TaskQueue,
    storage: Arc<UploadStorage>,
    processor: Arc<ImageProcessor>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: TaskQueue,
        storage: Arc<UploadStorage>,
        processor: Arc<ImageProcessor>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            storage,
            processor,
        }
    }

    /// Main loop; returns once `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match retry_transient("recover", || self.queue.recover(&self.name)).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(worker = %self.name, recovered = n, "Requeued unacknowledged tasks"),
            Err(e) => tracing::error!(worker = %self.name, error = %e, "Failed to recover unacknowledged tasks"),
        }

        tracing::info!(worker = %self.name, "Worker ready, starting job processing loop");
        let mut backoff = Backoff::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = self.queue.dequeue(&self.name, DEQUEUE_WAIT) => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    backoff.reset();
                    self.handle(delivery).await;
                }
                Ok(None) => {
                    backoff.reset();
                    tracing::trace!(worker = %self.name, "No jobs available");
                }
                Err(QueueError::Malformed(e)) => {
                    tracing::error!(worker = %self.name, error = %e, "Dropped malformed task payload");
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        worker = %self.name,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Error dequeuing job, will retry"
                    );
                    sleep(delay).await;
                }
            }
        }

        tracing::info!(worker = %self.name, "Worker stopped");
    }

    /// Process one delivery and acknowledge it once its outcome is recorded.
    ///
    /// If the store is unreachable the delivery stays unacknowledged and is
    /// redelivered after `recover`. Permanent store errors, such as a job
    /// record that expired or was deleted, drop the delivery.
    pub async fn handle(&self, delivery: Delivery) {
        let job_id = delivery.job_id();
        match self.process_delivery(&delivery).await {
            Ok(state) => {
                tracing::debug!(job_id = %job_id, state = %state, "Acknowledging task");
                self.ack(&delivery).await;
            }
            Err(e) if e.is_transient() => {
                tracing::error!(
                    job_id = %job_id,
                    error = %e,
                    "Could not record job outcome, leaving task for redelivery"
                );
            }
            Err(e) => {
                metrics::counter!("crop_jobs_failed_total").increment(1);
                tracing::error!(
                    job_id = %job_id,
                    error = %e,
                    "Job cannot be processed, dropping task"
                );
                self.ack(&delivery).await;
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = retry_transient("ack", || self.queue.ack(&self.name, delivery)).await {
            tracing::error!(job_id = %delivery.job_id(), error = %e, "Failed to acknowledge task");
        }
    }

    /// Returns the terminal state the job ended in.
    pub async fn process_delivery(&self, delivery: &Delivery) -> Result<JobState, WorkerError> {
        let message = &delivery.message;
        let job_id = message.job_id;
        let store = self.queue.store();

        let current = retry_transient("get", || store.get(job_id)).await?;
        if current.is_terminal() {
            tracing::info!(
                job_id = %job_id,
                state = %current.state(),
                "Redelivered job already finished, skipping"
            );
            return Ok(current.state());
        }

        tracing::info!(
            job_id = %job_id,
            source = %message.source_path,
            filename = %message.filename,
            "Processing crop job"
        );
        retry_transient("set_progress", || store.set_progress(job_id, 0.0)).await?;

        let start = Instant::now();
        let result = self.run_processor(delivery).await;
        metrics::histogram!("crop_job_processing_seconds").record(start.elapsed().as_secs_f64());

        let recorded = match result {
            Ok(output) => {
                let location = output.to_string_lossy().to_string();
                let recorded =
                    retry_transient("set_success", || store.set_success(job_id, &location)).await;
                if recorded.is_ok() {
                    metrics::counter!("crop_jobs_completed_total").increment(1);
                    tracing::info!(
                        job_id = %job_id,
                        output = %location,
                        duration_ms = start.elapsed().as_millis() as u64,
                        "Job completed successfully"
                    );
                }
                recorded
            }
            Err(e) => {
                let detail = ErrorDetail::from(&e);
                tracing::warn!(job_id = %job_id, kind = %detail.kind, error = %e, "Job processing failed");
                let recorded =
                    retry_transient("set_failure", || store.set_failure(job_id, detail.clone()))
                        .await;
                if recorded.is_ok() {
                    metrics::counter!("crop_jobs_failed_total").increment(1);
                }
                recorded
            }
        };

        match recorded {
            Ok(job) => Ok(job.state()),
            // Another delivery of the same job already recorded an outcome.
            Err(JobStoreError::InvalidState { current, .. }) => {
                tracing::warn!(job_id = %job_id, state = %current, "Job outcome already recorded");
                Ok(current)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Run the processor on a blocking thread, forwarding its checkpoints to the store.
    async fn run_processor(&self, delivery: &Delivery) -> Result<PathBuf, ProcessingError> {
        let job_id = delivery.job_id();
        let source = PathBuf::from(&delivery.message.source_path);
        let output_dir = self.storage.output_dir().to_path_buf();
        let processor = self.processor.clone();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || {
            processor.process(job_id, &source, &output_dir, |fraction| {
                let _ = tx.send(fraction);
            })
        });

        let store = self.queue.store();
        while let Some(fraction) = rx.recv().await {
            match store.set_progress(job_id, fraction).await {
                Ok(_) => tracing::debug!(job_id = %job_id, progress = fraction, "Progress updated"),
                Err(e) => {
                    tracing::warn!(job_id = %job_id, progress = fraction, error = %e, "Failed to record progress")
                }
            }
        }

        match handle.await {
            Ok(result) => result,
            Err(e) => Err(ProcessingError::Aborted(e.to_string())),
        }
    }
}

/// Spawn `count` workers named `<base_name>-<n>` that share one shutdown signal.
pub fn spawn_pool(
    count: usize,
    base_name: &str,
    queue: TaskQueue,
    storage: Arc<UploadStorage>,
    processor: Arc<ImageProcessor>,
    shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut workers = JoinSet::new();
    for n in 0..count {
        let worker = Worker::new(
            format!("{base_name}-{n}"),
            queue.clone(),
            storage.clone(),
            processor.clone(),
        );
        let shutdown = shutdown.clone();
        workers.spawn(async move { worker.run(shutdown).await });
    }
    workers
}
