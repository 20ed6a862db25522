//! Test helpers: an in-process deployment and HTTP client helpers for E2E runs

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crop_queue::app_state::AppState;
use crop_queue::models::job::JobState;
use crop_queue::models::progress::{ProgressReport, SubmitResponse};
use crop_queue::services::job_store::{JobStore, MemoryJobStore};
use crop_queue::services::processor::ImageProcessor;
use crop_queue::services::queue::{MemoryBroker, TaskQueue};
use crop_queue::services::storage::UploadStorage;
use crop_queue::services::worker;
use reqwest::multipart;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Server state plus a worker pool, all in memory.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<MemoryBroker>,
    pub queue: TaskQueue,
    pub storage: Arc<UploadStorage>,
    pub state: AppState,
    shutdown: watch::Sender<bool>,
    workers: JoinSet<()>,
}

impl Harness {
    pub async fn start(workers: usize) -> Self {
        Self::with_store(Arc::new(MemoryJobStore::new()), workers, "worker").await
    }

    pub async fn with_store(store: Arc<dyn JobStore>, workers: usize, worker_name: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(UploadStorage::new(
            dir.path().join("uploads"),
            dir.path().join("out"),
        ));
        storage.ensure_dirs().await.expect("create storage dirs");

        let broker = Arc::new(MemoryBroker::new());
        let queue = TaskQueue::new(broker.clone(), store.clone());
        let state = AppState::new(queue.clone(), storage.clone(), Duration::from_secs(10));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = worker::spawn_pool(
            workers,
            worker_name,
            queue.clone(),
            storage.clone(),
            Arc::new(ImageProcessor::default()),
            shutdown_rx,
        );

        Self {
            dir,
            store,
            broker,
            queue,
            storage,
            state,
            shutdown,
            workers,
        }
    }

    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        while self.workers.join_next().await.is_some() {}
    }
}

/// Poll the status service until the job is terminal, returning every report seen.
pub async fn poll_until_terminal(state: &AppState, job_id: &str) -> Vec<ProgressReport> {
    let mut reports = Vec::new();
    for _ in 0..2_000 {
        let report = state.status.poll(job_id).await.expect("poll");
        let done = matches!(report.state, Some(s) if s.is_terminal());
        reports.push(report);
        if done {
            return reports;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not finish; last report: {:?}", reports.last());
}

/// Assert progress never decreases across successive reports.
pub fn assert_monotonic(reports: &[ProgressReport]) {
    let values: Vec<f64> = reports.iter().filter_map(|r| r.progress).collect();
    assert!(
        values.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {values:?}"
    );
}

/// Upload an image to POST /submit
pub async fn upload_image(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<reqwest::Response, Box<dyn std::error::Error>> {
    let form = multipart::Form::new().part(
        "image",
        multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")?,
    );

    let response = client
        .post(format!("{}/submit", base_url))
        .multipart(form)
        .send()
        .await?;
    Ok(response)
}

/// Upload and expect the job to be accepted
pub async fn submit_image(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    bytes: Vec<u8>,
) -> Result<SubmitResponse, Box<dyn std::error::Error>> {
    let response = upload_image(client, base_url, filename, bytes).await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<SubmitResponse>().await?)
}

/// Poll GET /progress until the job is terminal (with timeout)
pub async fn poll_progress(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    timeout_secs: u64,
) -> Result<Vec<ProgressReport>, Box<dyn std::error::Error>> {
    let max_attempts = timeout_secs * 4; // Poll every 250ms
    let mut reports = Vec::new();

    for attempt in 0..max_attempts {
        let report = client
            .get(format!("{}/progress", base_url))
            .query(&[("jobid", job_id)])
            .send()
            .await?
            .json::<ProgressReport>()
            .await?;

        match report.state {
            Some(JobState::Success) | Some(JobState::Failure) => {
                reports.push(report);
                return Ok(reports);
            }
            Some(_) => {
                if attempt % 20 == 0 && attempt > 0 {
                    println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
                }
                reports.push(report);
                sleep(Duration::from_millis(250)).await;
            }
            None => return Err(format!("Job {} unknown to the server", job_id).into()),
        }
    }

    Err(format!("Job did not complete within {} seconds", timeout_secs).into())
}
