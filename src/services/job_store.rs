use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::models::job::{ErrorDetail, Job, JobId, JobState, JobStatus};

/// A requested state change for one job.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Progress(f64),
    Success(String),
    Failure(ErrorDetail),
}

impl Transition {
    fn target(&self) -> JobState {
        match self {
            Transition::Progress(_) => JobState::Progress,
            Transition::Success(_) => JobState::Success,
            Transition::Failure(_) => JobState::Failure,
        }
    }
}

/// Apply a transition to a job snapshot.
///
/// Returns `Ok(None)` when the transition is accepted but changes nothing:
/// a progress fraction at or below the recorded one, or a repeated terminal
/// outcome identical to the stored one. Progress updates on a terminal job
/// are rejected with `InvalidState`.
pub fn apply(job: &Job, transition: &Transition) -> Result<Option<Job>, JobStoreError> {
    let invalid = || JobStoreError::InvalidState {
        job_id: job.id,
        current: job.state(),
        attempted: transition.target(),
    };

    let next = match (&job.status, transition) {
        (_, Transition::Progress(fraction)) if !(0.0..=1.0).contains(fraction) => {
            return Err(JobStoreError::InvalidProgress {
                job_id: job.id,
                fraction: *fraction,
            });
        }
        (JobStatus::Pending, Transition::Progress(fraction)) => JobStatus::Progress {
            progress: *fraction,
        },
        (JobStatus::Progress { progress }, Transition::Progress(fraction)) => {
            if *fraction <= *progress {
                return Ok(None);
            }
            JobStatus::Progress {
                progress: *fraction,
            }
        }
        (JobStatus::Pending | JobStatus::Progress { .. }, Transition::Success(result)) => {
            JobStatus::Success {
                result: result.clone(),
            }
        }
        (JobStatus::Pending | JobStatus::Progress { .. }, Transition::Failure(error)) => {
            JobStatus::Failure {
                error: error.clone(),
            }
        }
        (JobStatus::Success { result }, Transition::Success(requested)) if result == requested => {
            return Ok(None);
        }
        (JobStatus::Failure { error }, Transition::Failure(requested)) if error == requested => {
            return Ok(None);
        }
        _ => return Err(invalid()),
    };

    Ok(Some(Job {
        status: next,
        updated_at: Utc::now(),
        ..job.clone()
    }))
}

/// Convert a terminal job into the outcome `fetch_result_blocking` reports.
pub fn terminal_outcome(job: &Job) -> Option<Result<String, JobStoreError>> {
    match &job.status {
        JobStatus::Success { result } => Some(Ok(result.clone())),
        JobStatus::Failure { error } => Some(Err(JobStoreError::JobFailed {
            job_id: job.id,
            detail: error.clone(),
        })),
        JobStatus::Pending | JobStatus::Progress { .. } => None,
    }
}

/// Single source of truth for job state.
///
/// Workers are the only writers of a given job; the status service only reads.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Register a job in PENDING state.
    async fn create(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Apply a transition atomically with respect to other writers of the same job.
    async fn transition(&self, job_id: JobId, transition: Transition)
        -> Result<Job, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Block until the job is terminal or `timeout` elapses.
    async fn fetch_result_blocking(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<String, JobStoreError>;

    /// Check backend connectivity (for health checks).
    async fn health_check(&self) -> Result<(), JobStoreError>;

    async fn set_progress(&self, job_id: JobId, fraction: f64) -> Result<Job, JobStoreError> {
        self.transition(job_id, Transition::Progress(fraction)).await
    }

    async fn set_success(&self, job_id: JobId, result_ref: &str) -> Result<Job, JobStoreError> {
        self.transition(job_id, Transition::Success(result_ref.to_string()))
            .await
    }

    async fn set_failure(&self, job_id: JobId, error: ErrorDetail) -> Result<Job, JobStoreError> {
        self.transition(job_id, Transition::Failure(error)).await
    }
}

/// In-process job store.
///
/// Each job owns a watch channel: writes to one job are serialized by that
/// channel's lock, and blocking fetches subscribe to it instead of polling.
/// Terminal jobs older than the ttl are evicted lazily on reads and on
/// every `create`.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, watch::Sender<Job>>,
    ttl: Option<Duration>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire terminal jobs `ttl` after their last update.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn is_expired(&self, job: &Job) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        job.is_terminal() && Utc::now() - job.updated_at >= ttl
    }

    /// Drop expired terminal jobs; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let before = self.jobs.len();
        self.jobs.retain(|_, sender| !self.is_expired(&sender.borrow()));
        let purged = before.saturating_sub(self.jobs.len());
        if purged > 0 {
            tracing::debug!(purged, "Evicted expired jobs");
        }
        purged
    }

    fn live_sender(&self, job_id: JobId) -> Result<watch::Sender<Job>, JobStoreError> {
        let sender = self
            .jobs
            .get(&job_id)
            .map(|sender| sender.clone())
            .ok_or(JobStoreError::UnknownJob(job_id))?;

        if self.is_expired(&sender.borrow()) {
            self.jobs
                .remove_if(&job_id, |_, held| self.is_expired(&held.borrow()));
            return Err(JobStoreError::UnknownJob(job_id));
        }
        Ok(sender)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.purge_expired();
        match self.jobs.entry(job_id) {
            Entry::Occupied(_) => Err(JobStoreError::DuplicateJob(job_id)),
            Entry::Vacant(slot) => {
                let job = Job::pending(job_id);
                slot.insert(watch::Sender::new(job.clone()));
                Ok(job)
            }
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        transition: Transition,
    ) -> Result<Job, JobStoreError> {
        let sender = self.live_sender(job_id)?;

        let mut outcome = Err(JobStoreError::UnknownJob(job_id));
        sender.send_if_modified(|job| match apply(job, &transition) {
            Ok(Some(next)) => {
                *job = next;
                outcome = Ok(job.clone());
                true
            }
            Ok(None) => {
                outcome = Ok(job.clone());
                false
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let sender = self.live_sender(job_id)?;
        let job = Job::clone(&sender.borrow());
        Ok(job)
    }

    async fn fetch_result_blocking(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<String, JobStoreError> {
        let mut rx = self.live_sender(job_id)?.subscribe();

        let job = match tokio::time::timeout(timeout, rx.wait_for(Job::is_terminal)).await {
            Ok(Ok(job)) => Job::clone(&job),
            // Sender dropped: the job was evicted while we waited.
            Ok(Err(_)) => return Err(JobStoreError::UnknownJob(job_id)),
            Err(_) => {
                return Err(JobStoreError::Timeout {
                    job_id,
                    waited: timeout,
                })
            }
        };

        terminal_outcome(&job).unwrap_or(Err(JobStoreError::Timeout {
            job_id,
            waited: timeout,
        }))
    }

    async fn health_check(&self) -> Result<(), JobStoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),

    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    #[error("Job {job_id} cannot move from {current} to {attempted}")]
    InvalidState {
        job_id: JobId,
        current: JobState,
        attempted: JobState,
    },

    #[error("Job {job_id}: progress fraction {fraction} outside 0.0..=1.0")]
    InvalidProgress { job_id: JobId, fraction: f64 },

    #[error("Job {job_id} failed: {detail}")]
    JobFailed { job_id: JobId, detail: ErrorDetail },

    #[error("Job {job_id} not finished after {waited:?}")]
    Timeout { job_id: JobId, waited: Duration },

    #[error("Job {0} is being updated concurrently")]
    Contention(JobId),

    #[error("Redis error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl JobStoreError {
    /// Infrastructure failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobStoreError::Transport(_) | JobStoreError::Contention(_)
        )
    }
}
