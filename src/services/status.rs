use std::sync::Arc;
use std::time::Duration;

use crate::models::job::{ErrorDetail, JobId};
use crate::models::progress::ProgressReport;
use crate::services::job_store::{JobStore, JobStoreError};

/// Read side of the job lifecycle: progress polling and result retrieval.
pub struct StatusService {
    store: Arc<dyn JobStore>,
    fetch_timeout: Duration,
}

impl StatusService {
    pub fn new(store: Arc<dyn JobStore>, fetch_timeout: Duration) -> Self {
        Self {
            store,
            fetch_timeout,
        }
    }

    /// Non-blocking progress lookup.
    ///
    /// Unknown and unparseable ids both yield an empty report.
    pub async fn poll(&self, job_id: &str) -> Result<ProgressReport, JobStoreError> {
        let Ok(job_id) = job_id.parse::<JobId>() else {
            return Ok(ProgressReport::unknown());
        };

        match self.store.get(job_id).await {
            Ok(job) => Ok(ProgressReport::from_job(&job)),
            Err(JobStoreError::UnknownJob(_)) => Ok(ProgressReport::unknown()),
            Err(e) => Err(e),
        }
    }

    /// Wait, bounded by the configured timeout, for the artifact location.
    pub async fn fetch(&self, job_id: &str) -> Result<String, FetchError> {
        let job_id = job_id
            .parse::<JobId>()
            .map_err(|_| FetchError::NotFound)?;

        match self
            .store
            .fetch_result_blocking(job_id, self.fetch_timeout)
            .await
        {
            Ok(location) => Ok(location),
            Err(JobStoreError::UnknownJob(_)) => Err(FetchError::NotFound),
            Err(JobStoreError::JobFailed { detail, .. }) => Err(FetchError::Failed(detail)),
            Err(JobStoreError::Timeout { waited, .. }) => Err(FetchError::NotReady(waited)),
            Err(e) => Err(FetchError::Store(e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Job not found")]
    NotFound,

    #[error("Job failed: {0}")]
    Failed(ErrorDetail),

    #[error("Job not finished within {0:?}")]
    NotReady(Duration),

    #[error("Job store error: {0}")]
    Store(JobStoreError),
}
