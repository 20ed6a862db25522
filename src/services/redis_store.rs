use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::{sleep, Instant};

use crate::models::job::{Job, JobId};
use crate::services::job_store::{apply, terminal_outcome, JobStore, JobStoreError, Transition};

const JOB_KEY_PREFIX: &str = "crop_queue:job:";

/// Compare-and-set attempts before a transition gives up with `Contention`.
const CAS_ATTEMPTS: usize = 5;

/// Replace the record only if nobody changed it since it was read.
const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'KEEPTTL')
    return 1
end
return 0
"#;

/// Redis-backed job store. Each job is one JSON string key with a TTL.
pub struct RedisJobStore {
    client: redis::Client,
    ttl: Duration,
    poll_interval: Duration,
    cas: redis::Script,
}

impl RedisJobStore {
    pub fn new(redis_url: &str, ttl: Duration) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            ttl,
            poll_interval: Duration::from_millis(250),
            cas: redis::Script::new(CAS_SCRIPT),
        })
    }

    /// Interval between reads while `fetch_result_blocking` waits.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn key(job_id: JobId) -> String {
        format!("{JOB_KEY_PREFIX}{job_id}")
    }

    async fn read_raw(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: JobId,
    ) -> Result<(String, Job), JobStoreError> {
        let raw: Option<String> = conn.get(Self::key(job_id)).await?;
        let raw = raw.ok_or(JobStoreError::UnknownJob(job_id))?;
        let job = serde_json::from_str(&raw)?;
        Ok((raw, job))
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let job = Job::pending(job_id);
        let payload = serde_json::to_string(&job)?;

        let created: Option<String> = redis::cmd("SET")
            .arg(Self::key(job_id))
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        match created {
            Some(_) => Ok(job),
            None => Err(JobStoreError::DuplicateJob(job_id)),
        }
    }

    async fn transition(
        &self,
        job_id: JobId,
        transition: Transition,
    ) -> Result<Job, JobStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        for attempt in 1..=CAS_ATTEMPTS {
            let (raw, job) = self.read_raw(&mut conn, job_id).await?;
            let Some(next) = apply(&job, &transition)? else {
                return Ok(job);
            };

            let payload = serde_json::to_string(&next)?;
            let swapped: i32 = self
                .cas
                .key(Self::key(job_id))
                .arg(&raw)
                .arg(&payload)
                .invoke_async(&mut conn)
                .await?;

            if swapped == 1 {
                return Ok(next);
            }
            tracing::debug!(job_id = %job_id, attempt, "Job record changed during update, retrying");
        }

        Err(JobStoreError::Contention(job_id))
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (_, job) = self.read_raw(&mut conn, job_id).await?;
        Ok(job)
    }

    async fn fetch_result_blocking(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<String, JobStoreError> {
        let deadline = Instant::now() + timeout;
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        loop {
            let (_, job) = self.read_raw(&mut conn, job_id).await?;
            if let Some(outcome) = terminal_outcome(&job) {
                return outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(JobStoreError::Timeout {
                    job_id,
                    waited: timeout,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn health_check(&self) -> Result<(), JobStoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await?;
        Ok(())
    }
}
