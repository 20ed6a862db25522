use garde::Validate;
use serde::Deserialize;

/// Which backend holds job state and transports tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobBackend {
    /// Redis for both the broker and the job store.
    Redis,
    /// In-process store and broker; only usable with embedded workers.
    Memory,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Unused by worker processes.
    #[serde(default = "default_bind_addr")]
    #[garde(length(min = 1))]
    pub bind_addr: String,

    /// Redis connection string for the task queue and job state
    #[serde(default = "default_redis_url")]
    #[garde(length(min = 1))]
    pub redis_url: String,

    #[serde(default = "default_job_backend")]
    #[garde(skip)]
    pub job_backend: JobBackend,

    /// Directory uploads are written to; must be shared with workers
    #[serde(default = "default_upload_dir")]
    #[garde(length(min = 1))]
    pub upload_dir: String,

    /// Directory workers write cropped images to
    #[serde(default = "default_output_dir")]
    #[garde(length(min = 1))]
    pub output_dir: String,

    /// Worker tasks per worker process
    #[serde(default = "default_worker_concurrency")]
    #[garde(range(min = 1, max = 64))]
    pub worker_concurrency: usize,

    /// Worker tasks run inside the web server process
    #[serde(default)]
    #[garde(range(max = 64))]
    pub embedded_workers: usize,

    /// Stable name so a restarted worker can reclaim its unacknowledged tasks
    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub worker_name: Option<String>,

    /// Fallback worker name; set per container by Docker and Kubernetes
    #[serde(default)]
    #[garde(skip)]
    pub hostname: Option<String>,

    /// Upper bound on how long `GET /result` waits for a job to finish
    #[serde(default = "default_fetch_timeout_secs")]
    #[garde(range(min = 1, max = 300))]
    pub fetch_timeout_secs: u64,

    /// Expiry of job records in Redis
    #[serde(default = "default_job_ttl_secs")]
    #[garde(range(min = 60))]
    pub job_ttl_secs: u64,

    #[serde(default = "default_max_upload_bytes")]
    #[garde(range(min = 1))]
    pub max_upload_bytes: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_job_backend() -> JobBackend {
    JobBackend::Redis
}

fn default_upload_dir() -> String {
    "static/worker-img".to_string()
}

fn default_output_dir() -> String {
    "static/worker-img/out".to_string()
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_job_ttl_secs() -> u64 {
    86_400
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    /// Build from explicit key/value pairs (upper-case keys, as in the environment).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    /// `WORKER_NAME`, else `HOSTNAME`, else a name generated per process.
    pub fn worker_name(&self) -> String {
        self.stable_worker_name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()))
    }

    /// A worker name that survives restarts, if one is configured.
    pub fn stable_worker_name(&self) -> Option<&str> {
        self.worker_name
            .as_deref()
            .or(self.hostname.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
