//! # Server Configuration
//!
//! Layered configuration loaded once at process start with the `config` crate:
//! compiled defaults, then an optional file, then `INGEST__`-prefixed environment
//! variables (`INGEST__BROKER__HOSTS=kafka:9092`). The result is validated once here
//! and never re-validated by the subsystems that read it.
//!
//! ```rust,no_run
//! use ingestion_server::config::ServerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::load()?;
//! let capabilities = config.capability_set()?;
//! println!("running {capabilities} with {} pool units", config.worker_pool.concurrency);
//! # Ok(())
//! # }
//! ```

pub mod capabilities;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ServerError};

pub use capabilities::{Capability, CapabilitySet};

/// File consulted when `INGEST_CONFIG_FILE` is not set. Missing is fine.
pub const DEFAULT_CONFIG_FILE: &str = "config/ingestion-server";

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// development, test or production
    pub environment: String,
    /// Deployment mode preset (see [`CapabilitySet::from_mode`])
    pub mode: Option<String>,
    /// Explicit comma-separated capability list, wins over `mode`
    pub capabilities: Option<String>,
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub object_storage: ObjectStorageConfig,
    pub worker_pool: WorkerPoolConfig,
    pub jobs: JobQueueConfig,
    pub schedule: ScheduleConfig,
    pub reload: ReloadConfig,
    pub health: HealthConfig,
    pub http: HttpConfig,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overridden by RUST_LOG when present
    pub level: Option<String>,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub hosts: String,
    pub client_id: String,
    pub consumer: ConsumerConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hosts: "localhost:9092".to_string(),
            client_id: "ingestion-server".to_string(),
            consumer: ConsumerConfig::default(),
        }
    }
}

/// Batch bounds and retry behavior shared by every consumer group
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub max_bytes: usize,
    pub max_bytes_per_partition: usize,
    pub max_wait_ms: u64,
    pub retry_backoff_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Consecutive transient broker failures tolerated before the consumer errors
    pub max_transient_retries: u32,
    /// A consumer that has not completed a fetch cycle in this window is unhealthy
    pub liveness_timeout_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_bytes: 10_485_760,
            max_bytes_per_partition: 1_048_576,
            max_wait_ms: 50,
            retry_backoff_ms: 500,
            retry_backoff_max_ms: 30_000,
            max_transient_retries: 10,
            liveness_timeout_secs: 60,
        }
    }
}

impl ConsumerConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL backing the durable job queue. Unset runs the queue in memory.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            acquire_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObjectStorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    /// Key prefix for session recording blobs
    pub prefix: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl Default for ObjectStorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:19000".to_string(),
            region: "us-east-1".to_string(),
            bucket: "posthog".to_string(),
            prefix: "session_recordings".to_string(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of isolated execution units
    pub concurrency: usize,
    /// Concurrent submitted tasks each unit may run
    pub tasks_per_worker: usize,
    pub task_timeout_ms: u64,
    pub broadcast_timeout_ms: u64,
    pub teardown_timeout_ms: u64,
    pub flush_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            tasks_per_worker: 10,
            task_timeout_ms: 30_000,
            broadcast_timeout_ms: 60_000,
            teardown_timeout_ms: 5_000,
            flush_timeout_ms: 2_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobQueueConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub max_attempts: i32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// A claimed job not completed or failed within this window is handed out again
    pub lock_timeout_ms: u64,
    /// Attempts at recording a job outcome before leaving it to the lock timeout
    pub store_write_attempts: u32,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            batch_size: 50,
            max_attempts: 5,
            retry_base_ms: 1_000,
            retry_max_ms: 300_000,
            lock_timeout_ms: 600_000,
            store_write_attempts: 5,
        }
    }
}

impl JobQueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub refresh_interval_secs: u64,
    pub tick_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            tick_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReloadConfig {
    pub actions_interval_secs: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            actions_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_timeout_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout_ms: 1_000,
        }
    }
}

impl HealthConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6738,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl HttpConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub lag_sample_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lag_sample_interval_ms: 10_000,
        }
    }
}

impl ServerConfig {
    /// Load from `INGEST_CONFIG_FILE` (or the default path) plus the environment
    pub fn load() -> Result<Self> {
        let file = std::env::var("INGEST_CONFIG_FILE")
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from(Some(&file))
    }

    /// Load from an optional file plus `INGEST__` environment variables
    pub fn load_from(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("INGEST")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: ServerConfig = settings.try_deserialize()?;
        if config.environment.is_empty() {
            config.environment = detect_environment();
        }
        config.validate()?;
        Ok(config)
    }

    /// Resolve the capability set: explicit list first, then mode preset
    pub fn capability_set(&self) -> Result<CapabilitySet> {
        match self.capabilities.as_deref() {
            Some(list) if !list.trim().is_empty() => CapabilitySet::parse_list(list),
            _ => CapabilitySet::from_mode(self.mode.as_deref()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.capability_set()?;

        if self.worker_pool.concurrency == 0 {
            return Err(ServerError::Configuration(
                "worker_pool.concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker_pool.tasks_per_worker == 0 {
            return Err(ServerError::Configuration(
                "worker_pool.tasks_per_worker must be at least 1".to_string(),
            ));
        }
        if self.broker.consumer.max_bytes == 0 || self.broker.consumer.max_bytes_per_partition == 0
        {
            return Err(ServerError::Configuration(
                "broker.consumer batch byte limits must be positive".to_string(),
            ));
        }
        if self.broker.consumer.max_bytes_per_partition > self.broker.consumer.max_bytes {
            return Err(ServerError::Configuration(
                "broker.consumer.max_bytes_per_partition exceeds max_bytes".to_string(),
            ));
        }
        if self.jobs.batch_size == 0 {
            return Err(ServerError::Configuration(
                "jobs.batch_size must be at least 1".to_string(),
            ));
        }
        if self.jobs.lock_timeout_ms == 0 {
            return Err(ServerError::Configuration(
                "jobs.lock_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.schedule.tick_interval_secs == 0 {
            return Err(ServerError::Configuration(
                "schedule.tick_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

fn detect_environment() -> String {
    std::env::var("INGEST_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker_pool.teardown_timeout(), Duration::from_secs(5));
        assert_eq!(config.worker_pool.flush_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_explicit_capabilities_win_over_mode() {
        let config = ServerConfig {
            mode: Some("jobs".to_string()),
            capabilities: Some("ingestion,http".to_string()),
            ..Default::default()
        };
        let set = config.capability_set().unwrap();
        assert!(set.contains(Capability::Ingestion));
        assert!(!set.contains(Capability::ProcessPluginJobs));
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let mut config = ServerConfig::default();
        config.worker_pool.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ServerError::Configuration(_))
        ));
    }

    #[test]
    fn test_validation_rejects_conflicting_capabilities() {
        let config = ServerConfig {
            capabilities: Some("processAsyncHandlers,processAsyncWebhooksHandlers".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ServerError::InvalidCapabilities(_))
        ));
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
environment = "test"
mode = "recordings-ingestion"

[worker_pool]
concurrency = 2

[broker.consumer]
max_wait_ms = 250
"#
        )
        .unwrap();

        let config = ServerConfig::load_from(file.path().to_str()).unwrap();
        assert_eq!(config.environment, "test");
        assert_eq!(config.worker_pool.concurrency, 2);
        assert_eq!(config.worker_pool.tasks_per_worker, 10);
        assert_eq!(config.broker.consumer.max_wait(), Duration::from_millis(250));
        assert!(config
            .capability_set()
            .unwrap()
            .contains(Capability::SessionRecordingIngestion));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ServerConfig::load_from(Some("/nonexistent/ingestion-server")).unwrap();
        assert_eq!(config.http.port, 6738);
        assert!(!config.environment.is_empty());
    }
}
