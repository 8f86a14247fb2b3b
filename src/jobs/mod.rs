//! # Job Queue
//!
//! Durable, retried plugin jobs. Jobs arrive on the `jobs` topic, are written to the
//! [`JobStore`], and a [`JobQueueRunner`] polls for due jobs and submits each one to
//! the worker pool. A job that fails is rescheduled with exponential backoff until
//! its attempts run out, after which it is kept as dead with its last error.
//!
//! Store errors while polling never stop the runner: the poller logs, counts the
//! failure and backs off before the next poll. Recording a job's outcome is retried
//! with backoff on transient store errors; a claim whose outcome is never recorded
//! expires after `lock_timeout_ms` and the job is delivered again.

pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::JobQueueConfig;
use crate::constants::services;
use crate::error::{Result, ServerError};
use crate::lifecycle::Subsystem;
use crate::metrics::{JOBS_ENQUEUED, JOBS_EXECUTED, JOBS_FAILED, JOBS_POLL_ERRORS};
use crate::resilience::Backoff;
use crate::worker_pool::{PoolTask, WorkerPool};

pub use store::{JobStore, MemoryJobStore, NewJob, PgJobStore, QueuedJob};

/// Plugin job as published on the `jobs` topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueuedPluginJob {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Epoch milliseconds at which the job becomes due
    pub timestamp: i64,
    pub plugin_config_id: i64,
    pub plugin_config_team: i64,
}

impl EnqueuedPluginJob {
    pub fn run_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Producer side of the queue
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: JobQueueConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Queue `task` to run on the pool at `run_at`
    pub async fn enqueue(
        &self,
        task: PoolTask,
        payload: Value,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = self
            .store
            .enqueue(&NewJob {
                task_name: task.as_str().to_string(),
                payload,
                run_at,
                max_attempts: self.config.max_attempts,
            })
            .await?;
        metrics::counter!(JOBS_ENQUEUED, "task" => task.as_str()).increment(1);
        debug!(job_id = %id, task = %task, run_at = %run_at, "Job enqueued");
        Ok(id)
    }

    pub async fn enqueue_plugin_job(&self, job: &EnqueuedPluginJob) -> Result<Uuid> {
        let payload = serde_json::to_value(job)?;
        self.enqueue(PoolTask::RunPluginJob, payload, job.run_at())
            .await
    }

    fn retry_backoff(&self) -> Backoff {
        Backoff::from_millis(self.config.retry_base_ms, self.config.retry_max_ms)
    }
}

#[derive(Clone)]
struct Poller {
    queue: JobQueue,
    pool: Arc<WorkerPool>,
    last_poll: Arc<parking_lot::Mutex<Option<Instant>>>,
}

impl Poller {
    async fn poll_once(&self) -> Result<usize> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.queue.config.lock_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let locked_before = now
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let jobs = self
            .queue
            .store
            .dequeue_due(now, self.queue.config.batch_size, locked_before)
            .await?;
        *self.last_poll.lock() = Some(Instant::now());

        let claimed = jobs.len();
        for result in join_all(jobs.into_iter().map(|job| self.execute(job))).await {
            result?;
        }
        Ok(claimed)
    }

    async fn execute(&self, job: QueuedJob) -> Result<()> {
        let task = job.task_name.parse::<PoolTask>();
        let outcome = match &task {
            Ok(task) => self
                .pool
                .submit_task(*task, job.payload.clone())
                .await
                .map(|_| ()),
            Err(e) => Err(ServerError::TaskFailed {
                task: job.task_name.clone(),
                message: e.to_string(),
            }),
        };

        match outcome {
            Ok(()) => {
                self.record_outcome(&job, || self.queue.store.complete(job.id))
                    .await?;
                metrics::counter!(JOBS_EXECUTED).increment(1);
                debug!(job_id = %job.id, task = %job.task_name, "Job completed");
            }
            Err(e) => {
                metrics::counter!(JOBS_FAILED).increment(1);
                let retry_at = (task.is_ok() && job.has_attempts_left()).then(|| {
                    let delay = self
                        .queue
                        .retry_backoff()
                        .delay(job.attempts.saturating_sub(1) as u32);
                    Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::zero())
                });

                match retry_at {
                    Some(at) => warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        retry_at = %at,
                        error = %e,
                        "⚠️ JOBS: Job failed, rescheduling"
                    ),
                    None => error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %e,
                        "❌ JOBS: Job failed permanently"
                    ),
                }
                let message = e.to_string();
                self.record_outcome(&job, || {
                    self.queue.store.fail(job.id, &message, retry_at)
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Retry a store write for `job` while the store is transiently unavailable
    async fn record_outcome<F, Fut>(&self, job: &QueuedJob, mut write: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let config = &self.queue.config;
        let attempts = config.store_write_attempts.max(1);
        let backoff = Backoff::from_millis(config.poll_interval_ms.max(1), config.retry_max_ms);
        let mut attempt = 0u32;

        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = backoff.delay(attempt);
                    attempt += 1;
                    metrics::counter!(JOBS_POLL_ERRORS).increment(1);
                    warn!(
                        job_id = %job.id,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "⚠️ JOBS: Could not record job outcome, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        lock_timeout_ms = config.lock_timeout_ms,
                        error = %e,
                        "❌ JOBS: Giving up on recording job outcome; job is redelivered after its lock expires"
                    );
                    return Err(e);
                }
            }
        }
    }
}

/// Polls the store and executes due jobs on the worker pool
pub struct JobQueueRunner {
    poller: Poller,
    cancel: CancellationToken,
    started: AtomicBool,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl JobQueueRunner {
    pub fn new(queue: JobQueue, pool: Arc<WorkerPool>) -> Self {
        Self {
            poller: Poller {
                queue,
                pool,
                last_poll: Arc::new(parking_lot::Mutex::new(None)),
            },
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Run migrations, then start polling
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::InvalidState(
                "job queue runner already started".to_string(),
            ));
        }

        self.poller.queue.store.migrate().await?;

        let poller = self.poller.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move { poll_loop(poller, cancel).await });
        *self.handle.lock().await = Some(handle);

        info!(
            "🚀 JOBS: Job queue runner started (poll every {}ms, batch {})",
            self.poller.queue.config.poll_interval_ms, self.poller.queue.config.batch_size
        );
        Ok(())
    }

    /// Claim and run one batch of due jobs
    pub async fn poll_once(&self) -> Result<usize> {
        self.poller.poll_once().await
    }

    fn liveness_window(&self) -> Duration {
        (self.poller.queue.config.poll_interval() * 10).max(Duration::from_secs(30))
    }
}

async fn poll_loop(poller: Poller, cancel: CancellationToken) {
    let config = poller.queue.config.clone();
    let backoff = Backoff::from_millis(config.poll_interval_ms.max(1), config.retry_max_ms);
    let mut consecutive_failures = 0u32;
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        // A started batch always runs to completion
        match poller.poll_once().await {
            Ok(claimed) => {
                consecutive_failures = 0;
                delay = if claimed >= config.batch_size {
                    Duration::ZERO
                } else {
                    config.poll_interval()
                };
            }
            Err(e) => {
                consecutive_failures += 1;
                metrics::counter!(JOBS_POLL_ERRORS).increment(1);
                delay = backoff.delay(consecutive_failures - 1);
                warn!(
                    error = %e,
                    transient = e.is_transient(),
                    retry_in_ms = delay.as_millis() as u64,
                    "⚠️ JOBS: Job queue poll failed"
                );
            }
        }
    }

    debug!("Job queue poller stopped");
}

#[async_trait]
impl Subsystem for JobQueueRunner {
    fn name(&self) -> &str {
        services::JOB_QUEUE
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle
                .await
                .map_err(|e| ServerError::InvalidState(format!("job poller failed: {e}")))?;
        }
        info!("✅ JOBS: Job queue runner stopped");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        if self.cancel.is_cancelled() || !self.started.load(Ordering::Acquire) {
            return false;
        }
        match *self.poller.last_poll.lock() {
            Some(at) => at.elapsed() <= self.liveness_window(),
            // Still inside the first poll
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerPoolConfig;
    use crate::worker_pool::{TaskRunner, TaskRunnerFactory};
    use parking_lot::Mutex;
    use serde_json::json;

    struct FlakyRunner {
        failures_left: Mutex<usize>,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl TaskRunner for FlakyRunner {
        async fn run(&self, task: PoolTask, args: Value) -> Result<Value> {
            if task != PoolTask::RunPluginJob {
                return Ok(Value::Null);
            }
            let mut left = self.failures_left.lock();
            if *left > 0 {
                *left -= 1;
                return Err(ServerError::TaskFailed {
                    task: task.to_string(),
                    message: "plugin threw".into(),
                });
            }
            self.seen.lock().push(args);
            Ok(Value::Null)
        }
    }

    struct FlakyFactory {
        failures: usize,
        seen: Arc<Mutex<Vec<Value>>>,
    }

    impl TaskRunnerFactory for FlakyFactory {
        fn create(&self, _unit_id: usize) -> Result<Arc<dyn TaskRunner>> {
            Ok(Arc::new(FlakyRunner {
                failures_left: Mutex::new(self.failures),
                seen: self.seen.clone(),
            }))
        }
    }

    fn pool(failures: usize, seen: Arc<Mutex<Vec<Value>>>) -> Arc<WorkerPool> {
        let config = WorkerPoolConfig {
            concurrency: 1,
            ..Default::default()
        };
        Arc::new(WorkerPool::new(config, &FlakyFactory { failures, seen }).unwrap())
    }

    fn queue(store: Arc<MemoryJobStore>, max_attempts: i32) -> JobQueue {
        JobQueue::new(
            store,
            JobQueueConfig {
                max_attempts,
                retry_base_ms: 0,
                ..Default::default()
            },
        )
    }

    fn plugin_job() -> EnqueuedPluginJob {
        EnqueuedPluginJob {
            job_type: "syncContacts".into(),
            payload: json!({ "page": 1 }),
            timestamp: Utc::now().timestamp_millis() - 1_000,
            plugin_config_id: 7,
            plugin_config_team: 2,
        }
    }

    #[test]
    fn test_plugin_job_wire_format() {
        let job: EnqueuedPluginJob = serde_json::from_value(json!({
            "type": "syncContacts",
            "payload": {"page": 1},
            "timestamp": 1_700_000_000_000i64,
            "pluginConfigId": 7,
            "pluginConfigTeam": 2
        }))
        .unwrap();
        assert_eq!(job.job_type, "syncContacts");
        assert_eq!(job.run_at().timestamp_millis(), 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_due_job_runs_on_pool_and_completes() {
        let store = MemoryJobStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = JobQueueRunner::new(queue(store.clone(), 3), pool(0, seen.clone()));

        runner
            .poller
            .queue
            .enqueue_plugin_job(&plugin_job())
            .await
            .unwrap();
        assert_eq!(runner.poll_once().await.unwrap(), 1);

        assert_eq!(store.completed_count(), 1);
        assert_eq!(seen.lock()[0]["pluginConfigId"], json!(7));
    }

    #[tokio::test]
    async fn test_failing_job_retries_then_dies() {
        let store = MemoryJobStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = JobQueueRunner::new(queue(store.clone(), 2), pool(5, seen));

        runner
            .poller
            .queue
            .enqueue_plugin_job(&plugin_job())
            .await
            .unwrap();

        assert_eq!(runner.poll_once().await.unwrap(), 1);
        assert_eq!(store.pending_count(), 1);
        assert!(store.dead_jobs().is_empty());

        assert_eq!(runner.poll_once().await.unwrap(), 1);
        let dead = store.dead_jobs();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].0.attempts, 2);
        assert!(dead[0].1.as_deref().unwrap_or("").contains("plugin threw"));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_retried() {
        let store = MemoryJobStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = JobQueueRunner::new(queue(store.clone(), 5), pool(0, seen));

        store
            .enqueue(&NewJob {
                task_name: "runSomethingElse".into(),
                payload: Value::Null,
                run_at: Utc::now(),
                max_attempts: 5,
            })
            .await
            .unwrap();
        runner.poll_once().await.unwrap();
        assert_eq!(store.dead_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_completion_is_retried_through_a_store_outage() {
        let store = MemoryJobStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = JobQueueRunner::new(
            JobQueue::new(
                store.clone(),
                JobQueueConfig {
                    poll_interval_ms: 5,
                    retry_max_ms: 20,
                    ..Default::default()
                },
            ),
            pool(0, seen.clone()),
        );
        runner
            .poller
            .queue
            .enqueue_plugin_job(&plugin_job())
            .await
            .unwrap();

        store.fail_next_writes(2);
        tokio_test::assert_ok!(runner.poll_once().await);
        assert_eq!(store.completed_count(), 1);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unrecorded_job_runs_again_after_its_lock_expires() {
        let store = MemoryJobStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = JobQueueRunner::new(
            JobQueue::new(
                store.clone(),
                JobQueueConfig {
                    poll_interval_ms: 1,
                    retry_max_ms: 1,
                    lock_timeout_ms: 50,
                    store_write_attempts: 1,
                    ..Default::default()
                },
            ),
            pool(0, seen.clone()),
        );
        runner
            .poller
            .queue
            .enqueue_plugin_job(&plugin_job())
            .await
            .unwrap();

        // Outcome write fails and the claim stays in place
        store.fail_next_writes(1);
        assert!(runner.poll_once().await.is_err());
        assert_eq!(store.pending_count(), 1);
        assert_eq!(runner.poll_once().await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runner.poll_once().await.unwrap(), 1);
        assert_eq!(store.completed_count(), 1);
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_runner_survives_store_outage_and_migrates_once() {
        let store = MemoryJobStore::new();
        store.fail_next_polls(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let runner = JobQueueRunner::new(
            JobQueue::new(
                store.clone(),
                JobQueueConfig {
                    poll_interval_ms: 10,
                    retry_max_ms: 20,
                    ..Default::default()
                },
            ),
            pool(0, seen),
        );

        runner.start().await.unwrap();
        assert!(runner.start().await.is_err());
        runner
            .poller
            .queue
            .enqueue_plugin_job(&plugin_job())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.completed_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(store.migration_count(), 1);
        assert!(runner.is_healthy());
        runner.stop().await.unwrap();
        assert!(!runner.is_healthy());
    }
}
