//! # Job Store
//!
//! Durable storage behind the job queue. [`PgJobStore`] keeps jobs in a `plugin_jobs`
//! table and hands them out with `FOR UPDATE SKIP LOCKED` so several servers can poll
//! the same table. [`MemoryJobStore`] backs standalone runs and tests.
//!
//! A claim is a lease: a job whose `locked_at` is older than the caller's cutoff is
//! claimable again, so a poller that dies between claiming and recording the outcome
//! never strands the job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{Result, ServerError};

/// A job to be written to the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_name: String,
    pub payload: Value,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

/// A job claimed by a poller
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub task_name: String,
    pub payload: Value,
    pub run_at: DateTime<Utc>,
    /// Attempts including the one this claim represents
    pub attempts: i32,
    pub max_attempts: i32,
}

impl QueuedJob {
    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create the schema if it does not exist
    async fn migrate(&self) -> Result<()>;

    async fn enqueue(&self, job: &NewJob) -> Result<Uuid>;

    /// Claim up to `limit` jobs whose `run_at` has passed and that are unclaimed or
    /// were claimed before `locked_before`
    async fn dequeue_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<QueuedJob>>;

    async fn complete(&self, id: Uuid) -> Result<()>;

    /// Record a failed attempt. `retry_at` of `None` marks the job dead.
    async fn fail(&self, id: Uuid, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()>;

    async fn ping(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

const MIGRATIONS: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS plugin_jobs (
        id UUID PRIMARY KEY,
        task_name TEXT NOT NULL,
        payload JSONB NOT NULL,
        run_at TIMESTAMPTZ NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        locked_at TIMESTAMPTZ,
        last_error TEXT,
        failed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS plugin_jobs_claimable_idx
        ON plugin_jobs (run_at)
        WHERE failed_at IS NULL
    "#,
];

/// Postgres-backed job store
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(url: &str, config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.acquire_timeout_secs))
            .connect(url)
            .await?;
        info!(
            "✅ JOBS: Connected job store pool (max_connections={})",
            config.max_connections
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Job store schema is current");
        Ok(())
    }

    async fn enqueue(&self, job: &NewJob) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO plugin_jobs (id, task_name, payload, run_at, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&job.task_name)
        .bind(Json(&job.payload))
        .bind(job.run_at)
        .bind(job.max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn dequeue_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<QueuedJob>> {
        let rows = sqlx::query(
            r#"
            UPDATE plugin_jobs
               SET locked_at = $1, attempts = attempts + 1
             WHERE id IN (
                SELECT id FROM plugin_jobs
                 WHERE run_at <= $1
                   AND failed_at IS NULL
                   AND (locked_at IS NULL OR locked_at < $3)
                 ORDER BY run_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
            RETURNING id, task_name, payload, run_at, attempts, max_attempts
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .bind(locked_before)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = rows
            .into_iter()
            .map(|row| {
                Ok(QueuedJob {
                    id: row.try_get("id")?,
                    task_name: row.try_get("task_name")?,
                    payload: row.try_get::<Json<Value>, _>("payload")?.0,
                    run_at: row.try_get("run_at")?,
                    attempts: row.try_get("attempts")?,
                    max_attempts: row.try_get("max_attempts")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()?;
        jobs.sort_by_key(|job| job.run_at);
        Ok(jobs)
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM plugin_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        match retry_at {
            Some(retry_at) => {
                sqlx::query(
                    "UPDATE plugin_jobs SET locked_at = NULL, last_error = $2, run_at = $3 WHERE id = $1",
                )
                .bind(id)
                .bind(error)
                .bind(retry_at)
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE plugin_jobs SET locked_at = NULL, last_error = $2, failed_at = NOW() WHERE id = $1",
                )
                .bind(id)
                .bind(error)
                .execute(&self.pool)
                .await?;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct StoredJob {
    job: QueuedJob,
    locked_at: Option<DateTime<Utc>>,
    dead: bool,
    last_error: Option<String>,
}

/// In-process job store
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, StoredJob>>,
    completed: AtomicUsize,
    migrations: AtomicUsize,
    unavailable_polls: AtomicUsize,
    unavailable_writes: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `polls` dequeues fail as if the database were unreachable
    pub fn fail_next_polls(&self, polls: usize) {
        self.unavailable_polls.store(polls, Ordering::Release);
    }

    /// Make the next `writes` completes or fails error as if the database were unreachable
    pub fn fail_next_writes(&self, writes: usize) {
        self.unavailable_writes.store(writes, Ordering::Release);
    }

    pub fn pending_count(&self) -> usize {
        self.jobs.lock().values().filter(|j| !j.dead).count()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn migration_count(&self) -> usize {
        self.migrations.load(Ordering::Acquire)
    }

    /// Jobs that exhausted their attempts, with the last error recorded
    pub fn dead_jobs(&self) -> Vec<(QueuedJob, Option<String>)> {
        self.jobs
            .lock()
            .values()
            .filter(|j| j.dead)
            .map(|j| (j.job.clone(), j.last_error.clone()))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ServerError::DatabaseUnavailable(
                "job store is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn take_outage(counter: &AtomicUsize) -> Result<()> {
        let unavailable = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if unavailable {
            return Err(ServerError::DatabaseUnavailable(
                "connection refused".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn migrate(&self) -> Result<()> {
        self.migrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn enqueue(&self, job: &NewJob) -> Result<Uuid> {
        self.check_open()?;
        let id = Uuid::new_v4();
        self.jobs.lock().insert(
            id,
            StoredJob {
                job: QueuedJob {
                    id,
                    task_name: job.task_name.clone(),
                    payload: job.payload.clone(),
                    run_at: job.run_at,
                    attempts: 0,
                    max_attempts: job.max_attempts,
                },
                locked_at: None,
                dead: false,
                last_error: None,
            },
        );
        Ok(id)
    }

    async fn dequeue_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        locked_before: DateTime<Utc>,
    ) -> Result<Vec<QueuedJob>> {
        self.check_open()?;
        Self::take_outage(&self.unavailable_polls)?;

        let mut jobs = self.jobs.lock();
        let mut due: Vec<&mut StoredJob> = jobs
            .values_mut()
            .filter(|j| {
                !j.dead
                    && j.job.run_at <= now
                    && j.locked_at.map_or(true, |at| at < locked_before)
            })
            .collect();
        due.sort_by_key(|j| j.job.run_at);

        Ok(due
            .into_iter()
            .take(limit)
            .map(|stored| {
                stored.locked_at = Some(now);
                stored.job.attempts += 1;
                stored.job.clone()
            })
            .collect())
    }

    async fn complete(&self, id: Uuid) -> Result<()> {
        self.check_open()?;
        Self::take_outage(&self.unavailable_writes)?;
        if self.jobs.lock().remove(&id).is_some() {
            self.completed.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        self.check_open()?;
        Self::take_outage(&self.unavailable_writes)?;
        if let Some(stored) = self.jobs.lock().get_mut(&id) {
            stored.locked_at = None;
            stored.last_error = Some(error.to_string());
            match retry_at {
                Some(retry_at) => stored.job.run_at = retry_at,
                None => stored.dead = true,
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn leased_before(now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::minutes(10)
    }

    fn job(task: &str, run_at: DateTime<Utc>) -> NewJob {
        NewJob {
            task_name: task.to_string(),
            payload: json!({ "task": task }),
            run_at,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_only_due_jobs_are_claimed_in_run_order() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(&job("later", now + Duration::hours(1))).await.unwrap();
        store.enqueue(&job("second", now - Duration::seconds(1))).await.unwrap();
        store.enqueue(&job("first", now - Duration::seconds(10))).await.unwrap();

        let claimed = store.dequeue_due(now, 10, leased_before(now)).await.unwrap();
        let names: Vec<&str> = claimed.iter().map(|j| j.task_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(claimed.iter().all(|j| j.attempts == 1));

        // Claimed jobs are not handed out twice
        assert!(store.dequeue_due(now, 10, leased_before(now)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_is_rescheduled_or_marked_dead() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(&job("flaky", now)).await.unwrap();

        store.dequeue_due(now, 1, leased_before(now)).await.unwrap();
        store
            .fail(id, "boom", Some(now + Duration::seconds(30)))
            .await
            .unwrap();
        assert!(store.dequeue_due(now, 1, leased_before(now)).await.unwrap().is_empty());

        let retried = store
            .dequeue_due(now + Duration::seconds(31), 1, leased_before(now))
            .await
            .unwrap();
        assert_eq!(retried[0].attempts, 2);

        store.fail(id, "boom again", None).await.unwrap();
        let dead = store.dead_jobs();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].1.as_deref(), Some("boom again"));
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_redelivered_once_the_lease_expires() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(&job("abandoned", now)).await.unwrap();

        let claimed = store.dequeue_due(now, 1, leased_before(now)).await.unwrap();
        assert_eq!(claimed.len(), 1);

        // Still leased a minute later
        let soon = now + Duration::minutes(1);
        assert!(store.dequeue_due(soon, 1, leased_before(soon)).await.unwrap().is_empty());

        let later = now + Duration::minutes(11);
        let redelivered = store.dequeue_due(later, 1, leased_before(later)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, id);
        assert_eq!(redelivered[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_unavailable_writes_are_transient() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let id = store.enqueue(&job("write", now)).await.unwrap();
        store.dequeue_due(now, 1, leased_before(now)).await.unwrap();

        store.fail_next_writes(1);
        let err = store.complete(id).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.completed_count(), 0);

        tokio_test::assert_ok!(store.complete(id).await);
        assert_eq!(store.completed_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_polls_are_transient() {
        let store = MemoryJobStore::new();
        store.fail_next_polls(1);
        let err = store.dequeue_due(Utc::now(), 1, leased_before(Utc::now())).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.dequeue_due(Utc::now(), 1, leased_before(Utc::now())).await.is_ok());
    }

    #[test]
    fn test_attempts_left() {
        let queued = QueuedJob {
            id: Uuid::new_v4(),
            task_name: "t".into(),
            payload: Value::Null,
            run_at: Utc::now(),
            attempts: 3,
            max_attempts: 3,
        };
        assert!(!queued.has_attempts_left());
    }
}
