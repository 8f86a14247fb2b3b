//! Batch processors, one per kind of stream.
//!
//! A processor either finishes the whole batch or returns an error; the consumer
//! loop commits offsets only after `process` returns `Ok`.

use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clients::{BrokerClient, ObjectStore, Record};
use crate::config::ObjectStorageConfig;
use crate::constants::topics;
use crate::error::{Result, ServerError};
use crate::hub::Hub;
use crate::jobs::{EnqueuedPluginJob, JobQueue};
use crate::schedule::{ScheduleTrigger, ScheduledTask};
use crate::worker_pool::{PoolTask, WorkerPool};

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, batch: &[Record]) -> Result<()>;
}

/// Dispatches each record into the worker pool.
///
/// Records sharing a key are processed in offset order; distinct keys run concurrently.
pub struct PoolDispatchProcessor {
    task: PoolTask,
    pool: Arc<WorkerPool>,
    hub: Arc<Hub>,
}

impl PoolDispatchProcessor {
    pub fn new(task: PoolTask, pool: Arc<WorkerPool>, hub: Arc<Hub>) -> Self {
        Self { task, pool, hub }
    }
}

#[async_trait]
impl BatchProcessor for PoolDispatchProcessor {
    async fn process(&self, batch: &[Record]) -> Result<()> {
        let mut by_key: BTreeMap<Option<&str>, Vec<Value>> = BTreeMap::new();
        for record in batch {
            by_key
                .entry(record.key.as_deref())
                .or_default()
                .push(record.json::<Value>()?);
        }

        let groups = by_key.into_values().map(|events| async move {
            for event in events {
                self.pool.submit_task(self.task, event).await?;
            }
            Ok::<_, ServerError>(())
        });
        try_join_all(groups).await?;

        self.hub.record_activity("ingestion batch");
        Ok(())
    }
}

/// Writes plugin jobs from the `jobs` topic into the durable queue
pub struct JobsProcessor {
    queue: JobQueue,
    hub: Arc<Hub>,
}

impl JobsProcessor {
    pub fn new(queue: JobQueue, hub: Arc<Hub>) -> Self {
        Self { queue, hub }
    }
}

#[async_trait]
impl BatchProcessor for JobsProcessor {
    async fn process(&self, batch: &[Record]) -> Result<()> {
        for record in batch {
            let job: EnqueuedPluginJob = record.json()?;
            self.queue.enqueue_plugin_job(&job).await?;
        }
        self.hub.record_activity("job");
        Ok(())
    }
}

/// Runs scheduled plugin tasks, each distinct task at most once per batch
pub struct ScheduledTasksProcessor {
    pool: Arc<WorkerPool>,
    hub: Arc<Hub>,
}

impl ScheduledTasksProcessor {
    pub fn new(pool: Arc<WorkerPool>, hub: Arc<Hub>) -> Self {
        Self { pool, hub }
    }

    /// Valid tasks in first-seen order, duplicates removed. Invalid records are skipped.
    fn dedupe(batch: &[Record]) -> Vec<(ScheduleTrigger, i64)> {
        let mut seen = HashSet::new();
        let mut tasks = Vec::new();

        for record in batch {
            let task = match record.json::<ScheduledTask>() {
                Ok(task) => task,
                Err(e) => {
                    warn!(
                        offset = record.offset,
                        error = %e,
                        "Skipping malformed scheduled task"
                    );
                    continue;
                }
            };
            let trigger = match task.task_type.parse::<ScheduleTrigger>() {
                Ok(trigger) => trigger,
                Err(_) => {
                    warn!(
                        offset = record.offset,
                        task_type = %task.task_type,
                        "Skipping scheduled task with unknown type"
                    );
                    continue;
                }
            };
            if seen.insert((trigger, task.plugin_config_id)) {
                tasks.push((trigger, task.plugin_config_id));
            }
        }
        tasks
    }
}

#[async_trait]
impl BatchProcessor for ScheduledTasksProcessor {
    async fn process(&self, batch: &[Record]) -> Result<()> {
        let tasks = Self::dedupe(batch);
        debug!(
            received = batch.len(),
            distinct = tasks.len(),
            "Running scheduled tasks"
        );

        let runs = tasks.into_iter().map(|(trigger, plugin_config_id)| {
            self.pool.submit_task(
                trigger.pool_task(),
                serde_json::json!({ "pluginConfigId": plugin_config_id }),
            )
        });
        for result in join_all(runs).await {
            result?;
        }

        self.hub.record_activity("scheduled tasks");
        Ok(())
    }
}

/// Session recording event as produced by capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecordingEvent {
    pub team_id: i64,
    pub distinct_id: String,
    pub session_id: String,
    #[serde(default)]
    pub window_id: Option<String>,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub snapshot_data: Value,
}

impl SessionRecordingEvent {
    /// Parse and validate, returning `None` for records that should be dropped
    fn parse(record: &Record) -> Option<Self> {
        match record.json::<SessionRecordingEvent>() {
            Ok(event) if !event.session_id.is_empty() && event.team_id > 0 => Some(event),
            Ok(_) => {
                warn!(
                    offset = record.offset,
                    "Dropping session recording event without team or session"
                );
                None
            }
            Err(e) => {
                warn!(
                    offset = record.offset,
                    error = %e,
                    "Dropping malformed session recording event"
                );
                None
            }
        }
    }
}

/// Validates recording events and forwards them to the analytics sink topic
pub struct SessionRecordingEventsProcessor {
    broker: Arc<dyn BrokerClient>,
    hub: Arc<Hub>,
}

impl SessionRecordingEventsProcessor {
    pub fn new(broker: Arc<dyn BrokerClient>, hub: Arc<Hub>) -> Self {
        Self { broker, hub }
    }
}

#[async_trait]
impl BatchProcessor for SessionRecordingEventsProcessor {
    async fn process(&self, batch: &[Record]) -> Result<()> {
        for event in batch.iter().filter_map(SessionRecordingEvent::parse) {
            let payload = serde_json::to_vec(&event)?;
            self.broker
                .produce(
                    topics::CLICKHOUSE_SESSION_RECORDING_EVENTS,
                    Some(&event.session_id),
                    &payload,
                )
                .await?;
        }
        self.hub.record_activity("session recording batch");
        Ok(())
    }
}

/// Writes one newline-delimited object per session and partition per batch
pub struct SessionRecordingBlobProcessor {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    hub: Arc<Hub>,
}

impl SessionRecordingBlobProcessor {
    pub fn new(store: Arc<dyn ObjectStore>, config: &ObjectStorageConfig, hub: Arc<Hub>) -> Self {
        Self {
            store,
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_end_matches('/').to_string(),
            hub,
        }
    }

    /// `{prefix}/team_id={team}/session_id={session}/{partition}-{first_offset}-{last_offset}`
    ///
    /// Offsets are only unique within a partition, so the partition is part of the key.
    pub fn object_key(
        &self,
        team_id: i64,
        session_id: &str,
        partition: i32,
        first: i64,
        last: i64,
    ) -> String {
        format!(
            "{}/team_id={team_id}/session_id={session_id}/{partition}-{first}-{last}",
            self.prefix
        )
    }
}

#[async_trait]
impl BatchProcessor for SessionRecordingBlobProcessor {
    async fn process(&self, batch: &[Record]) -> Result<()> {
        let mut sessions: BTreeMap<(i64, String, i32), (i64, i64, Vec<u8>)> = BTreeMap::new();

        for record in batch {
            let Some(event) = SessionRecordingEvent::parse(record) else {
                continue;
            };
            let entry = sessions
                .entry((event.team_id, event.session_id.clone(), record.partition))
                .or_insert((record.offset, record.offset, Vec::new()));
            entry.0 = entry.0.min(record.offset);
            entry.1 = entry.1.max(record.offset);
            serde_json::to_writer(&mut entry.2, &event)?;
            entry.2.push(b'\n');
        }

        let writes = sessions
            .into_iter()
            .map(|((team_id, session_id, partition), (first, last, body))| {
                let key = self.object_key(team_id, &session_id, partition, first, last);
                async move {
                    self.store
                        .put_object(&self.bucket, &key, body)
                        .await
                        .map_err(|e| ServerError::ObjectStore(format!("{key}: {e}")))
                }
            });
        try_join_all(writes).await?;

        self.hub.record_activity("session recording blob batch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{StandaloneConnector, TracingErrorReporter};
    use crate::config::{CapabilitySet, ServerConfig, WorkerPoolConfig};
    use crate::jobs::MemoryJobStore;
    use crate::worker_pool::{TaskRunner, TaskRunnerFactory};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<(PoolTask, Value)>>>;

    struct Recording(Calls);

    #[async_trait]
    impl TaskRunner for Recording {
        async fn run(&self, task: PoolTask, args: Value) -> Result<Value> {
            // Later keys finish first unless ordering is enforced per key
            if args.get("slow").is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.0.lock().push((task, args));
            Ok(Value::Null)
        }
    }

    impl TaskRunnerFactory for Recording {
        fn create(&self, _unit_id: usize) -> Result<Arc<dyn TaskRunner>> {
            Ok(Arc::new(Recording(self.0.clone())))
        }
    }

    async fn fixture() -> (Arc<Hub>, Arc<WorkerPool>, Calls, StandaloneConnector) {
        let connector = StandaloneConnector::new();
        let hub = Hub::connect(
            Arc::new(ServerConfig::default()),
            &CapabilitySet::parse_list("ingestion,sessionRecordingBlobIngestion").unwrap(),
            &connector,
            Arc::new(TracingErrorReporter),
        )
        .await
        .unwrap();
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::new(
            WorkerPoolConfig {
                concurrency: 2,
                ..Default::default()
            },
            &Recording(calls.clone()),
        )
        .unwrap();
        (Arc::new(hub), Arc::new(pool), calls, connector)
    }

    fn record(offset: i64, key: Option<&str>, value: Value) -> Record {
        Record {
            topic: "t".into(),
            partition: 0,
            offset,
            key: key.map(str::to_string),
            value: value.to_string().into_bytes(),
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_pool_dispatch_keeps_per_key_order() {
        let (hub, pool, calls, _) = fixture().await;
        let processor = PoolDispatchProcessor::new(PoolTask::RunEventPipeline, pool, hub.clone());

        let batch = vec![
            record(0, Some("a"), json!({"n": 1, "slow": true})),
            record(1, Some("b"), json!({"n": 2})),
            record(2, Some("a"), json!({"n": 3})),
        ];
        processor.process(&batch).await.unwrap();

        let order: Vec<i64> = calls
            .lock()
            .iter()
            .filter(|(_, args)| args["n"] != json!(2))
            .map(|(_, args)| args["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![1, 3]);
        assert_eq!(calls.lock().len(), 3);
        assert_eq!(hub.last_activity().unwrap().kind, "ingestion batch");
    }

    #[tokio::test]
    async fn test_pool_dispatch_rejects_malformed_payload() {
        let (hub, pool, calls, _) = fixture().await;
        let processor = PoolDispatchProcessor::new(PoolTask::RunEventPipeline, pool, hub);

        let mut bad = record(0, None, Value::Null);
        bad.value = b"{not json".to_vec();
        assert!(processor.process(&[bad]).await.is_err());
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_tasks_are_deduplicated() {
        let (hub, pool, calls, _) = fixture().await;
        let processor = ScheduledTasksProcessor::new(pool, hub);

        let batch = vec![
            record(0, None, json!({"taskType": "runEveryMinute", "pluginConfigId": 1})),
            record(1, None, json!({"taskType": "runEveryMinute", "pluginConfigId": 1})),
            record(2, None, json!({"taskType": "runEveryHour", "pluginConfigId": 1})),
            record(3, None, json!({"taskType": "runEverySecond", "pluginConfigId": 1})),
        ];
        processor.process(&batch).await.unwrap();

        let mut tasks: Vec<PoolTask> = calls.lock().iter().map(|(t, _)| *t).collect();
        tasks.sort_by_key(|t| t.as_str());
        assert_eq!(tasks, vec![PoolTask::RunEveryHour, PoolTask::RunEveryMinute]);
    }

    #[tokio::test]
    async fn test_jobs_are_written_to_the_queue() {
        let (hub, _, _, _) = fixture().await;
        let store = MemoryJobStore::new();
        let processor =
            JobsProcessor::new(JobQueue::new(store.clone(), Default::default()), hub);

        let job = json!({
            "type": "syncContacts",
            "payload": {},
            "timestamp": 1_700_000_000_000i64,
            "pluginConfigId": 3,
            "pluginConfigTeam": 1
        });
        processor.process(&[record(0, None, job)]).await.unwrap();
        assert_eq!(store.pending_count(), 1);
    }

    fn recording_event(session: &str, team: i64) -> Value {
        json!({
            "team_id": team,
            "distinct_id": "user",
            "session_id": session,
            "timestamp": 1_700_000_000_000i64,
            "snapshot_data": {"type": 2}
        })
    }

    #[tokio::test]
    async fn test_session_events_are_validated_and_forwarded() {
        let (hub, _, _, connector) = fixture().await;
        let processor = SessionRecordingEventsProcessor::new(hub.broker(), hub);

        let batch = vec![
            record(0, None, recording_event("s1", 2)),
            record(1, None, json!({"team_id": 2})),
            record(2, None, recording_event("", 2)),
            record(3, None, recording_event("s2", 2)),
        ];
        processor.process(&batch).await.unwrap();

        let forwarded = connector
            .broker()
            .records(topics::CLICKHOUSE_SESSION_RECORDING_EVENTS);
        let keys: Vec<Option<String>> = forwarded.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![Some("s1".to_string()), Some("s2".to_string())]);
    }

    #[tokio::test]
    async fn test_blob_processor_writes_one_object_per_session() {
        let (hub, _, _, connector) = fixture().await;
        let config = ObjectStorageConfig::default();
        let processor = SessionRecordingBlobProcessor::new(
            hub.object_store().unwrap(),
            &config,
            hub,
        );

        let batch = vec![
            record(10, None, recording_event("s1", 2)),
            record(11, None, recording_event("s2", 2)),
            record(12, None, recording_event("s1", 2)),
        ];
        processor.process(&batch).await.unwrap();

        let keys = connector.object_store().keys(&config.bucket);
        assert_eq!(
            keys,
            vec![
                "session_recordings/team_id=2/session_id=s1/0-10-12".to_string(),
                "session_recordings/team_id=2/session_id=s2/0-11-11".to_string(),
            ]
        );

        let body = connector
            .object_store()
            .get_object(&config.bucket, &keys[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(body.iter().filter(|b| **b == b'\n').count(), 2);
    }

    #[tokio::test]
    async fn test_blob_objects_from_different_partitions_do_not_collide() {
        let (hub, _, _, connector) = fixture().await;
        let config = ObjectStorageConfig::default();
        let processor = SessionRecordingBlobProcessor::new(
            hub.object_store().unwrap(),
            &config,
            hub,
        );

        let mut other_partition = record(5, None, recording_event("s1", 2));
        other_partition.partition = 1;
        processor
            .process(&[record(5, None, recording_event("s1", 2))])
            .await
            .unwrap();
        processor.process(&[other_partition]).await.unwrap();

        let keys = connector.object_store().keys(&config.bucket);
        assert_eq!(
            keys,
            vec![
                "session_recordings/team_id=2/session_id=s1/0-5-5".to_string(),
                "session_recordings/team_id=2/session_id=s1/1-5-5".to_string(),
            ]
        );
    }
}
