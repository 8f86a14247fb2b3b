//! In-process implementations of the collaborator clients.
//!
//! Used for single-process standalone runs and throughout the test suite. The broker
//! keeps one partition per topic, tracks committed offsets per group, and supports
//! injecting fetch errors and stream ends.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

use super::{
    BrokerClient, CacheClient, ConsumerSession, FetchOptions, ObjectStore, PubSubClient,
    PubSubMessage, Record, TopicPartitionOffset,
};
use crate::error::{BrokerError, Result, ServerError};

#[derive(Default)]
struct BrokerState {
    logs: DashMap<String, Vec<Record>>,
    committed: DashMap<(String, String), i64>,
    injected_errors: DashMap<String, VecDeque<BrokerError>>,
    ended_groups: DashMap<String, ()>,
    commits: DashMap<String, usize>,
    appended: Notify,
    disconnected: AtomicBool,
}

/// Partitioned-log broker held in memory
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a JSON record, returning its offset
    pub fn push_json(&self, topic: &str, key: Option<&str>, value: &serde_json::Value) -> i64 {
        self.append(topic, key, value.to_string().into_bytes())
    }

    pub fn append(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> i64 {
        let offset = {
            let mut log = self.state.logs.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(Record {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: key.map(str::to_string),
                value,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            });
            offset
        };
        self.state.appended.notify_waiters();
        offset
    }

    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.state
            .logs
            .get(topic)
            .map(|log| log.value().clone())
            .unwrap_or_default()
    }

    /// Next offset the group will read after a restart
    pub fn committed_offset(&self, group_id: &str, topic: &str) -> Option<i64> {
        self.state
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .map(|offset| *offset.value())
    }

    pub fn commit_count(&self, group_id: &str) -> usize {
        self.state
            .commits
            .get(group_id)
            .map(|c| *c.value())
            .unwrap_or(0)
    }

    /// Make the next fetch for `group_id` fail with `error`
    pub fn inject_fetch_error(&self, group_id: &str, error: BrokerError) {
        self.state
            .injected_errors
            .entry(group_id.to_string())
            .or_default()
            .push_back(error);
        self.state.appended.notify_waiters();
    }

    /// End the stream for every member of `group_id`
    pub fn end_stream(&self, group_id: &str) {
        self.state.ended_groups.insert(group_id.to_string(), ());
        self.state.appended.notify_waiters();
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.disconnected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> std::result::Result<(), BrokerError> {
        if self.is_disconnected() {
            return Err(BrokerError::Disconnected);
        }
        self.append(topic, key, value.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
    ) -> std::result::Result<Box<dyn ConsumerSession>, BrokerError> {
        if self.is_disconnected() {
            return Err(BrokerError::Disconnected);
        }

        let positions = topics
            .iter()
            .map(|topic| {
                let committed = self.committed_offset(group_id, topic).unwrap_or(0);
                (topic.to_string(), committed)
            })
            .collect();

        Ok(Box::new(MemoryConsumerSession {
            state: self.state.clone(),
            group_id: group_id.to_string(),
            positions,
        }))
    }

    async fn disconnect(&self) -> std::result::Result<(), BrokerError> {
        self.state.disconnected.store(true, Ordering::Release);
        self.state.appended.notify_waiters();
        Ok(())
    }
}

struct MemoryConsumerSession {
    state: Arc<BrokerState>,
    group_id: String,
    positions: HashMap<String, i64>,
}

impl MemoryConsumerSession {
    fn take_available(&mut self, options: &FetchOptions) -> Vec<Record> {
        let mut batch = Vec::new();
        let mut total_bytes = 0usize;

        for (topic, position) in self.positions.iter_mut() {
            let Some(log) = self.state.logs.get(topic) else {
                continue;
            };
            let mut partition_bytes = 0usize;

            for record in log.iter().skip(*position as usize) {
                let size = record.size();
                let over_partition = partition_bytes + size > options.max_bytes_per_partition;
                let over_total = total_bytes + size > options.max_bytes;
                // Always hand out at least one record so oversized ones still flow
                if !batch.is_empty() && (over_partition || over_total) {
                    break;
                }
                partition_bytes += size;
                total_bytes += size;
                *position = record.offset + 1;
                batch.push(record.clone());
            }
        }

        batch
    }
}

#[async_trait]
impl ConsumerSession for MemoryConsumerSession {
    async fn fetch(
        &mut self,
        options: &FetchOptions,
    ) -> std::result::Result<Vec<Record>, BrokerError> {
        let deadline = Instant::now() + options.max_wait;
        let state = self.state.clone();

        loop {
            // Register interest before checking so an append in between is not missed
            let appended = state.appended.notified();

            if state.disconnected.load(Ordering::Acquire)
                || state.ended_groups.contains_key(&self.group_id)
            {
                return Err(BrokerError::Disconnected);
            }
            if let Some(mut queue) = state.injected_errors.get_mut(&self.group_id) {
                if let Some(error) = queue.pop_front() {
                    return Err(error);
                }
            }

            let batch = self.take_available(options);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(remaining, appended).await;
        }
    }

    async fn commit(
        &mut self,
        offsets: &[TopicPartitionOffset],
    ) -> std::result::Result<(), BrokerError> {
        for tpo in offsets {
            self.state
                .committed
                .insert((self.group_id.clone(), tpo.topic.clone()), tpo.offset);
        }
        *self.state.commits.entry(self.group_id.clone()).or_insert(0) += 1;
        Ok(())
    }

    async fn leave(&mut self) -> std::result::Result<(), BrokerError> {
        Ok(())
    }
}

/// Key/value cache with TTLs
#[derive(Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, (String, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let expired = match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) => match entry.1 {
                Some(expires_at) if expires_at <= Instant::now() => true,
                _ => return Ok(Some(entry.0.clone())),
            },
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.1 = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

type Subscriber = (Vec<String>, mpsc::Sender<PubSubMessage>);

/// Channel fan-out held in memory
#[derive(Clone, Default)]
pub struct MemoryPubSub {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    closed: Arc<AtomicBool>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[async_trait]
impl PubSubClient for MemoryPubSub {
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<PubSubMessage>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::Cache("pub/sub client is closed".to_string()));
        }
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.lock().push((channels.to_vec(), tx));
        Ok(rx)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let targets: Vec<mpsc::Sender<PubSubMessage>> = self
            .subscribers
            .lock()
            .iter()
            .filter(|(channels, _)| channels.iter().any(|c| c == channel))
            .map(|(_, tx)| tx.clone())
            .collect();

        for tx in targets {
            let message = PubSubMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            };
            // A dropped receiver just means that subscriber went away
            let _ = tx.send(message).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.subscribers.lock().clear();
        Ok(())
    }
}

/// Bucket/key object storage held in memory
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == bucket)
            .map(|entry| entry.key().1.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.objects
            .insert((bucket.to_string(), key.to_string()), body);
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|body| body.value().clone()))
    }
}
