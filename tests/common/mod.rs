//! Shared helpers for integration tests: a recording task runner, a connector that
//! counts how often shared clients are opened and closed, and a config builder.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use ingestion_server::clients::{
    BrokerClient, CacheClient, ConsumerSession, Connector, ErrorReporter, ObjectStore,
    PubSubClient, PubSubMessage, StandaloneConnector,
};
use ingestion_server::config::ServerConfig;
use ingestion_server::jobs::JobStore;
use ingestion_server::worker_pool::{PoolTask, TaskRunner, TaskRunnerFactory};
use ingestion_server::{BrokerError, Result, ServerError};

/// One observed task execution edge
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Started { unit: usize, task: PoolTask },
    Finished { unit: usize, task: PoolTask },
}

/// Records every task every unit runs
#[derive(Default)]
pub struct RecordingRunnerFactory {
    pub events: Arc<Mutex<Vec<TaskEvent>>>,
    pub calls: Arc<Mutex<Vec<(usize, PoolTask, Value)>>>,
    pub created: AtomicUsize,
    pub delays: Mutex<Vec<(PoolTask, Duration)>>,
    pub schedule: Mutex<Value>,
}

impl RecordingRunnerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            schedule: Mutex::new(json!({})),
            ..Default::default()
        })
    }

    /// Make every run of `task` take at least `delay`
    pub fn slow(&self, task: PoolTask, delay: Duration) {
        self.delays.lock().push((task, delay));
    }

    pub fn set_schedule(&self, schedule: Value) {
        *self.schedule.lock() = schedule;
    }

    pub fn count(&self, task: PoolTask) -> usize {
        self.calls.lock().iter().filter(|(_, t, _)| *t == task).count()
    }

    pub fn finished(&self, task: PoolTask) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, TaskEvent::Finished { task: t, .. } if *t == task))
            .count()
    }

    pub fn events_for(&self, task: PoolTask) -> Vec<TaskEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| match event {
                TaskEvent::Started { task: t, .. } | TaskEvent::Finished { task: t, .. } => {
                    *t == task
                }
            })
            .cloned()
            .collect()
    }
}

struct RecordingRunner {
    unit: usize,
    events: Arc<Mutex<Vec<TaskEvent>>>,
    calls: Arc<Mutex<Vec<(usize, PoolTask, Value)>>>,
    delay: Vec<(PoolTask, Duration)>,
    schedule: Value,
}

#[async_trait]
impl TaskRunner for RecordingRunner {
    async fn run(&self, task: PoolTask, args: Value) -> Result<Value> {
        self.calls.lock().push((self.unit, task, args));
        self.events.lock().push(TaskEvent::Started {
            unit: self.unit,
            task,
        });
        if let Some((_, delay)) = self.delay.iter().find(|(t, _)| *t == task) {
            tokio::time::sleep(*delay).await;
        }
        self.events.lock().push(TaskEvent::Finished {
            unit: self.unit,
            task,
        });

        Ok(match task {
            PoolTask::GetPluginSchedule => self.schedule.clone(),
            _ => Value::Null,
        })
    }
}

impl TaskRunnerFactory for RecordingRunnerFactory {
    fn create(&self, unit_id: usize) -> Result<Arc<dyn TaskRunner>> {
        self.created.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(RecordingRunner {
            unit: unit_id,
            events: self.events.clone(),
            calls: self.calls.clone(),
            delay: self.delays.lock().clone(),
            schedule: self.schedule.lock().clone(),
        }))
    }
}

/// Open/close counters shared by [`CountingConnector`] and its clients
#[derive(Default)]
pub struct Counters {
    pub broker_connects: AtomicUsize,
    pub broker_disconnects: AtomicUsize,
    pub job_store_connects: AtomicUsize,
    pub pubsub_closes: AtomicUsize,
}

/// Standalone connector that counts connects and closes
#[derive(Clone, Default)]
pub struct CountingConnector {
    pub inner: StandaloneConnector,
    pub counters: Arc<Counters>,
    pub fail_job_store: bool,
}

impl CountingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_job_store() -> Self {
        Self {
            fail_job_store: true,
            ..Self::default()
        }
    }

    pub fn broker_disconnects(&self) -> usize {
        self.counters.broker_disconnects.load(Ordering::Acquire)
    }

    pub fn broker_connects(&self) -> usize {
        self.counters.broker_connects.load(Ordering::Acquire)
    }

    pub fn pubsub_closes(&self) -> usize {
        self.counters.pubsub_closes.load(Ordering::Acquire)
    }
}

struct CountingBroker {
    inner: Arc<dyn BrokerClient>,
    counters: Arc<Counters>,
}

#[async_trait]
impl BrokerClient for CountingBroker {
    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        value: &[u8],
    ) -> std::result::Result<(), BrokerError> {
        self.inner.produce(topic, key, value).await
    }

    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
    ) -> std::result::Result<Box<dyn ConsumerSession>, BrokerError> {
        self.inner.subscribe(topics, group_id).await
    }

    async fn disconnect(&self) -> std::result::Result<(), BrokerError> {
        self.counters.broker_disconnects.fetch_add(1, Ordering::AcqRel);
        self.inner.disconnect().await
    }
}

struct CountingPubSub {
    inner: Arc<dyn PubSubClient>,
    counters: Arc<Counters>,
}

#[async_trait]
impl PubSubClient for CountingPubSub {
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<PubSubMessage>> {
        self.inner.subscribe(channels).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.inner.publish(channel, payload).await
    }

    async fn close(&self) -> Result<()> {
        self.counters.pubsub_closes.fetch_add(1, Ordering::AcqRel);
        self.inner.close().await
    }
}

#[async_trait]
impl Connector for CountingConnector {
    async fn connect_broker(&self, config: &ServerConfig) -> Result<Arc<dyn BrokerClient>> {
        self.counters.broker_connects.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(CountingBroker {
            inner: self.inner.connect_broker(config).await?,
            counters: self.counters.clone(),
        }))
    }

    async fn connect_job_store(&self, config: &ServerConfig) -> Result<Arc<dyn JobStore>> {
        self.counters.job_store_connects.fetch_add(1, Ordering::AcqRel);
        if self.fail_job_store {
            return Err(ServerError::DatabaseUnavailable(
                "connection refused".to_string(),
            ));
        }
        self.inner.connect_job_store(config).await
    }

    async fn connect_cache(&self, config: &ServerConfig) -> Result<Arc<dyn CacheClient>> {
        self.inner.connect_cache(config).await
    }

    async fn connect_pubsub(&self, config: &ServerConfig) -> Result<Arc<dyn PubSubClient>> {
        Ok(Arc::new(CountingPubSub {
            inner: self.inner.connect_pubsub(config).await?,
            counters: self.counters.clone(),
        }))
    }

    async fn connect_object_store(&self, config: &ServerConfig) -> Result<Arc<dyn ObjectStore>> {
        self.inner.connect_object_store(config).await
    }
}

/// Error reporter that remembers what it was given
#[derive(Default)]
pub struct CapturingReporter {
    pub captured: Mutex<Vec<(String, String)>>,
}

impl CapturingReporter {
    pub fn count(&self) -> usize {
        self.captured.lock().len()
    }
}

impl ErrorReporter for CapturingReporter {
    fn capture(&self, error: &ServerError, context: &str) {
        self.captured
            .lock()
            .push((context.to_string(), error.to_string()));
    }
}

/// Config for `capabilities` with fast timings and an ephemeral HTTP port
pub fn test_config(capabilities: &str) -> ServerConfig {
    let mut config = ServerConfig {
        environment: "test".to_string(),
        capabilities: Some(capabilities.to_string()),
        ..Default::default()
    };
    config.broker.consumer.max_wait_ms = 10;
    config.broker.consumer.retry_backoff_ms = 5;
    config.broker.consumer.retry_backoff_max_ms = 50;
    config.worker_pool.concurrency = 2;
    config.worker_pool.teardown_timeout_ms = 500;
    config.worker_pool.flush_timeout_ms = 200;
    config.jobs.poll_interval_ms = 10;
    config.http.host = "127.0.0.1".to_string();
    config.http.port = 0;
    config.health.check_timeout_ms = 200;
    config.runtime.lag_sample_interval_ms = 50;
    config
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

/// Minimal HTTP/1.1 GET returning the status code and body
pub async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}
