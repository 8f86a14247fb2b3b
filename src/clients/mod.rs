//! # External Collaborator Clients
//!
//! The server never speaks a wire protocol itself. Brokers, caches, pub/sub, object
//! storage and the relational job store are reached through the traits in this module,
//! and a [`Connector`] decides which implementation backs each of them.
//!
//! - [`BrokerClient`] / [`ConsumerSession`]: `produce`, consumer-group `fetch`/`commit`
//! - [`CacheClient`]: `get`/`set`/`expire`
//! - [`PubSubClient`]: channel subscriptions feeding the reload bus
//! - [`ObjectStore`]: `put_object`/`get_object`
//! - [`ErrorReporter`]: the error-tracking collaborator

pub mod memory;
pub mod standalone;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::error;

use crate::config::ServerConfig;
use crate::error::{BrokerError, Result, ServerError};
use crate::jobs::store::JobStore;

pub use memory::{MemoryBroker, MemoryCache, MemoryObjectStore, MemoryPubSub};
pub use standalone::StandaloneConnector;

/// A single record read from a partitioned log
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub timestamp_ms: i64,
}

impl Record {
    /// Approximate wire size used against fetch byte limits
    pub fn size(&self) -> usize {
        self.value.len() + self.key.as_ref().map(|k| k.len()).unwrap_or(0)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(|e| {
            ServerError::processing(format!(
                "malformed payload at {}[{}]@{}: {e}",
                self.topic, self.partition, self.offset
            ))
        })
    }
}

/// Batch bounds passed on every fetch
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub max_bytes: usize,
    pub max_bytes_per_partition: usize,
    pub max_wait: Duration,
}

/// Offset to commit for a partition: the next offset to read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Commit positions covering every record in `records`
pub fn next_offsets(records: &[Record]) -> Vec<TopicPartitionOffset> {
    let mut highest: HashMap<(&str, i32), i64> = HashMap::new();
    for record in records {
        let entry = highest
            .entry((record.topic.as_str(), record.partition))
            .or_insert(record.offset);
        if record.offset > *entry {
            *entry = record.offset;
        }
    }

    let mut offsets: Vec<TopicPartitionOffset> = highest
        .into_iter()
        .map(|((topic, partition), offset)| TopicPartitionOffset {
            topic: topic.to_string(),
            partition,
            offset: offset + 1,
        })
        .collect();
    offsets.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
    offsets
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn produce(&self, topic: &str, key: Option<&str>, value: &[u8])
        -> std::result::Result<(), BrokerError>;

    /// Join (or create) `group_id` consuming `topics`
    async fn subscribe(
        &self,
        topics: &[&str],
        group_id: &str,
    ) -> std::result::Result<Box<dyn ConsumerSession>, BrokerError>;

    async fn disconnect(&self) -> std::result::Result<(), BrokerError>;
}

/// Membership of one consumer group
#[async_trait]
pub trait ConsumerSession: Send {
    /// Fetch the next batch. An empty batch means nothing arrived within `max_wait`.
    /// [`BrokerError::Disconnected`] means the stream has ended for this member.
    async fn fetch(&mut self, options: &FetchOptions)
        -> std::result::Result<Vec<Record>, BrokerError>;

    async fn commit(&mut self, offsets: &[TopicPartitionOffset])
        -> std::result::Result<(), BrokerError>;

    async fn leave(&mut self) -> std::result::Result<(), BrokerError>;
}

#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;
    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Stream messages for `channels` until the client is closed
    async fn subscribe(&self, channels: &[String]) -> Result<mpsc::Receiver<PubSubMessage>>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;
}

/// Error-tracking collaborator for unrecovered failures
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, error: &ServerError, context: &str);
}

/// Reports to the log stream only
#[derive(Debug, Default, Clone)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn capture(&self, error: &ServerError, context: &str) {
        metrics::counter!(crate::metrics::FAULTS_CAPTURED, "context" => context.to_string())
            .increment(1);
        error!(context = %context, error = %error, "Captured unrecovered error");
    }
}

/// Creates the shared clients the resource hub owns
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect_broker(&self, config: &ServerConfig) -> Result<Arc<dyn BrokerClient>>;
    async fn connect_job_store(&self, config: &ServerConfig) -> Result<Arc<dyn JobStore>>;
    async fn connect_cache(&self, config: &ServerConfig) -> Result<Arc<dyn CacheClient>>;
    async fn connect_pubsub(&self, config: &ServerConfig) -> Result<Arc<dyn PubSubClient>>;
    async fn connect_object_store(&self, config: &ServerConfig) -> Result<Arc<dyn ObjectStore>>;
}
