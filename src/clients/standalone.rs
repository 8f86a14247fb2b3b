//! Connector for single-process runs.
//!
//! The job store is Postgres when `database.url` is configured and in-memory
//! otherwise. Broker, cache, pub/sub and object storage are in-process, shared by
//! every component that asks for them through this connector.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{
    BrokerClient, CacheClient, Connector, MemoryBroker, MemoryCache, MemoryObjectStore,
    MemoryPubSub, ObjectStore, PubSubClient,
};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::jobs::store::{JobStore, MemoryJobStore, PgJobStore};

#[derive(Clone, Default)]
pub struct StandaloneConnector {
    broker: MemoryBroker,
    cache: MemoryCache,
    pubsub: MemoryPubSub,
    objects: MemoryObjectStore,
}

impl StandaloneConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    pub fn pubsub(&self) -> &MemoryPubSub {
        &self.pubsub
    }

    pub fn object_store(&self) -> &MemoryObjectStore {
        &self.objects
    }
}

#[async_trait]
impl Connector for StandaloneConnector {
    async fn connect_broker(&self, config: &ServerConfig) -> Result<Arc<dyn BrokerClient>> {
        info!(
            client_id = %config.broker.client_id,
            "Using in-process broker"
        );
        Ok(Arc::new(self.broker.clone()))
    }

    async fn connect_job_store(&self, config: &ServerConfig) -> Result<Arc<dyn JobStore>> {
        match config.database.url.as_deref() {
            Some(url) if !url.is_empty() => {
                Ok(Arc::new(PgJobStore::connect(url, &config.database).await?))
            }
            _ => {
                info!("No database.url configured, job queue runs in memory");
                Ok(MemoryJobStore::new())
            }
        }
    }

    async fn connect_cache(&self, _config: &ServerConfig) -> Result<Arc<dyn CacheClient>> {
        Ok(Arc::new(self.cache.clone()))
    }

    async fn connect_pubsub(&self, _config: &ServerConfig) -> Result<Arc<dyn PubSubClient>> {
        Ok(Arc::new(self.pubsub.clone()))
    }

    async fn connect_object_store(&self, _config: &ServerConfig) -> Result<Arc<dyn ObjectStore>> {
        Ok(Arc::new(self.objects.clone()))
    }
}
