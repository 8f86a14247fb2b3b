//! # Resource Hub
//!
//! Shared-ownership record of the clients every capability talks through: broker,
//! relational job store, cache, pub/sub and object storage, plus the job schedule
//! and the last-activity marker. The orchestrator constructs it at most once and
//! closes it exactly once. Components hold `Arc<Hub>` and never close it themselves.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clients::{
    BrokerClient, CacheClient, Connector, ErrorReporter, ObjectStore, PubSubClient,
};
use crate::config::{Capability, CapabilitySet, ServerConfig};
use crate::error::Result;
use crate::jobs::store::JobStore;
use crate::schedule::JobSchedule;

/// Most recent unit of work this process handled
#[derive(Debug, Clone, PartialEq)]
pub struct Activity {
    pub at: DateTime<Utc>,
    pub kind: String,
}

pub struct Hub {
    instance_id: Uuid,
    config: Arc<ServerConfig>,
    broker: Arc<dyn BrokerClient>,
    job_store: Arc<dyn JobStore>,
    cache: Arc<dyn CacheClient>,
    pubsub: Arc<dyn PubSubClient>,
    object_store: Option<Arc<dyn ObjectStore>>,
    reporter: Arc<dyn ErrorReporter>,
    job_schedule: RwLock<JobSchedule>,
    last_activity: RwLock<Option<Activity>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("instance_id", &self.instance_id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Hub {
    /// Open every client the enabled capabilities need. Any failure aborts startup.
    pub async fn connect(
        config: Arc<ServerConfig>,
        capabilities: &CapabilitySet,
        connector: &dyn Connector,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let broker = connector.connect_broker(&config).await?;
        let job_store = connector.connect_job_store(&config).await?;
        let cache = connector.connect_cache(&config).await?;
        let pubsub = connector.connect_pubsub(&config).await?;
        let object_store = if capabilities.contains(Capability::SessionRecordingBlobIngestion) {
            Some(connector.connect_object_store(&config).await?)
        } else {
            None
        };

        let hub = Self {
            instance_id: Uuid::new_v4(),
            config,
            broker,
            job_store,
            cache,
            pubsub,
            object_store,
            reporter,
            job_schedule: RwLock::new(JobSchedule::default()),
            last_activity: RwLock::new(None),
            closed: AtomicBool::new(false),
        };
        info!(instance_id = %hub.instance_id, "✅ HUB: Shared clients connected");
        Ok(hub)
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn BrokerClient> {
        self.broker.clone()
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        self.job_store.clone()
    }

    pub fn cache(&self) -> Arc<dyn CacheClient> {
        self.cache.clone()
    }

    pub fn pubsub(&self) -> Arc<dyn PubSubClient> {
        self.pubsub.clone()
    }

    pub fn object_store(&self) -> Option<Arc<dyn ObjectStore>> {
        self.object_store.clone()
    }

    pub fn error_reporter(&self) -> Arc<dyn ErrorReporter> {
        self.reporter.clone()
    }

    pub fn job_schedule(&self) -> JobSchedule {
        self.job_schedule.read().clone()
    }

    /// Swap in a freshly loaded schedule; no merging with the previous one
    pub fn replace_job_schedule(&self, schedule: JobSchedule) {
        *self.job_schedule.write() = schedule;
    }

    pub fn record_activity(&self, kind: impl Into<String>) {
        *self.last_activity.write() = Some(Activity {
            at: Utc::now(),
            kind: kind.into(),
        });
    }

    pub fn last_activity(&self) -> Option<Activity> {
        self.last_activity.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every client. Only the first call does anything.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.broker.disconnect().await {
            warn!(error = %e, "⚠️ HUB: Broker disconnect failed");
        }
        if let Err(e) = self.job_store.close().await {
            warn!(error = %e, "⚠️ HUB: Job store close failed");
        }
        if let Err(e) = self.cache.close().await {
            warn!(error = %e, "⚠️ HUB: Cache close failed");
        }
        if let Err(e) = self.pubsub.close().await {
            warn!(error = %e, "⚠️ HUB: Pub/sub close failed");
        }
        info!(instance_id = %self.instance_id, "✅ HUB: Shared clients closed");
    }
}
