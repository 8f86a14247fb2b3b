//! # Reload Bus
//!
//! Listens on pub/sub channels written by other services and turns each message into
//! worker-pool broadcasts. One handler per channel; registering a second handler for
//! the same channel replaces the first. Messages are handled one at a time in arrival
//! order, so every reload produces its own broadcast barrier.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{PubSubClient, PubSubMessage};
use crate::config::{Capability, CapabilitySet};
use crate::constants::channels;
use crate::error::{Result, ServerError};
use crate::hub::Hub;
use crate::lifecycle::Subsystem;
use crate::metrics;
use crate::schedule;
use crate::worker_pool::{PoolTask, WorkerPool};

pub type ReloadHandler = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct ReloadBus {
    pubsub: Arc<dyn PubSubClient>,
    handlers: Arc<parking_lot::RwLock<HashMap<String, ReloadHandler>>>,
    cancel: CancellationToken,
    started: AtomicBool,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ReloadBus {
    pub fn new(pubsub: Arc<dyn PubSubClient>) -> Self {
        Self {
            pubsub,
            handlers: Arc::new(parking_lot::RwLock::new(HashMap::new())),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Set the handler for `channel`, replacing any earlier one
    pub fn subscribe<F>(&self, channel: impl Into<String>, handler: F)
    where
        F: Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let channel = channel.into();
        if self
            .handlers
            .write()
            .insert(channel.clone(), Arc::new(handler))
            .is_some()
        {
            debug!(channel = %channel, "Replaced reload handler");
        }
    }

    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.handlers.read().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Subscribe to every channel with a handler and start dispatching
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::InvalidState(
                "reload bus already started".to_string(),
            ));
        }

        let channels = self.channels();
        let receiver = self.pubsub.subscribe(&channels).await?;
        let handlers = self.handlers.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(listen(receiver, handlers, cancel));
        *self.handle.lock().await = Some(handle);

        info!(channels = ?channels, "📡 PUBSUB: Listening for reload messages");
        Ok(())
    }
}

async fn listen(
    mut receiver: mpsc::Receiver<PubSubMessage>,
    handlers: Arc<parking_lot::RwLock<HashMap<String, ReloadHandler>>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let handler = handlers.read().get(&message.channel).cloned();
        let Some(handler) = handler else {
            debug!(channel = %message.channel, "No handler for channel");
            continue;
        };

        metrics::record_reload_message(&message.channel);
        info!(channel = %message.channel, "🔄 PUBSUB: Reload message received");
        // Handled inline so the next message waits for this one's broadcasts
        if let Err(e) = handler(message.payload).await {
            warn!(channel = %message.channel, error = %e, "⚠️ PUBSUB: Reload handler failed");
        }
    }
    debug!("Reload bus listener stopped");
}

#[async_trait]
impl Subsystem for ReloadBus {
    fn name(&self) -> &str {
        "pubsub"
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            handle
                .await
                .map_err(|e| ServerError::InvalidState(format!("reload listener failed: {e}")))?;
        }
        info!("✅ PUBSUB: Reload bus stopped");
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }
}

/// Forward a raw message payload as broadcast arguments
fn payload_args(payload: &str) -> Value {
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

/// Wire the server's reload channels into pool broadcasts
pub fn register_reload_handlers(
    bus: &ReloadBus,
    hub: Arc<Hub>,
    pool: Arc<WorkerPool>,
    capabilities: &CapabilitySet,
) {
    let reload_schedule = capabilities.contains(Capability::PluginScheduledTasks);
    {
        let hub = hub.clone();
        let pool = pool.clone();
        bus.subscribe(channels::RELOAD_PLUGINS, move |_payload| {
            let hub = hub.clone();
            let pool = pool.clone();
            async move {
                pool.broadcast(PoolTask::ReloadPlugins, Value::Null).await?;
                if reload_schedule {
                    schedule::reload_schedule(&pool, &hub).await?;
                }
                hub.record_activity("reload");
                Ok(())
            }
            .boxed()
        });
    }

    forward(
        bus,
        channels::RESET_AVAILABLE_FEATURES_CACHE,
        PoolTask::ResetAvailableFeaturesCache,
        pool.clone(),
    );

    if capabilities.has_async_handlers() {
        forward(bus, channels::RELOAD_ACTION, PoolTask::ReloadAction, pool.clone());
        forward(bus, channels::DROP_ACTION, PoolTask::DropAction, pool);
    }
}

fn forward(bus: &ReloadBus, channel: &str, task: PoolTask, pool: Arc<WorkerPool>) {
    bus.subscribe(channel, move |payload| {
        let pool = pool.clone();
        async move {
            pool.broadcast(task, payload_args(&payload)).await?;
            Ok(())
        }
        .boxed()
    });
}
