//! # Lifecycle Orchestrator
//!
//! Owns every long-lived handle in the process and the single shutdown path.
//!
//! ## Startup
//!
//! Enabled steps run in [`STARTUP_ORDER`]. Before a step starts, the shared resources
//! it declares in [`StartupStep::requirements`] are constructed on first need and reused
//! afterwards. A failing step triggers the full shutdown sequence and the error is
//! returned; partial startup is never left running.
//!
//! ## Shutdown
//!
//! Runs at most once; concurrent callers await the same run.
//!
//! 1. Stop the HTTP server
//! 2. Cancel interval timers
//! 3. Stop the runtime lag sampler
//! 4. Stop every subsystem concurrently, logging individual failures
//! 5. Shut down the worker pool (teardown broadcast, then flush)
//! 6. Close the resource hub
//!
//! ## Faults
//!
//! Signals, panics, unrecoverable errors and the end of a primary stream all arrive
//! at [`Orchestrator::run_until`], which maps them to an [`ExitStatus`] and performs
//! the shutdown. They are honored during startup as well: a signal or fault that
//! arrives while a step is still starting abandons the rest of startup.

pub mod panics;
pub mod plan;
pub mod shared;
pub mod signals;
pub mod timers;

mod subsystem;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OnceCell};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::clients::{Connector, ErrorReporter, TracingErrorReporter};
use crate::config::{CapabilitySet, ServerConfig};
use crate::consumer::processors::{
    BatchProcessor, JobsProcessor, PoolDispatchProcessor, ScheduledTasksProcessor,
    SessionRecordingBlobProcessor, SessionRecordingEventsProcessor,
};
use crate::consumer::{ConsumerGroupManager, ConsumerState, StreamKind};
use crate::error::{Result, ServerError};
use crate::health::HealthRegistry;
use crate::hub::Hub;
use crate::jobs::{JobQueue, JobQueueRunner};
use crate::metrics::SHUTDOWN_DURATION;
use crate::pubsub::{register_reload_handlers, ReloadBus};
use crate::schedule::{self, Scheduler};
use crate::web::HttpServer;
use crate::worker_pool::{PoolTask, TaskRunnerFactory, WorkerPool};

pub use panics::{contain, contain_sync, install_panic_hook};
pub use plan::{startup_plan, Requirements, StartupStep, STARTUP_ORDER};
pub use shared::Shared;
pub use signals::wait_for_shutdown_signal;
pub use subsystem::Subsystem;
pub use timers::{LagSampler, Timers};

/// Something that ends the process
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// A primary stream's consumer reached a terminal state
    PrimaryStreamEnded { stream: StreamKind, errored: bool },
    /// A subsystem hit an error it cannot recover from
    Unrecoverable { context: String, message: String },
    /// A task or thread panicked
    Panic { message: String },
}

impl Fault {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Fault::PrimaryStreamEnded { errored: false, .. } => ExitStatus::Clean,
            _ => ExitStatus::Failure,
        }
    }
}

pub type FaultSender = mpsc::UnboundedSender<Fault>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Clean,
    Failure,
}

impl ExitStatus {
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Clean => 0,
            ExitStatus::Failure => 1,
        }
    }
}

pub struct Orchestrator {
    config: Arc<ServerConfig>,
    capabilities: CapabilitySet,
    connector: Arc<dyn Connector>,
    runner_factory: Arc<dyn TaskRunnerFactory>,
    reporter: Arc<dyn ErrorReporter>,
    hub: Shared<Hub>,
    pool: Shared<WorkerPool>,
    health: Arc<HealthRegistry>,
    subsystems: parking_lot::Mutex<Vec<Arc<dyn Subsystem>>>,
    consumers: parking_lot::Mutex<Vec<Arc<ConsumerGroupManager>>>,
    watchers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    timers: Timers,
    lag_sampler: parking_lot::Mutex<Option<LagSampler>>,
    http: tokio::sync::Mutex<Option<HttpServer>>,
    http_addr: parking_lot::Mutex<Option<SocketAddr>>,
    faults_tx: FaultSender,
    faults_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Fault>>,
    started: AtomicBool,
    shutdown: OnceCell<()>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("capabilities", &self.capabilities)
            .field("started", &self.started.load(Ordering::Acquire))
            .field("shut_down", &self.shutdown.initialized())
            .finish()
    }
}

impl Orchestrator {
    /// Resolve and validate the capability set. Conflicting capabilities fail here,
    /// before anything is constructed.
    pub fn new(
        config: ServerConfig,
        connector: Arc<dyn Connector>,
        runner_factory: Arc<dyn TaskRunnerFactory>,
    ) -> Result<Self> {
        let capabilities = config.capability_set()?;
        let health = Arc::new(HealthRegistry::new(config.health.check_timeout()));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config: Arc::new(config),
            capabilities,
            connector,
            runner_factory,
            reporter: Arc::new(TracingErrorReporter),
            hub: Shared::new("resource hub"),
            pool: Shared::new("worker pool"),
            health,
            subsystems: parking_lot::Mutex::new(Vec::new()),
            consumers: parking_lot::Mutex::new(Vec::new()),
            watchers: parking_lot::Mutex::new(Vec::new()),
            timers: Timers::new(),
            lag_sampler: parking_lot::Mutex::new(None),
            http: tokio::sync::Mutex::new(None),
            http_addr: parking_lot::Mutex::new(None),
            faults_tx,
            faults_rx: tokio::sync::Mutex::new(faults_rx),
            started: AtomicBool::new(false),
            shutdown: OnceCell::new(),
        })
    }

    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    /// Channel for reporting faults from outside the managed tasks
    pub fn fault_sender(&self) -> FaultSender {
        self.faults_tx.clone()
    }

    pub fn hub_constructions(&self) -> usize {
        self.hub.constructions()
    }

    pub fn pool_constructions(&self) -> usize {
        self.pool.constructions()
    }

    pub fn current_hub(&self) -> Option<Arc<Hub>> {
        self.hub.get()
    }

    pub fn current_pool(&self) -> Option<Arc<WorkerPool>> {
        self.pool.get()
    }

    pub fn consumer(&self, kind: StreamKind) -> Option<Arc<ConsumerGroupManager>> {
        self.consumers
            .lock()
            .iter()
            .find(|consumer| consumer.kind() == kind)
            .cloned()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn timer_names(&self) -> Vec<&'static str> {
        self.timers.names()
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        *self.http_addr.lock()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.initialized()
    }

    /// Start every enabled step in order. A failing step shuts down whatever already
    /// started before the error is returned.
    pub async fn start(&self) -> Result<()> {
        let result = self.start_steps().await;
        if result.is_err() {
            self.shutdown().await;
        }
        result
    }

    #[instrument(skip(self), fields(capabilities = ?self.capabilities))]
    async fn start_steps(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ServerError::InvalidState(
                "orchestrator already started".to_string(),
            ));
        }

        let plan = startup_plan(&self.capabilities);
        info!(
            steps = ?plan.iter().map(StartupStep::name).collect::<Vec<_>>(),
            "🚀 LIFECYCLE: Starting ingestion server"
        );

        *self.lag_sampler.lock() = Some(LagSampler::start(Duration::from_millis(
            self.config.runtime.lag_sample_interval_ms.max(1),
        )));

        for step in plan {
            if let Err(e) = self.start_step(step).await {
                error!(step = %step, error = %e, "❌ LIFECYCLE: Startup step failed");
                self.reporter.capture(&e, step.name());
                return Err(e);
            }
            info!(step = %step, "✅ LIFECYCLE: Step started");
        }

        info!(
            consumers = self.consumer_count(),
            health_checks = self.health.len(),
            "🎉 LIFECYCLE: Ingestion server started"
        );
        Ok(())
    }

    async fn hub(&self) -> Result<Arc<Hub>> {
        self.hub
            .get_or_try_init(|| {
                Hub::connect(
                    self.config.clone(),
                    &self.capabilities,
                    self.connector.as_ref(),
                    self.reporter.clone(),
                )
            })
            .await
    }

    async fn pool(&self) -> Result<Arc<WorkerPool>> {
        self.pool
            .get_or_try_init(|| async {
                WorkerPool::new(
                    self.config.worker_pool.clone(),
                    self.runner_factory.as_ref(),
                )
            })
            .await
    }

    async fn start_step(&self, step: StartupStep) -> Result<()> {
        let requirements = step.requirements();
        if requirements.hub {
            self.hub().await?;
        }
        if requirements.pool {
            self.pool().await?;
        }

        match step {
            StartupStep::Jobs => {
                let hub = self.hub().await?;
                let queue = JobQueue::new(hub.job_store(), self.config.jobs.clone());
                let runner = Arc::new(JobQueueRunner::new(queue.clone(), self.pool().await?));
                self.subsystems.lock().push(runner.clone());
                runner.start().await?;
                let probe = runner.clone();
                self.health
                    .register_sync(probe.name().to_string(), move || probe.is_healthy());

                let processor = Arc::new(JobsProcessor::new(queue, hub.clone()));
                self.start_consumer(StreamKind::Jobs, processor, &hub).await
            }
            StartupStep::ScheduledTasks => {
                let hub = self.hub().await?;
                let pool = self.pool().await?;
                schedule::reload_schedule(&pool, &hub).await?;
                self.spawn_schedule_timers(hub.clone(), pool.clone());

                let processor = Arc::new(ScheduledTasksProcessor::new(pool, hub.clone()));
                self.start_consumer(StreamKind::ScheduledTasks, processor, &hub)
                    .await
            }
            StartupStep::Ingestion
            | StartupStep::IngestionOverflow
            | StartupStep::AsyncHandlers
            | StartupStep::AsyncOnEvent
            | StartupStep::AsyncWebhooks => {
                let kind = step.stream().ok_or_else(|| {
                    ServerError::InvalidState(format!("{step} has no stream"))
                })?;
                let task = kind.pool_task().ok_or_else(|| {
                    ServerError::InvalidState(format!("{} has no pool task", kind.name()))
                })?;
                let hub = self.hub().await?;
                let processor =
                    Arc::new(PoolDispatchProcessor::new(task, self.pool().await?, hub.clone()));
                self.start_consumer(kind, processor, &hub).await
            }
            StartupStep::ReloadBus => {
                let hub = self.hub().await?;
                let pool = self.pool().await?;
                let bus = Arc::new(ReloadBus::new(hub.pubsub()));
                register_reload_handlers(&bus, hub, pool.clone(), &self.capabilities);
                self.subsystems.lock().push(bus.clone());
                bus.start().await?;

                self.timers.spawn_interval(
                    "reload-all-actions",
                    Duration::from_secs(self.config.reload.actions_interval_secs.max(1)),
                    move || {
                        let pool = pool.clone();
                        async move {
                            pool.broadcast(PoolTask::ReloadAllActions, Value::Null).await?;
                            Ok(())
                        }
                        .boxed()
                    },
                );
                Ok(())
            }
            StartupStep::SessionRecordings => {
                let hub = self.hub().await?;
                let processor = Arc::new(SessionRecordingEventsProcessor::new(
                    hub.broker(),
                    hub.clone(),
                ));
                self.start_consumer(StreamKind::SessionRecordings, processor, &hub)
                    .await
            }
            StartupStep::SessionRecordingsBlob => {
                let hub = self.hub().await?;
                let store = hub.object_store().ok_or_else(|| {
                    ServerError::Startup("object storage client is not connected".to_string())
                })?;
                let processor = Arc::new(SessionRecordingBlobProcessor::new(
                    store,
                    &self.config.object_storage,
                    hub.clone(),
                ));
                self.start_consumer(StreamKind::SessionRecordingsBlob, processor, &hub)
                    .await
            }
            StartupStep::Http => {
                let server = HttpServer::bind(&self.config.http, self.health.clone()).await?;
                *self.http_addr.lock() = Some(server.local_addr());
                *self.http.lock().await = Some(server);
                Ok(())
            }
        }
    }

    fn spawn_schedule_timers(&self, hub: Arc<Hub>, pool: Arc<WorkerPool>) {
        {
            let hub = hub.clone();
            self.timers.spawn_interval(
                "reload-schedule",
                Duration::from_secs(self.config.schedule.refresh_interval_secs.max(1)),
                move || {
                    let hub = hub.clone();
                    let pool = pool.clone();
                    async move {
                        schedule::reload_schedule(&pool, &hub).await?;
                        Ok(())
                    }
                    .boxed()
                },
            );
        }

        let scheduler = Arc::new(Scheduler::new(hub));
        self.timers.spawn_interval(
            "scheduled-tasks",
            Duration::from_secs(self.config.schedule.tick_interval_secs.max(1)),
            move || {
                let scheduler = scheduler.clone();
                async move {
                    scheduler.tick(Utc::now()).await?;
                    Ok(())
                }
                .boxed()
            },
        );
    }

    async fn start_consumer(
        &self,
        kind: StreamKind,
        processor: Arc<dyn BatchProcessor>,
        hub: &Hub,
    ) -> Result<()> {
        let consumer = Arc::new(ConsumerGroupManager::new(
            kind,
            hub.broker(),
            processor,
            self.config.broker.consumer.clone(),
            hub.error_reporter(),
        ));
        self.consumers.lock().push(consumer.clone());
        consumer.start().await?;

        let probe = consumer.clone();
        self.health
            .register_sync(kind.health_name(), move || probe.is_healthy());

        if kind.is_primary() {
            let faults = self.faults_tx.clone();
            let watcher = tokio::spawn(async move {
                if let Ok(state) = consumer.join(None).await {
                    let _ = faults.send(Fault::PrimaryStreamEnded {
                        stream: kind,
                        errored: state == ConsumerState::Errored,
                    });
                }
            });
            self.watchers.lock().push(watcher);
        }
        Ok(())
    }

    /// Run the shutdown sequence. Only the first call does the work; every caller
    /// returns once it has finished.
    pub async fn shutdown(&self) {
        self.shutdown.get_or_init(|| self.run_shutdown()).await;
    }

    async fn run_shutdown(&self) {
        let started = Instant::now();
        info!("🛑 LIFECYCLE: Shutting down");

        let http = self.http.lock().await.take();
        if let Some(server) = http {
            server.stop().await;
        }

        self.timers.cancel_all().await;

        let sampler = self.lag_sampler.lock().take();
        if let Some(sampler) = sampler {
            sampler.stop().await;
        }

        let mut subsystems: Vec<Arc<dyn Subsystem>> = self.subsystems.lock().clone();
        subsystems.extend(
            self.consumers
                .lock()
                .iter()
                .map(|consumer| consumer.clone() as Arc<dyn Subsystem>),
        );
        let outcomes = join_all(subsystems.iter().map(|subsystem| async move {
            (subsystem.name().to_string(), subsystem.stop().await)
        }))
        .await;
        for (name, outcome) in outcomes {
            if let Err(e) = outcome {
                warn!(subsystem = %name, error = %e, "⚠️ LIFECYCLE: Subsystem did not stop cleanly");
            }
        }

        let watchers: Vec<JoinHandle<()>> = self.watchers.lock().drain(..).collect();
        for watcher in watchers {
            watcher.abort();
        }

        if let Some(pool) = self.pool.take_for_close() {
            pool.shutdown().await;
        }
        if let Some(hub) = self.hub.take_for_close() {
            hub.close().await;
        }

        let elapsed = started.elapsed();
        metrics::histogram!(SHUTDOWN_DURATION).record(elapsed.as_secs_f64());
        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            "✅ LIFECYCLE: Shutdown complete"
        );
    }

    /// Start, wait for `signal` or the first fault, then shut down.
    ///
    /// `signal` is polled before startup makes any progress, so a listener it
    /// installs on first poll is in place for the whole of startup.
    pub async fn run_until<F>(&self, signal: F) -> ExitStatus
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut faults = self.faults_rx.lock().await;

        let interrupted = tokio::select! {
            biased;
            _ = &mut signal => {
                info!("🛑 LIFECYCLE: Shutdown requested during startup");
                Some(ExitStatus::Clean)
            }
            fault = faults.recv() => Some(self.fault_status(fault)),
            started = self.start_steps() => started.err().map(|_| ExitStatus::Failure),
        };

        let status = match interrupted {
            Some(status) => status,
            None => tokio::select! {
                _ = &mut signal => {
                    info!("🛑 LIFECYCLE: Graceful shutdown requested");
                    ExitStatus::Clean
                }
                fault = faults.recv() => self.fault_status(fault),
            },
        };
        drop(faults);

        self.shutdown().await;
        info!(exit_code = status.code(), "👋 LIFECYCLE: Exiting");
        status
    }

    /// Run until SIGINT, SIGTERM, SIGHUP or a fault
    pub async fn run(&self) -> ExitStatus {
        self.run_until(async {
            if let Err(e) = wait_for_shutdown_signal().await {
                error!(error = %e, "❌ LIFECYCLE: Could not install signal handlers");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    fn fault_status(&self, fault: Option<Fault>) -> ExitStatus {
        match fault {
            Some(fault) => self.handle_fault(&fault),
            None => ExitStatus::Clean,
        }
    }

    fn handle_fault(&self, fault: &Fault) -> ExitStatus {
        match fault {
            Fault::PrimaryStreamEnded { stream, errored } => {
                if *errored {
                    error!(stream = %stream.name(), "❌ LIFECYCLE: Primary stream failed");
                } else {
                    info!(stream = %stream.name(), "🛑 LIFECYCLE: Primary stream ended");
                }
            }
            Fault::Unrecoverable { context, message } => {
                self.reporter
                    .capture(&ServerError::processing(message.clone()), context);
            }
            Fault::Panic { message } => {
                self.reporter.capture(
                    &ServerError::InvalidState(format!("panic: {message}")),
                    "panic",
                );
            }
        }
        fault.exit_status()
    }
}
