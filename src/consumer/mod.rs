//! # Consumer Group Manager
//!
//! One manager per stream. Each runs its own fetch → process → commit loop on a
//! spawned task; within a stream a batch is fully processed and committed before the
//! next fetch, so offsets are only ever committed for finished work.
//!
//! ```text
//! Created ──start──▶ Starting ──joined──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                                            │
//!                                            └──unrecoverable error──▶ Errored
//! ```
//!
//! Broker errors are classified on the way in:
//!
//! - consumer-group churn codes are counted, logged and retried after a backoff
//! - `Unavailable` is retried with exponential backoff up to `max_transient_retries`
//! - `Disconnected` means the stream ended and the loop stops cleanly
//! - anything else, including processing failures, moves the manager to `Errored`
//!   and is reported to the error reporter

pub mod processors;
pub mod streams;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clients::{next_offsets, BrokerClient, ConsumerSession, ErrorReporter, FetchOptions, Record};
use crate::config::ConsumerConfig;
use crate::error::{BrokerError, Result, ServerError};
use crate::lifecycle::{contain, Subsystem};
use crate::metrics;
use crate::resilience::Backoff;

pub use processors::BatchProcessor;
pub use streams::StreamKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Errored)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Created => "created",
            ConsumerState::Starting => "starting",
            ConsumerState::Running => "running",
            ConsumerState::Stopping => "stopping",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Why the fetch loop exited
enum LoopExit {
    Cancelled,
    StreamEnded,
    Failed(ServerError),
}

/// Everything the fetch loop needs, cloned into its task
#[derive(Clone)]
struct LoopContext {
    kind: StreamKind,
    config: ConsumerConfig,
    processor: Arc<dyn BatchProcessor>,
    reporter: Arc<dyn ErrorReporter>,
    state: Arc<watch::Sender<ConsumerState>>,
    last_cycle: Arc<Mutex<Instant>>,
    last_error: Arc<Mutex<Option<String>>>,
}

pub struct ConsumerGroupManager {
    ctx: LoopContext,
    broker: Arc<dyn BrokerClient>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ConsumerGroupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerGroupManager")
            .field("stream", &self.ctx.kind.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ConsumerGroupManager {
    pub fn new(
        kind: StreamKind,
        broker: Arc<dyn BrokerClient>,
        processor: Arc<dyn BatchProcessor>,
        config: ConsumerConfig,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Created);
        Self {
            ctx: LoopContext {
                kind,
                config,
                processor,
                reporter,
                state: Arc::new(state),
                last_cycle: Arc::new(Mutex::new(Instant::now())),
                last_error: Arc::new(Mutex::new(None)),
            },
            broker,
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.ctx.kind
    }

    pub fn state(&self) -> ConsumerState {
        *self.ctx.state.borrow()
    }

    pub fn last_error(&self) -> Option<String> {
        self.ctx.last_error.lock().clone()
    }

    /// Join the consumer group and start the fetch loop
    #[instrument(skip(self), fields(stream = %self.ctx.kind.name()))]
    pub async fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if self.state() != ConsumerState::Created {
            return Err(ServerError::InvalidState(format!(
                "{} consumer cannot start from {}",
                self.ctx.kind.name(),
                self.state()
            )));
        }
        self.ctx.state.send_replace(ConsumerState::Starting);
        *self.ctx.last_cycle.lock() = Instant::now();

        let session = match self
            .broker
            .subscribe(&[self.ctx.kind.topic()], self.ctx.kind.group_id())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                let error = ServerError::from(e);
                fail(&self.ctx, &error);
                return Err(error);
            }
        };

        self.ctx.state.send_replace(ConsumerState::Running);
        metrics::record_consumers_running(1.0);
        info!(
            group_id = %self.ctx.kind.group_id(),
            topic = %self.ctx.kind.topic(),
            "🚀 CONSUMER: Joined consumer group"
        );

        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(supervise_loop(ctx, session, cancel)));
        Ok(())
    }

    /// Stop fetching and wait for the in-flight batch to be processed and committed
    #[instrument(skip(self), fields(stream = %self.ctx.kind.name()))]
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let mut handle = self.handle.lock().await;

        let mut never_started = false;
        self.ctx.state.send_if_modified(|state| match state {
            ConsumerState::Created => {
                *state = ConsumerState::Stopped;
                never_started = true;
                true
            }
            ConsumerState::Starting | ConsumerState::Running => {
                *state = ConsumerState::Stopping;
                true
            }
            // The loop may already have reached a terminal state on its own
            _ => false,
        });
        if never_started {
            return Ok(());
        }

        if let Some(task) = handle.take() {
            task.await.map_err(|e| {
                ServerError::InvalidState(format!(
                    "{} consumer loop failed: {e}",
                    self.ctx.kind.name()
                ))
            })?;
        } else {
            // Startup was abandoned before the loop was spawned
            self.ctx.state.send_if_modified(|state| {
                let abandoned = *state == ConsumerState::Stopping;
                if abandoned {
                    *state = ConsumerState::Stopped;
                }
                abandoned
            });
        }
        Ok(())
    }

    /// Resolve once the manager reaches `Stopped` or `Errored`
    pub async fn join(&self, timeout: Option<Duration>) -> Result<ConsumerState> {
        let mut receiver = self.ctx.state.subscribe();
        let wait = async move {
            receiver
                .wait_for(|state| state.is_terminal())
                .await
                .map(|state| *state)
                .map_err(|_| ServerError::InvalidState("consumer state channel closed".to_string()))
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                ServerError::timeout(format!("join {} consumer", self.ctx.kind.name()), limit)
            })?,
            None => wait.await,
        }
    }

    /// Running (or starting) and completed a fetch cycle within the liveness window
    pub fn is_healthy(&self) -> bool {
        matches!(
            self.state(),
            ConsumerState::Starting | ConsumerState::Running
        ) && self.ctx.last_cycle.lock().elapsed() <= self.ctx.config.liveness_timeout()
    }
}

#[async_trait]
impl Subsystem for ConsumerGroupManager {
    fn name(&self) -> &str {
        self.ctx.kind.name()
    }

    async fn stop(&self) -> Result<()> {
        ConsumerGroupManager::stop(self).await
    }

    fn is_healthy(&self) -> bool {
        ConsumerGroupManager::is_healthy(self)
    }
}

fn fail(ctx: &LoopContext, error: &ServerError) {
    *ctx.last_error.lock() = Some(error.to_string());
    error!(
        stream = %ctx.kind.name(),
        error = %error,
        "❌ CONSUMER: Consumer errored"
    );
    // Captured before Errored becomes observable to joiners
    ctx.reporter.capture(error, ctx.kind.name());
    ctx.state.send_replace(ConsumerState::Errored);
}

async fn supervise_loop(
    ctx: LoopContext,
    mut session: Box<dyn ConsumerSession>,
    cancel: CancellationToken,
) {
    let exit = match contain(run_loop(&ctx, session.as_mut(), &cancel)).await {
        Ok(exit) => exit,
        Err(_) => LoopExit::Failed(ServerError::InvalidState(format!(
            "{} consumer loop panicked",
            ctx.kind.name()
        ))),
    };

    if let Err(e) = session.leave().await {
        debug!(stream = %ctx.kind.name(), error = %e, "Leaving consumer group failed");
    }
    metrics::record_consumers_running(-1.0);

    match exit {
        LoopExit::Cancelled => {
            ctx.state.send_replace(ConsumerState::Stopped);
            info!(stream = %ctx.kind.name(), "✅ CONSUMER: Stopped");
        }
        LoopExit::StreamEnded => {
            ctx.state.send_replace(ConsumerState::Stopped);
            info!(stream = %ctx.kind.name(), "CONSUMER: Stream ended");
        }
        LoopExit::Failed(error) => {
            metrics::record_consumer_error(ctx.kind.name(), "fatal");
            fail(&ctx, &error);
        }
    }
}

/// Sleep unless cancelled first; returns false on cancellation
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn run_loop(
    ctx: &LoopContext,
    session: &mut dyn ConsumerSession,
    cancel: &CancellationToken,
) -> LoopExit {
    let stream = ctx.kind.name();
    let options = FetchOptions {
        max_bytes: ctx.config.max_bytes,
        max_bytes_per_partition: ctx.config.max_bytes_per_partition,
        max_wait: ctx.config.max_wait(),
    };
    let backoff = Backoff::from_millis(ctx.config.retry_backoff_ms, ctx.config.retry_backoff_max_ms);
    let mut transient_failures = 0u32;

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return LoopExit::Cancelled,
            fetched = session.fetch(&options) => fetched,
        };

        let error = match fetched {
            Ok(batch) => {
                *ctx.last_cycle.lock() = Instant::now();
                transient_failures = 0;
                if batch.is_empty() {
                    continue;
                }
                // Not raced against cancellation: a started batch is always finished
                match process_and_commit(ctx, session, &batch).await {
                    Ok(()) => continue,
                    Err(error) => error,
                }
            }
            Err(error) => ServerError::Broker(error),
        };

        let broker_error = match &error {
            ServerError::Broker(e) => Some(e.clone()),
            _ => None,
        };

        match broker_error {
            Some(BrokerError::Disconnected) => return LoopExit::StreamEnded,
            Some(e) if e.is_ignorable() => {
                let code = e.code().unwrap_or_default();
                metrics::record_ignorable_error(stream, code);
                warn!(
                    stream = %stream,
                    code,
                    error = %e,
                    "⚠️ CONSUMER: Consumer group churn, retrying"
                );
                if !pause(cancel, backoff.first).await {
                    return LoopExit::Cancelled;
                }
            }
            Some(e) if e.is_transient() && transient_failures < ctx.config.max_transient_retries => {
                let delay = backoff.delay(transient_failures);
                transient_failures += 1;
                metrics::record_consumer_error(stream, "transient");
                warn!(
                    stream = %stream,
                    attempt = transient_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "⚠️ CONSUMER: Broker unavailable, backing off"
                );
                if !pause(cancel, delay).await {
                    return LoopExit::Cancelled;
                }
            }
            _ => return LoopExit::Failed(error),
        }
    }
}

async fn process_and_commit(
    ctx: &LoopContext,
    session: &mut dyn ConsumerSession,
    batch: &[Record],
) -> Result<()> {
    let started = Instant::now();
    ctx.processor.process(batch).await?;
    session.commit(&next_offsets(batch)).await?;

    metrics::record_batch(ctx.kind.name(), batch.len(), started.elapsed().as_secs_f64());
    debug!(
        stream = %ctx.kind.name(),
        records = batch.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Batch processed and committed"
    );
    Ok(())
}
