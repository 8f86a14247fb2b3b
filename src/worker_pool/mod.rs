//! # Worker Pool
//!
//! A fixed set of isolated execution units that run plugin code. Each unit owns its
//! own [`TaskRunner`] and processes two kinds of message:
//!
//! - **Submitted tasks** go to the least-loaded unit and run concurrently up to
//!   `tasks_per_worker` per unit. The caller gets that one unit's result.
//! - **Broadcast tasks** go to every unit. The call resolves once all units have
//!   acknowledged, which makes it a barrier. Broadcasts are serialized, so two
//!   broadcasts issued back to back produce two barriers in issue order.
//!
//! `shutdown` runs `teardownPlugins` (bounded by `teardown_timeout_ms`) and then
//! `flushKafkaMessages` (bounded by `flush_timeout_ms`) on every unit before the units
//! are stopped. Timeouts in either step are logged and shutdown continues.

pub mod tasks;

use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::error::{Result, ServerError};
use crate::lifecycle::contain;
use crate::metrics;

pub use tasks::{NoopTaskRunner, PoolTask, TaskRunner, TaskRunnerFactory};

type Reply = oneshot::Sender<Result<Value>>;

enum UnitMessage {
    Submit {
        task: PoolTask,
        args: Value,
        reply: Reply,
    },
    Broadcast {
        task: PoolTask,
        args: Value,
        reply: Reply,
    },
}

struct UnitHandle {
    id: usize,
    sender: parking_lot::Mutex<Option<mpsc::UnboundedSender<UnitMessage>>>,
    in_flight: Arc<AtomicUsize>,
    slots: Arc<Semaphore>,
    join: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl UnitHandle {
    fn send(&self, message: UnitMessage) -> Result<()> {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .send(message)
                .map_err(|_| ServerError::WorkerPool(format!("unit {} has stopped", self.id))),
            None => Err(ServerError::WorkerPool(format!(
                "unit {} has been shut down",
                self.id
            ))),
        }
    }
}

/// Decrements the unit's in-flight count even when the task panics
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Point-in-time view of pool load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub units: usize,
    pub in_flight: usize,
    pub closed: bool,
}

pub struct WorkerPool {
    units: Vec<UnitHandle>,
    config: WorkerPoolConfig,
    broadcast_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("units", &self.units.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl WorkerPool {
    /// Start `config.concurrency` units, each with a runner from `factory`
    pub fn new(config: WorkerPoolConfig, factory: &dyn TaskRunnerFactory) -> Result<Self> {
        if config.concurrency == 0 || config.tasks_per_worker == 0 {
            return Err(ServerError::Configuration(
                "worker pool needs at least one unit and one task slot".to_string(),
            ));
        }

        let mut units = Vec::with_capacity(config.concurrency);
        for id in 0..config.concurrency {
            let runner = factory.create(id)?;
            let (sender, receiver) = mpsc::unbounded_channel();
            let in_flight = Arc::new(AtomicUsize::new(0));
            let slots = Arc::new(Semaphore::new(config.tasks_per_worker));

            let join = tokio::spawn(unit_loop(id, runner, receiver, slots.clone()));

            units.push(UnitHandle {
                id,
                sender: parking_lot::Mutex::new(Some(sender)),
                in_flight,
                slots,
                join: parking_lot::Mutex::new(Some(join)),
            });
        }

        info!(
            "🚀 POOL: Started {} execution units with {} task slots each",
            config.concurrency, config.tasks_per_worker
        );

        Ok(Self {
            units,
            config,
            broadcast_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.units.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            units: self.units.len(),
            in_flight: self
                .units
                .iter()
                .map(|u| u.in_flight.load(Ordering::Acquire))
                .sum(),
            closed: self.is_closed(),
        }
    }

    /// Run `task` on one unit and return its result
    pub async fn submit_task(&self, task: PoolTask, args: Value) -> Result<Value> {
        if self.is_closed() {
            metrics::record_pool_task(task.as_str(), "rejected");
            return Err(ServerError::WorkerPool(format!(
                "cannot submit {task}: pool is shut down"
            )));
        }

        let unit = self.least_loaded();
        unit.in_flight.fetch_add(1, Ordering::AcqRel);
        let _in_flight = InFlightGuard(unit.in_flight.clone());
        let (reply, result) = oneshot::channel();

        if let Err(e) = unit.send(UnitMessage::Submit { task, args, reply }) {
            metrics::record_pool_task(task.as_str(), "rejected");
            return Err(e);
        }

        let timeout = self.config.task_timeout();
        let outcome = match tokio::time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServerError::TaskFailed {
                task: task.to_string(),
                message: format!("unit {} dropped the task", unit.id),
            }),
            Err(_) => Err(ServerError::timeout(format!("task {task}"), timeout)),
        };

        metrics::record_pool_task(
            task.as_str(),
            if outcome.is_ok() { "success" } else { "failure" },
        );
        outcome
    }

    /// Run `task` on every unit and wait for all of them to acknowledge
    pub async fn broadcast_task(
        &self,
        task: PoolTask,
        args: Value,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        if self.is_closed() {
            return Err(ServerError::WorkerPool(format!(
                "cannot broadcast {task}: pool is shut down"
            )));
        }
        self.broadcast_inner(task, args, timeout).await
    }

    /// Broadcast with the configured default barrier timeout
    pub async fn broadcast(&self, task: PoolTask, args: Value) -> Result<Vec<Value>> {
        self.broadcast_task(task, args, self.config.broadcast_timeout())
            .await
    }

    async fn broadcast_inner(
        &self,
        task: PoolTask,
        args: Value,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let _barrier = self.broadcast_lock.lock().await;
        let started = Instant::now();
        debug!(task = %task, units = self.units.len(), "Broadcasting to all units");

        let mut pending = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let (reply, result) = oneshot::channel();
            unit.send(UnitMessage::Broadcast {
                task,
                args: args.clone(),
                reply,
            })?;
            pending.push(result);
        }

        let acknowledgements = tokio::time::timeout(timeout, join_all(pending))
            .await
            .map_err(|_| ServerError::timeout(format!("broadcast {task}"), timeout))?;

        metrics::record_broadcast(task.as_str(), started.elapsed().as_secs_f64());

        acknowledgements
            .into_iter()
            .enumerate()
            .map(|(id, ack)| match ack {
                Ok(result) => result,
                Err(_) => Err(ServerError::TaskFailed {
                    task: task.to_string(),
                    message: format!("unit {id} stopped before acknowledging"),
                }),
            })
            .collect()
    }

    /// Wait until no submitted task is running on any unit
    pub async fn drain(&self) {
        let slots = self.config.tasks_per_worker as u32;
        for unit in &self.units {
            // Holding every slot means nothing else is running on this unit
            if let Ok(permits) = unit.slots.acquire_many(slots).await {
                drop(permits);
            }
        }
    }

    /// Tear down plugins, flush producers and stop every unit. Idempotent.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("🛑 POOL: Shutting down {} execution units", self.units.len());

        if let Err(e) = self
            .broadcast_inner(
                PoolTask::TeardownPlugins,
                Value::Null,
                self.config.teardown_timeout(),
            )
            .await
        {
            warn!(error = %e, "⚠️ POOL: Plugin teardown did not complete");
        }

        if let Err(e) = self
            .broadcast_inner(
                PoolTask::FlushKafkaMessages,
                Value::Null,
                self.config.flush_timeout(),
            )
            .await
        {
            warn!(error = %e, "⚠️ POOL: Producer flush did not complete");
        }

        if tokio::time::timeout(self.config.task_timeout(), self.drain())
            .await
            .is_err()
        {
            warn!("⚠️ POOL: In-flight tasks still running at shutdown");
        }

        for unit in &self.units {
            unit.sender.lock().take();
        }
        let joins: Vec<JoinHandle<()>> = self
            .units
            .iter()
            .filter_map(|unit| unit.join.lock().take())
            .collect();
        for (id, result) in join_all(joins).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!(unit = id, error = %e, "❌ POOL: Unit terminated abnormally");
            }
        }

        info!("✅ POOL: All execution units stopped");
    }

    fn least_loaded(&self) -> &UnitHandle {
        // units is never empty, new() rejects concurrency == 0
        let mut best = &self.units[0];
        let mut best_load = best.in_flight.load(Ordering::Acquire);
        for unit in &self.units[1..] {
            let load = unit.in_flight.load(Ordering::Acquire);
            if load < best_load {
                best = unit;
                best_load = load;
            }
        }
        best
    }
}

async fn unit_loop(
    id: usize,
    runner: Arc<dyn TaskRunner>,
    mut receiver: mpsc::UnboundedReceiver<UnitMessage>,
    slots: Arc<Semaphore>,
) {
    debug!(unit = id, "Execution unit started");

    while let Some(message) = receiver.recv().await {
        match message {
            UnitMessage::Submit { task, args, reply } => {
                let permit = match slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let runner = runner.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = run_guarded(id, runner.as_ref(), task, args).await;
                    let _ = reply.send(result);
                });
            }
            UnitMessage::Broadcast { task, args, reply } => {
                let result = run_guarded(id, runner.as_ref(), task, args).await;
                let _ = reply.send(result);
            }
        }
    }

    debug!(unit = id, "Execution unit stopped");
}

async fn run_guarded(
    id: usize,
    runner: &dyn TaskRunner,
    task: PoolTask,
    args: Value,
) -> Result<Value> {
    match contain(runner.run(task, args)).await {
        Ok(result) => result,
        Err(_) => {
            error!(unit = id, task = %task, "❌ POOL: Task panicked");
            Err(ServerError::TaskFailed {
                task: task.to_string(),
                message: format!("panicked on unit {id}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(usize, PoolTask)>>,
        delay: Duration,
    }

    struct RecordingRunner {
        id: usize,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn run(&self, task: PoolTask, args: Value) -> Result<Value> {
            if !self.recorder.delay.is_zero() {
                tokio::time::sleep(self.recorder.delay).await;
            }
            self.recorder.calls.lock().push((self.id, task));
            if args == Value::String("fail".into()) {
                return Err(ServerError::TaskFailed {
                    task: task.to_string(),
                    message: "requested".into(),
                });
            }
            if args == Value::String("panic".into()) {
                panic!("plugin blew up");
            }
            Ok(serde_json::json!({ "unit": self.id }))
        }
    }

    struct RecordingFactory(Arc<Recorder>);

    impl TaskRunnerFactory for RecordingFactory {
        fn create(&self, unit_id: usize) -> Result<Arc<dyn TaskRunner>> {
            Ok(Arc::new(RecordingRunner {
                id: unit_id,
                recorder: self.0.clone(),
            }))
        }
    }

    fn config(concurrency: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            concurrency,
            tasks_per_worker: 2,
            task_timeout_ms: 2_000,
            broadcast_timeout_ms: 2_000,
            teardown_timeout_ms: 500,
            flush_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_unit() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(config(3), &RecordingFactory(recorder.clone())).unwrap();

        let acks = pool.broadcast(PoolTask::ReloadPlugins, Value::Null).await.unwrap();
        assert_eq!(acks.len(), 3);

        let mut units: Vec<usize> = recorder.calls.lock().iter().map(|(u, _)| *u).collect();
        units.sort();
        assert_eq!(units, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_submit_returns_runner_result_and_errors() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(config(2), &RecordingFactory(recorder)).unwrap();

        let result = pool
            .submit_task(PoolTask::RunEventPipeline, Value::Null)
            .await
            .unwrap();
        assert!(result.get("unit").is_some());

        let err = pool
            .submit_task(PoolTask::RunEventPipeline, Value::String("fail".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::TaskFailed { .. }));
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_unit() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(config(1), &RecordingFactory(recorder)).unwrap();

        let err = pool
            .broadcast(PoolTask::ReloadPlugins, Value::String("panic".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("panicked"));

        assert!(pool
            .submit_task(PoolTask::RunEveryMinute, Value::Null)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_least_loaded_unit_is_chosen() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(config(2), &RecordingFactory(recorder.clone())).unwrap();

        pool.units[0].in_flight.fetch_add(1, Ordering::AcqRel);
        pool.submit_task(PoolTask::RunPluginJob, Value::Null)
            .await
            .unwrap();
        assert_eq!(recorder.calls.lock()[0], (1, PoolTask::RunPluginJob));
    }

    #[tokio::test]
    async fn test_broadcast_times_out() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(300),
            ..Default::default()
        });
        let pool = WorkerPool::new(config(1), &RecordingFactory(recorder)).unwrap();

        let err = pool
            .broadcast_task(PoolTask::ReloadSchedule, Value::Null, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_then_flushes_and_rejects_new_work() {
        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(config(2), &RecordingFactory(recorder.clone())).unwrap();

        pool.shutdown().await;
        pool.shutdown().await;

        let calls = recorder.calls.lock().clone();
        let tasks: Vec<PoolTask> = calls.iter().map(|(_, t)| *t).collect();
        assert_eq!(
            tasks,
            vec![
                PoolTask::TeardownPlugins,
                PoolTask::TeardownPlugins,
                PoolTask::FlushKafkaMessages,
                PoolTask::FlushKafkaMessages
            ]
        );
        assert!(pool.is_closed());
        assert!(pool
            .submit_task(PoolTask::RunEventPipeline, Value::Null)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_tasks() {
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let pool = Arc::new(WorkerPool::new(config(1), &RecordingFactory(recorder.clone())).unwrap());

        let submitter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.submit_task(PoolTask::RunPluginJob, Value::Null).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.drain().await;
        assert_eq!(recorder.calls.lock().len(), 1);
        assert!(submitter.await.unwrap().is_ok());
    }
}
