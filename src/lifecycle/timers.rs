//! Interval timers owned by the orchestrator, plus the runtime lag sampler.

use futures::future::BoxFuture;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::RUNTIME_LAG;

/// Named interval tasks cancelled together during shutdown
#[derive(Default)]
pub struct Timers {
    cancel: CancellationToken,
    handles: parking_lot::Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, starting one period from now. A failing tick is
    /// logged and the timer keeps going.
    pub fn spawn_interval<F>(&self, name: &'static str, period: Duration, tick: F)
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = tick().await {
                            warn!(timer = name, error = %e, "⚠️ TIMER: Tick failed");
                        }
                    }
                }
            }
            debug!(timer = name, "Timer stopped");
        });
        self.handles.lock().push((name, handle));
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.handles.lock().iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Cancel every timer and wait for any tick in progress to finish
    pub async fn cancel_all(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                warn!(timer = name, error = %e, "⚠️ TIMER: Timer task failed");
            }
        }
    }
}

/// Samples how late the runtime wakes a sleeping task
pub struct LagSampler {
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl LagSampler {
    pub fn start(interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let started = Instant::now();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let lag = started.elapsed().saturating_sub(interval);
                        metrics::histogram!(RUNTIME_LAG).record(lag.as_secs_f64());
                    }
                }
            }
        });
        Self {
            cancel,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
