//! Named operations dispatched into the worker pool and the plugin-execution seam.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, ServerError};

/// Operations understood by plugin execution units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolTask {
    RunEventPipeline,
    RunAsyncHandlersEventPipeline,
    RunOnEventHandlers,
    RunWebhooksHandlers,
    RunEveryMinute,
    RunEveryHour,
    RunEveryDay,
    RunPluginJob,
    GetPluginSchedule,
    ReloadPlugins,
    ReloadSchedule,
    ReloadAllActions,
    ReloadAction,
    DropAction,
    ResetAvailableFeaturesCache,
    TeardownPlugins,
    FlushKafkaMessages,
}

impl PoolTask {
    pub const ALL: [PoolTask; 17] = [
        PoolTask::RunEventPipeline,
        PoolTask::RunAsyncHandlersEventPipeline,
        PoolTask::RunOnEventHandlers,
        PoolTask::RunWebhooksHandlers,
        PoolTask::RunEveryMinute,
        PoolTask::RunEveryHour,
        PoolTask::RunEveryDay,
        PoolTask::RunPluginJob,
        PoolTask::GetPluginSchedule,
        PoolTask::ReloadPlugins,
        PoolTask::ReloadSchedule,
        PoolTask::ReloadAllActions,
        PoolTask::ReloadAction,
        PoolTask::DropAction,
        PoolTask::ResetAvailableFeaturesCache,
        PoolTask::TeardownPlugins,
        PoolTask::FlushKafkaMessages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolTask::RunEventPipeline => "runEventPipeline",
            PoolTask::RunAsyncHandlersEventPipeline => "runAsyncHandlersEventPipeline",
            PoolTask::RunOnEventHandlers => "runOnEventHandlers",
            PoolTask::RunWebhooksHandlers => "runWebhooksHandlers",
            PoolTask::RunEveryMinute => "runEveryMinute",
            PoolTask::RunEveryHour => "runEveryHour",
            PoolTask::RunEveryDay => "runEveryDay",
            PoolTask::RunPluginJob => "runPluginJob",
            PoolTask::GetPluginSchedule => "getPluginSchedule",
            PoolTask::ReloadPlugins => "reloadPlugins",
            PoolTask::ReloadSchedule => "reloadSchedule",
            PoolTask::ReloadAllActions => "reloadAllActions",
            PoolTask::ReloadAction => "reloadAction",
            PoolTask::DropAction => "dropAction",
            PoolTask::ResetAvailableFeaturesCache => "resetAvailableFeaturesCache",
            PoolTask::TeardownPlugins => "teardownPlugins",
            PoolTask::FlushKafkaMessages => "flushKafkaMessages",
        }
    }
}

impl fmt::Display for PoolTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolTask {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        PoolTask::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ServerError::WorkerPool(format!("unknown pool task '{s}'")))
    }
}

/// Executes plugin code for one execution unit
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task: PoolTask, args: Value) -> Result<Value>;
}

/// Creates one isolated runner per execution unit
pub trait TaskRunnerFactory: Send + Sync {
    fn create(&self, unit_id: usize) -> Result<Arc<dyn TaskRunner>>;
}

/// Runner that acknowledges every task with `null`.
///
/// Stands in for plugin execution when the server runs without a plugin runtime;
/// `getPluginSchedule` answers with an empty schedule.
#[derive(Debug, Default, Clone)]
pub struct NoopTaskRunner;

#[async_trait]
impl TaskRunner for NoopTaskRunner {
    async fn run(&self, task: PoolTask, _args: Value) -> Result<Value> {
        match task {
            PoolTask::GetPluginSchedule => Ok(serde_json::json!({})),
            _ => Ok(Value::Null),
        }
    }
}

impl TaskRunnerFactory for NoopTaskRunner {
    fn create(&self, _unit_id: usize) -> Result<Arc<dyn TaskRunner>> {
        Ok(Arc::new(NoopTaskRunner))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_names_parse_back() {
        for task in PoolTask::ALL {
            assert_eq!(task.as_str().parse::<PoolTask>().unwrap(), task);
        }
        assert!("runEverySecond".parse::<PoolTask>().is_err());
    }

    #[tokio::test]
    async fn test_noop_runner_returns_empty_schedule() {
        let runner = NoopTaskRunner.create(0).unwrap();
        let schedule = runner
            .run(PoolTask::GetPluginSchedule, Value::Null)
            .await
            .unwrap();
        assert_eq!(schedule, serde_json::json!({}));
        assert_eq!(
            runner.run(PoolTask::ReloadPlugins, Value::Null).await.unwrap(),
            Value::Null
        );
    }
}
