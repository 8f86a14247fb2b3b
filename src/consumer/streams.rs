//! Catalogue of the streams this server can consume.

use crate::config::Capability;
use crate::constants::{groups, services, topics};
use crate::worker_pool::PoolTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    AnalyticsIngestion,
    OverflowIngestion,
    AsyncHandlers,
    OnEvent,
    Webhooks,
    Jobs,
    ScheduledTasks,
    SessionRecordings,
    SessionRecordingsBlob,
}

impl StreamKind {
    pub const ALL: [StreamKind; 9] = [
        StreamKind::AnalyticsIngestion,
        StreamKind::OverflowIngestion,
        StreamKind::AsyncHandlers,
        StreamKind::OnEvent,
        StreamKind::Webhooks,
        StreamKind::Jobs,
        StreamKind::ScheduledTasks,
        StreamKind::SessionRecordings,
        StreamKind::SessionRecordingsBlob,
    ];

    /// Label used in logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            StreamKind::AnalyticsIngestion => "analytics-ingestion",
            StreamKind::OverflowIngestion => "overflow-ingestion",
            StreamKind::AsyncHandlers => "async-handlers",
            StreamKind::OnEvent => "on-event",
            StreamKind::Webhooks => "webhooks",
            StreamKind::Jobs => "jobs",
            StreamKind::ScheduledTasks => "scheduled-tasks",
            StreamKind::SessionRecordings => "session-recordings",
            StreamKind::SessionRecordingsBlob => "session-recordings-blob",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            StreamKind::AnalyticsIngestion => Capability::Ingestion,
            StreamKind::OverflowIngestion => Capability::IngestionOverflow,
            StreamKind::AsyncHandlers => Capability::ProcessAsyncHandlers,
            StreamKind::OnEvent => Capability::ProcessAsyncOnEventHandlers,
            StreamKind::Webhooks => Capability::ProcessAsyncWebhooksHandlers,
            StreamKind::Jobs => Capability::ProcessPluginJobs,
            StreamKind::ScheduledTasks => Capability::PluginScheduledTasks,
            StreamKind::SessionRecordings => Capability::SessionRecordingIngestion,
            StreamKind::SessionRecordingsBlob => Capability::SessionRecordingBlobIngestion,
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            StreamKind::AnalyticsIngestion => topics::EVENTS_PLUGIN_INGESTION,
            StreamKind::OverflowIngestion => topics::EVENTS_PLUGIN_INGESTION_OVERFLOW,
            StreamKind::AsyncHandlers | StreamKind::OnEvent | StreamKind::Webhooks => {
                topics::CLICKHOUSE_EVENTS_JSON
            }
            StreamKind::Jobs => topics::JOBS,
            StreamKind::ScheduledTasks => topics::SCHEDULED_TASKS,
            StreamKind::SessionRecordings => topics::SESSION_RECORDING_EVENTS,
            StreamKind::SessionRecordingsBlob => topics::SESSION_RECORDING_SNAPSHOT_ITEM_EVENTS,
        }
    }

    pub fn group_id(&self) -> &'static str {
        match self {
            StreamKind::AnalyticsIngestion => groups::INGESTION,
            StreamKind::OverflowIngestion => groups::INGESTION_OVERFLOW,
            StreamKind::AsyncHandlers => groups::ASYNC_HANDLERS,
            StreamKind::OnEvent => groups::ASYNC_ON_EVENT,
            StreamKind::Webhooks => groups::ASYNC_WEBHOOKS,
            StreamKind::Jobs => groups::JOBS,
            StreamKind::ScheduledTasks => groups::SCHEDULED_TASKS,
            StreamKind::SessionRecordings => groups::SESSION_RECORDINGS,
            StreamKind::SessionRecordingsBlob => groups::SESSION_RECORDINGS_BLOB,
        }
    }

    /// Name registered with the health registry
    pub fn health_name(&self) -> &'static str {
        match self {
            StreamKind::AnalyticsIngestion => services::ANALYTICS_INGESTION,
            StreamKind::OverflowIngestion => services::ANALYTICS_INGESTION_OVERFLOW,
            StreamKind::AsyncHandlers => services::ASYNC_HANDLERS,
            StreamKind::OnEvent => services::ON_EVENT_INGESTION,
            StreamKind::Webhooks => services::WEBHOOKS_INGESTION,
            StreamKind::Jobs => services::JOBS_CONSUMER,
            StreamKind::ScheduledTasks => services::SCHEDULED_TASKS_CONSUMER,
            StreamKind::SessionRecordings => services::SESSION_RECORDINGS,
            StreamKind::SessionRecordingsBlob => services::SESSION_RECORDINGS_BLOB,
        }
    }

    /// Pool task each record is dispatched to, for streams processed by the pool
    pub fn pool_task(&self) -> Option<PoolTask> {
        match self {
            StreamKind::AnalyticsIngestion | StreamKind::OverflowIngestion => {
                Some(PoolTask::RunEventPipeline)
            }
            StreamKind::AsyncHandlers => Some(PoolTask::RunAsyncHandlersEventPipeline),
            StreamKind::OnEvent => Some(PoolTask::RunOnEventHandlers),
            StreamKind::Webhooks => Some(PoolTask::RunWebhooksHandlers),
            _ => None,
        }
    }

    /// A primary stream ending takes the whole process down with it
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            StreamKind::SessionRecordings | StreamKind::SessionRecordingsBlob
        )
    }

    pub fn for_capability(capability: Capability) -> Option<StreamKind> {
        StreamKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.capability() == capability)
    }
}
