//! # Constants
//!
//! Topic, consumer group and channel names shared with external producers and
//! publishers. Changing any of these is a wire-level change.

/// Broker topics
pub mod topics {
    pub const EVENTS_PLUGIN_INGESTION: &str = "events_plugin_ingestion";
    pub const EVENTS_PLUGIN_INGESTION_OVERFLOW: &str = "events_plugin_ingestion_overflow";
    pub const CLICKHOUSE_EVENTS_JSON: &str = "clickhouse_events_json";
    pub const JOBS: &str = "jobs";
    pub const SCHEDULED_TASKS: &str = "scheduled_tasks";
    pub const SESSION_RECORDING_EVENTS: &str = "session_recording_events";
    pub const SESSION_RECORDING_SNAPSHOT_ITEM_EVENTS: &str =
        "session_recording_snapshot_item_events";
    /// Sink for validated session recording events
    pub const CLICKHOUSE_SESSION_RECORDING_EVENTS: &str = "clickhouse_session_recording_events";
}

/// Consumer group ids
pub mod groups {
    pub const INGESTION: &str = "clickhouse-ingestion";
    pub const INGESTION_OVERFLOW: &str = "clickhouse-ingestion-overflow";
    pub const ASYNC_HANDLERS: &str = "clickhouse-plugin-server-async";
    pub const ASYNC_ON_EVENT: &str = "clickhouse-plugin-server-async-onevent";
    pub const ASYNC_WEBHOOKS: &str = "clickhouse-plugin-server-async-webhooks";
    pub const JOBS: &str = "jobs-inserter";
    pub const SCHEDULED_TASKS: &str = "scheduled-tasks-runner";
    pub const SESSION_RECORDINGS: &str = "session-recordings";
    pub const SESSION_RECORDINGS_BLOB: &str = "session-recordings-blob";
}

/// Pub/sub channels this server subscribes to
pub mod channels {
    pub const RELOAD_PLUGINS: &str = "reload-plugins";
    pub const RESET_AVAILABLE_FEATURES_CACHE: &str = "reset-available-features-cache";
    pub const RELOAD_ACTION: &str = "reload-action";
    pub const DROP_ACTION: &str = "drop-action";
}

/// Health registry service names
pub mod services {
    pub const ANALYTICS_INGESTION: &str = "analytics-ingestion";
    pub const ANALYTICS_INGESTION_OVERFLOW: &str = "analytics-ingestion-overflow";
    pub const ASYNC_HANDLERS: &str = "async-handlers";
    pub const ON_EVENT_INGESTION: &str = "on-event-ingestion";
    pub const WEBHOOKS_INGESTION: &str = "webhooks-ingestion";
    pub const JOBS_CONSUMER: &str = "jobs-consumer";
    pub const SCHEDULED_TASKS_CONSUMER: &str = "scheduled-tasks-consumer";
    pub const SESSION_RECORDINGS: &str = "session-recordings";
    pub const SESSION_RECORDINGS_BLOB: &str = "session-recordings-blob";
    pub const JOB_QUEUE: &str = "job-queue";
}
