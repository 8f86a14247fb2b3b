//! Server metrics.
//!
//! Named counters, histograms and gauges emitted through the `metrics` facade. The
//! exporter is installed by whoever embeds the server; without one these are no-ops.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// ============================================================================
// Consumer Metrics
// ============================================================================

/// Batches processed and committed, labelled by stream.
pub const CONSUMER_BATCHES: &str = "ingestion_consumer_batches_total";

/// Records processed, labelled by stream.
pub const CONSUMER_RECORDS: &str = "ingestion_consumer_records_total";

/// Batch processing duration, labelled by stream.
pub const CONSUMER_BATCH_DURATION: &str = "ingestion_consumer_batch_duration_seconds";

/// Ignorable broker protocol errors, labelled by stream and code.
pub const CONSUMER_IGNORABLE_ERRORS: &str = "ingestion_consumer_ignorable_errors_total";

/// Errors that moved a consumer to errored or forced a retry, labelled by stream and kind.
pub const CONSUMER_ERRORS: &str = "ingestion_consumer_errors_total";

// ============================================================================
// Worker Pool Metrics
// ============================================================================

/// Tasks submitted to the pool, labelled by task and outcome.
pub const POOL_TASKS: &str = "ingestion_pool_tasks_total";

/// Broadcast barrier duration, labelled by task.
pub const POOL_BROADCAST_DURATION: &str = "ingestion_pool_broadcast_duration_seconds";

// ============================================================================
// Job Queue Metrics
// ============================================================================

pub const JOBS_ENQUEUED: &str = "ingestion_jobs_enqueued_total";
pub const JOBS_EXECUTED: &str = "ingestion_jobs_executed_total";
pub const JOBS_FAILED: &str = "ingestion_jobs_failed_total";
pub const JOBS_POLL_ERRORS: &str = "ingestion_jobs_poll_errors_total";

// ============================================================================
// Reload / Schedule / Lifecycle Metrics
// ============================================================================

/// Pub/sub messages handled, labelled by channel.
pub const RELOAD_MESSAGES: &str = "ingestion_reload_messages_total";

pub const SCHEDULE_RELOADS: &str = "ingestion_schedule_reloads_total";

/// Scheduled task records produced, labelled by trigger.
pub const SCHEDULED_TASKS_TRIGGERED: &str = "ingestion_scheduled_tasks_triggered_total";

pub const RUNTIME_LAG: &str = "ingestion_runtime_lag_seconds";

pub const SHUTDOWN_DURATION: &str = "ingestion_shutdown_duration_seconds";

/// Faults captured by the error reporter, labelled by context.
pub const FAULTS_CAPTURED: &str = "ingestion_faults_captured_total";

pub const CONSUMERS_RUNNING: &str = "ingestion_consumers_running";

/// Registers all metric descriptions.
///
/// Call once at startup after the recorder is installed.
pub fn register_metrics() {
    describe_counter!(CONSUMER_BATCHES, "Batches processed and committed");
    describe_counter!(CONSUMER_RECORDS, "Records processed");
    describe_histogram!(CONSUMER_BATCH_DURATION, "Batch processing duration in seconds");
    describe_counter!(
        CONSUMER_IGNORABLE_ERRORS,
        "Consumer-group churn errors that were retried"
    );
    describe_counter!(CONSUMER_ERRORS, "Consumer errors by kind");
    describe_counter!(POOL_TASKS, "Worker pool tasks by outcome");
    describe_histogram!(POOL_BROADCAST_DURATION, "Broadcast barrier duration in seconds");
    describe_counter!(JOBS_ENQUEUED, "Jobs written to the durable queue");
    describe_counter!(JOBS_EXECUTED, "Jobs executed successfully");
    describe_counter!(JOBS_FAILED, "Job executions that failed");
    describe_counter!(JOBS_POLL_ERRORS, "Job queue polls that hit a store error");
    describe_counter!(RELOAD_MESSAGES, "Reload bus messages handled");
    describe_counter!(SCHEDULE_RELOADS, "Job schedule replacements");
    describe_counter!(SCHEDULED_TASKS_TRIGGERED, "Scheduled task records produced");
    describe_histogram!(RUNTIME_LAG, "Runtime scheduling lag in seconds");
    describe_histogram!(SHUTDOWN_DURATION, "Shutdown sequence duration in seconds");
    describe_counter!(FAULTS_CAPTURED, "Faults reported to error tracking");
    describe_gauge!(CONSUMERS_RUNNING, "Consumer groups currently running");
}

pub fn record_batch(stream: &'static str, records: usize, duration_secs: f64) {
    counter!(CONSUMER_BATCHES, "stream" => stream).increment(1);
    counter!(CONSUMER_RECORDS, "stream" => stream).increment(records as u64);
    histogram!(CONSUMER_BATCH_DURATION, "stream" => stream).record(duration_secs);
}

pub fn record_ignorable_error(stream: &'static str, code: i16) {
    counter!(CONSUMER_IGNORABLE_ERRORS, "stream" => stream, "code" => code.to_string())
        .increment(1);
}

pub fn record_consumer_error(stream: &'static str, kind: &'static str) {
    counter!(CONSUMER_ERRORS, "stream" => stream, "kind" => kind).increment(1);
}

pub fn record_pool_task(task: &'static str, outcome: &'static str) {
    counter!(POOL_TASKS, "task" => task, "outcome" => outcome).increment(1);
}

pub fn record_broadcast(task: &'static str, duration_secs: f64) {
    histogram!(POOL_BROADCAST_DURATION, "task" => task).record(duration_secs);
}

pub fn record_reload_message(channel: &str) {
    counter!(RELOAD_MESSAGES, "channel" => channel.to_string()).increment(1);
}

pub fn record_consumers_running(delta: f64) {
    gauge!(CONSUMERS_RUNNING).increment(delta);
}
