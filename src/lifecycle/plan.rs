//! Startup plan: which steps run for a capability set, in what order, and what each
//! step needs to exist before it starts.

use std::fmt;

use crate::config::{Capability, CapabilitySet};
use crate::consumer::StreamKind;

/// Shared resources a step depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Requirements {
    pub hub: bool,
    pub pool: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartupStep {
    Jobs,
    ScheduledTasks,
    Ingestion,
    IngestionOverflow,
    AsyncHandlers,
    AsyncOnEvent,
    AsyncWebhooks,
    ReloadBus,
    SessionRecordings,
    SessionRecordingsBlob,
    Http,
}

/// Order in which enabled steps are started
pub const STARTUP_ORDER: [StartupStep; 11] = [
    StartupStep::Jobs,
    StartupStep::ScheduledTasks,
    StartupStep::Ingestion,
    StartupStep::IngestionOverflow,
    StartupStep::AsyncHandlers,
    StartupStep::AsyncOnEvent,
    StartupStep::AsyncWebhooks,
    StartupStep::ReloadBus,
    StartupStep::SessionRecordings,
    StartupStep::SessionRecordingsBlob,
    StartupStep::Http,
];

impl StartupStep {
    pub fn name(&self) -> &'static str {
        match self {
            StartupStep::Jobs => "jobs",
            StartupStep::ScheduledTasks => "scheduled-tasks",
            StartupStep::Ingestion => "ingestion",
            StartupStep::IngestionOverflow => "ingestion-overflow",
            StartupStep::AsyncHandlers => "async-handlers",
            StartupStep::AsyncOnEvent => "async-onevent",
            StartupStep::AsyncWebhooks => "async-webhooks",
            StartupStep::ReloadBus => "reload-bus",
            StartupStep::SessionRecordings => "session-recordings",
            StartupStep::SessionRecordingsBlob => "session-recordings-blob",
            StartupStep::Http => "http",
        }
    }

    fn capability(&self) -> Option<Capability> {
        match self {
            StartupStep::Jobs => Some(Capability::ProcessPluginJobs),
            StartupStep::ScheduledTasks => Some(Capability::PluginScheduledTasks),
            StartupStep::Ingestion => Some(Capability::Ingestion),
            StartupStep::IngestionOverflow => Some(Capability::IngestionOverflow),
            StartupStep::AsyncHandlers => Some(Capability::ProcessAsyncHandlers),
            StartupStep::AsyncOnEvent => Some(Capability::ProcessAsyncOnEventHandlers),
            StartupStep::AsyncWebhooks => Some(Capability::ProcessAsyncWebhooksHandlers),
            StartupStep::ReloadBus => None,
            StartupStep::SessionRecordings => Some(Capability::SessionRecordingIngestion),
            StartupStep::SessionRecordingsBlob => {
                Some(Capability::SessionRecordingBlobIngestion)
            }
            StartupStep::Http => Some(Capability::Http),
        }
    }

    /// The reload bus is wired whenever something runs plugin code
    pub fn enabled(&self, capabilities: &CapabilitySet) -> bool {
        match self.capability() {
            Some(capability) => capabilities.contains(capability),
            None => capabilities.needs_worker_pool(),
        }
    }

    pub fn requirements(&self) -> Requirements {
        match self {
            StartupStep::Http => Requirements::default(),
            StartupStep::SessionRecordings | StartupStep::SessionRecordingsBlob => Requirements {
                hub: true,
                pool: false,
            },
            _ => Requirements {
                hub: true,
                pool: true,
            },
        }
    }

    /// Consumer stream this step starts, if any
    pub fn stream(&self) -> Option<StreamKind> {
        self.capability().and_then(StreamKind::for_capability)
    }
}

impl fmt::Display for StartupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Enabled steps for `capabilities`, in startup order
pub fn startup_plan(capabilities: &CapabilitySet) -> Vec<StartupStep> {
    STARTUP_ORDER
        .iter()
        .copied()
        .filter(|step| step.enabled(capabilities))
        .collect()
}
