//! # Capability Sets
//!
//! A capability is a named unit of orchestration behavior. The set is chosen once at
//! process start, either from a deployment mode preset or an explicit list, and is
//! never mutated afterwards.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Ingestion,
    IngestionOverflow,
    ProcessAsyncHandlers,
    ProcessAsyncOnEventHandlers,
    ProcessAsyncWebhooksHandlers,
    ProcessPluginJobs,
    PluginScheduledTasks,
    SessionRecordingIngestion,
    SessionRecordingBlobIngestion,
    Http,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::Ingestion,
        Capability::IngestionOverflow,
        Capability::ProcessAsyncHandlers,
        Capability::ProcessAsyncOnEventHandlers,
        Capability::ProcessAsyncWebhooksHandlers,
        Capability::ProcessPluginJobs,
        Capability::PluginScheduledTasks,
        Capability::SessionRecordingIngestion,
        Capability::SessionRecordingBlobIngestion,
        Capability::Http,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Ingestion => "ingestion",
            Capability::IngestionOverflow => "ingestionOverflow",
            Capability::ProcessAsyncHandlers => "processAsyncHandlers",
            Capability::ProcessAsyncOnEventHandlers => "processAsyncOnEventHandlers",
            Capability::ProcessAsyncWebhooksHandlers => "processAsyncWebhooksHandlers",
            Capability::ProcessPluginJobs => "processPluginJobs",
            Capability::PluginScheduledTasks => "pluginScheduledTasks",
            Capability::SessionRecordingIngestion => "sessionRecordingIngestion",
            Capability::SessionRecordingBlobIngestion => "sessionRecordingBlobIngestion",
            Capability::Http => "http",
        }
    }

    /// Whether this capability executes plugin code and therefore needs the worker pool
    pub fn needs_worker_pool(&self) -> bool {
        matches!(
            self,
            Capability::Ingestion
                | Capability::IngestionOverflow
                | Capability::ProcessAsyncHandlers
                | Capability::ProcessAsyncOnEventHandlers
                | Capability::ProcessAsyncWebhooksHandlers
                | Capability::ProcessPluginJobs
                | Capability::PluginScheduledTasks
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ServerError::InvalidCapabilities(format!("unknown capability '{s}'")))
    }
}

/// Pairs that would double-deliver the same event to plugins
const MUTUALLY_EXCLUSIVE: [(Capability, Capability); 2] = [
    (
        Capability::ProcessAsyncHandlers,
        Capability::ProcessAsyncOnEventHandlers,
    ),
    (
        Capability::ProcessAsyncHandlers,
        Capability::ProcessAsyncWebhooksHandlers,
    ),
];

/// Immutable, validated set of enabled capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Build a set, rejecting mutually exclusive combinations
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Result<Self> {
        let set = Self(capabilities.into_iter().collect());
        set.validate()?;
        Ok(set)
    }

    /// Parse a comma-separated list such as `ingestion,http`
    pub fn parse_list(list: &str) -> Result<Self> {
        let capabilities = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Capability::from_str)
            .collect::<Result<Vec<_>>>()?;
        Self::new(capabilities)
    }

    /// Resolve a deployment mode preset. `None` and `all` enable everything a
    /// development instance runs.
    pub fn from_mode(mode: Option<&str>) -> Result<Self> {
        use Capability::*;

        let capabilities: Vec<Capability> = match mode {
            None | Some("all") => vec![
                Ingestion,
                IngestionOverflow,
                PluginScheduledTasks,
                ProcessPluginJobs,
                ProcessAsyncOnEventHandlers,
                ProcessAsyncWebhooksHandlers,
                SessionRecordingIngestion,
                SessionRecordingBlobIngestion,
                Http,
            ],
            Some("ingestion") => vec![Ingestion, Http],
            Some("ingestion-overflow") => vec![IngestionOverflow, Http],
            Some("async") => vec![
                ProcessPluginJobs,
                ProcessAsyncHandlers,
                PluginScheduledTasks,
                Http,
            ],
            Some("async-onevent") => vec![ProcessAsyncOnEventHandlers, Http],
            Some("async-webhooks") => vec![ProcessAsyncWebhooksHandlers, Http],
            Some("jobs") => vec![ProcessPluginJobs, Http],
            Some("scheduler") => vec![PluginScheduledTasks, Http],
            Some("recordings-ingestion") => vec![SessionRecordingIngestion, Http],
            Some("recordings-blob-ingestion") => vec![SessionRecordingBlobIngestion, Http],
            Some(other) => {
                return Err(ServerError::InvalidCapabilities(format!(
                    "unknown server mode '{other}'"
                )))
            }
        };

        Self::new(capabilities)
    }

    pub fn validate(&self) -> Result<()> {
        for (a, b) in MUTUALLY_EXCLUSIVE {
            if self.contains(a) && self.contains(b) {
                return Err(ServerError::InvalidCapabilities(format!(
                    "{a} and {b} cannot be enabled together"
                )));
            }
        }
        Ok(())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn needs_worker_pool(&self) -> bool {
        self.iter().any(|c| c.needs_worker_pool())
    }

    /// Any capability that runs action-matching handlers
    pub fn has_async_handlers(&self) -> bool {
        self.contains(Capability::ProcessAsyncHandlers)
            || self.contains(Capability::ProcessAsyncOnEventHandlers)
            || self.contains(Capability::ProcessAsyncWebhooksHandlers)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(|c| c.as_str()).collect();
        write!(f, "{}", names.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_list() {
        let set = CapabilitySet::parse_list("ingestion, http").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains(Capability::Ingestion));
        assert!(set.contains(Capability::Http));
        assert!(set.needs_worker_pool());
    }

    #[test]
    fn test_unknown_capability_rejected() {
        let err = CapabilitySet::parse_list("ingestion,mmdb").unwrap_err();
        assert!(err.to_string().contains("mmdb"));
    }

    #[test]
    fn test_async_handler_exclusions() {
        assert!(CapabilitySet::parse_list("processAsyncHandlers,processAsyncOnEventHandlers").is_err());
        assert!(CapabilitySet::parse_list("processAsyncHandlers,processAsyncWebhooksHandlers").is_err());
        assert!(CapabilitySet::parse_list(
            "processAsyncOnEventHandlers,processAsyncWebhooksHandlers"
        )
        .is_ok());
    }

    #[test]
    fn test_mode_presets() {
        let recordings = CapabilitySet::from_mode(Some("recordings-blob-ingestion")).unwrap();
        assert!(recordings.contains(Capability::SessionRecordingBlobIngestion));
        assert!(!recordings.needs_worker_pool());

        let all = CapabilitySet::from_mode(None).unwrap();
        assert!(all.contains(Capability::Ingestion));
        assert!(!all.contains(Capability::ProcessAsyncHandlers));

        assert!(CapabilitySet::from_mode(Some("analytics")).is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let set = CapabilitySet::from_mode(Some("async")).unwrap();
        let reparsed = CapabilitySet::parse_list(&set.to_string()).unwrap();
        assert_eq!(set, reparsed);
    }

    proptest! {
        #[test]
        fn prop_valid_sets_never_contain_exclusive_pairs(mask in 0u16..1024) {
            let chosen: Vec<Capability> = Capability::ALL
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, c)| *c)
                .collect();

            let has_conflict = chosen.contains(&Capability::ProcessAsyncHandlers)
                && (chosen.contains(&Capability::ProcessAsyncOnEventHandlers)
                    || chosen.contains(&Capability::ProcessAsyncWebhooksHandlers));

            prop_assert_eq!(CapabilitySet::new(chosen).is_err(), has_conflict);
        }
    }
}
