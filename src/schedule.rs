//! # Plugin Schedules
//!
//! The job schedule maps each trigger (`runEveryMinute`, `runEveryHour`,
//! `runEveryDay`) to the plugin config ids that asked for it. It is read from the
//! worker pool, kept on the [`Hub`], and replaced wholesale on every reload.
//!
//! The [`Scheduler`] is the producer side: once per wall-clock minute it writes a
//! `{taskType, pluginConfigId}` record to `scheduled_tasks` for every due trigger.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::constants::topics;
use crate::error::{Result, ServerError};
use crate::hub::Hub;
use crate::metrics::{SCHEDULED_TASKS_TRIGGERED, SCHEDULE_RELOADS};
use crate::worker_pool::{PoolTask, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScheduleTrigger {
    EveryMinute,
    EveryHour,
    EveryDay,
}

impl ScheduleTrigger {
    pub const ALL: [ScheduleTrigger; 3] = [
        ScheduleTrigger::EveryMinute,
        ScheduleTrigger::EveryHour,
        ScheduleTrigger::EveryDay,
    ];

    pub fn as_str(&self) -> &'static str {
        self.pool_task().as_str()
    }

    pub fn pool_task(&self) -> PoolTask {
        match self {
            ScheduleTrigger::EveryMinute => PoolTask::RunEveryMinute,
            ScheduleTrigger::EveryHour => PoolTask::RunEveryHour,
            ScheduleTrigger::EveryDay => PoolTask::RunEveryDay,
        }
    }

    /// Triggers that fire in the wall-clock minute containing `now`
    pub fn due_at(now: DateTime<Utc>) -> Vec<ScheduleTrigger> {
        let mut due = vec![ScheduleTrigger::EveryMinute];
        if now.minute() == 0 {
            due.push(ScheduleTrigger::EveryHour);
            if now.hour() == 0 {
                due.push(ScheduleTrigger::EveryDay);
            }
        }
        due
    }
}

impl fmt::Display for ScheduleTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleTrigger {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self> {
        ScheduleTrigger::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ServerError::processing(format!("unknown schedule trigger '{s}'")))
    }
}

/// Trigger name to plugin config ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobSchedule(BTreeMap<String, Vec<i64>>);

impl JobSchedule {
    /// Parse the value returned by `getPluginSchedule`. `null` is an empty schedule.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value)
            .map_err(|e| ServerError::Serialization(format!("invalid plugin schedule: {e}")))
    }

    pub fn plugin_configs(&self, trigger: ScheduleTrigger) -> &[i64] {
        self.0
            .get(trigger.as_str())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn insert(&mut self, trigger: ScheduleTrigger, plugin_config_ids: Vec<i64>) {
        self.0.insert(trigger.as_str().to_string(), plugin_config_ids);
    }

    /// Total scheduled plugin configs across all triggers
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Record carried on the `scheduled_tasks` topic
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub task_type: String,
    pub plugin_config_id: i64,
}

/// Ask every unit to reload its schedule, then fetch the schedule and store it on the hub
pub async fn reload_schedule(pool: &WorkerPool, hub: &Hub) -> Result<JobSchedule> {
    pool.broadcast(PoolTask::ReloadSchedule, Value::Null).await?;
    let schedule = JobSchedule::from_value(
        pool.submit_task(PoolTask::GetPluginSchedule, Value::Null)
            .await?,
    )?;

    hub.replace_job_schedule(schedule.clone());
    metrics::counter!(SCHEDULE_RELOADS).increment(1);
    info!(
        "🔄 SCHEDULE: Loaded plugin schedule with {} entries",
        schedule.len()
    );
    Ok(schedule)
}

/// Produces due scheduled tasks at most once per wall-clock minute
pub struct Scheduler {
    hub: Arc<Hub>,
    last_minute: parking_lot::Mutex<Option<i64>>,
}

impl Scheduler {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            last_minute: parking_lot::Mutex::new(None),
        }
    }

    /// Produce records for triggers due at `now`, returning how many were written
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let minute = now.timestamp().div_euclid(60);
        {
            let mut last = self.last_minute.lock();
            if *last == Some(minute) {
                return Ok(0);
            }
            *last = Some(minute);
        }

        let schedule = self.hub.job_schedule();
        let broker = self.hub.broker();
        let mut produced = 0;

        for trigger in ScheduleTrigger::due_at(now) {
            for plugin_config_id in schedule.plugin_configs(trigger) {
                let task = ScheduledTask {
                    task_type: trigger.as_str().to_string(),
                    plugin_config_id: *plugin_config_id,
                };
                let payload = serde_json::to_vec(&task)?;
                let key = plugin_config_id.to_string();
                broker
                    .produce(topics::SCHEDULED_TASKS, Some(&key), &payload)
                    .await?;
                produced += 1;
            }
            metrics::counter!(SCHEDULED_TASKS_TRIGGERED, "trigger" => trigger.as_str())
                .increment(schedule.plugin_configs(trigger).len() as u64);
        }

        debug!(produced, minute, "Scheduled tasks produced");
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_due_triggers_by_minute() {
        let at = |h, m| Utc.with_ymd_and_hms(2024, 3, 1, h, m, 30).unwrap();
        assert_eq!(ScheduleTrigger::due_at(at(13, 7)), vec![ScheduleTrigger::EveryMinute]);
        assert_eq!(
            ScheduleTrigger::due_at(at(13, 0)),
            vec![ScheduleTrigger::EveryMinute, ScheduleTrigger::EveryHour]
        );
        assert_eq!(ScheduleTrigger::due_at(at(0, 0)), ScheduleTrigger::ALL.to_vec());
    }

    #[test]
    fn test_schedule_from_pool_value() {
        let schedule = JobSchedule::from_value(json!({
            "runEveryMinute": [1, 2],
            "runEveryDay": [3]
        }))
        .unwrap();
        assert_eq!(schedule.plugin_configs(ScheduleTrigger::EveryMinute), &[1, 2]);
        assert!(schedule.plugin_configs(ScheduleTrigger::EveryHour).is_empty());
        assert_eq!(schedule.len(), 3);

        assert!(JobSchedule::from_value(Value::Null).unwrap().is_empty());
        assert!(JobSchedule::from_value(json!(["not", "a", "map"])).is_err());
    }

    #[test]
    fn test_scheduled_task_wire_format() {
        let task: ScheduledTask =
            serde_json::from_str(r#"{"taskType":"runEveryHour","pluginConfigId":42}"#).unwrap();
        assert_eq!(task.plugin_config_id, 42);
        assert_eq!(
            task.task_type.parse::<ScheduleTrigger>().unwrap(),
            ScheduleTrigger::EveryHour
        );
    }
}
