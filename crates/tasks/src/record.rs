//! Fields and behaviour shared by every schedulable task.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use vaultline_core::{DomainError, DomainResult, EngineGuid, TaskId};

use crate::state::{EventType, LogEntry, TaskState};

/// Tag key/value pairs restricting which engines may claim a task.
pub type Tags = BTreeMap<String, serde_json::Value>;

/// The closed set of task types the engine schedules.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Backup,
    Restore,
}

impl TaskKind {
    /// Name of the collection the tasks live in; also the key in status reports.
    pub fn collection_name(&self) -> &'static str {
        match self {
            TaskKind::Backup => "backups",
            TaskKind::Restore => "restores",
        }
    }

    /// Human-facing processor name used in logs.
    pub fn processor_name(&self) -> &'static str {
        match self {
            TaskKind::Backup => "Backups",
            TaskKind::Restore => "Restores",
        }
    }
}

impl core::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TaskKind::Backup => f.write_str("backup"),
            TaskKind::Restore => f.write_str("restore"),
        }
    }
}

/// Persisted lifecycle fields common to all tasks.
///
/// Field names match the stored document (`tryCount`, `engineGuid`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(rename = "_id")]
    pub id: TaskId,
    pub state: TaskState,
    pub created_date: DateTime<Utc>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub try_count: u32,
    /// Lower value is scheduled sooner.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub engine_guid: Option<EngineGuid>,
    #[serde(default)]
    pub reschedulable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub workspace: Option<String>,
    #[serde(default)]
    pub queue_latency_in_minutes: Option<f64>,
}

impl TaskRecord {
    /// A freshly scheduled task.
    pub fn new() -> Self {
        Self {
            id: TaskId::new(),
            state: TaskState::Scheduled,
            created_date: Utc::now(),
            start_date: None,
            end_date: None,
            try_count: 0,
            priority: 0,
            engine_guid: None,
            reschedulable: false,
            tags: None,
            logs: Vec::new(),
            workspace: None,
            queue_latency_in_minutes: None,
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_date(mut self, created_date: DateTime<Utc>) -> Self {
        self.created_date = created_date;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.tags
            .get_or_insert_with(Tags::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_reschedulable(mut self, reschedulable: bool) -> Self {
        self.reschedulable = reschedulable;
        self
    }

    /// Move to `next`, enforcing the engine's state machine.
    pub fn transition(&mut self, next: TaskState) -> DomainResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "task {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Record the start of one execution attempt.
    ///
    /// `due` is the instant the task was logically due. Queue latency is
    /// measured on the first attempt only and never recomputed on retries.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>, due: DateTime<Utc>, workspace: String) {
        self.try_count += 1;
        self.start_date = Some(now);
        if self.queue_latency_in_minutes.is_none() {
            self.queue_latency_in_minutes = Some(queue_latency_minutes(due, now));
        }
        self.end_date = None;
        self.workspace = Some(workspace);
    }

    pub fn has_tags(&self) -> bool {
        self.tags.as_ref().is_some_and(|t| !t.is_empty())
    }

    pub fn errors(&self) -> Vec<&LogEntry> {
        self.entries_of(EventType::Error)
    }

    pub fn warnings(&self) -> Vec<&LogEntry> {
        self.entries_of(EventType::Warning)
    }

    fn entries_of(&self, event_type: EventType) -> Vec<&LogEntry> {
        self.logs
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Minutes between `due` and `started`, rounded to two decimals.
pub fn queue_latency_minutes(due: DateTime<Utc>, started: DateTime<Utc>) -> f64 {
    let secs = (started - due).num_milliseconds() as f64 / 1000.0;
    (secs / 60.0 * 100.0).round() / 100.0
}

/// Capability shared by every schedulable unit of work.
///
/// Implementations are plain documents; what actually runs for a task is
/// decided by the executor the engine is configured with.
pub trait Task: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: TaskKind;

    fn record(&self) -> &TaskRecord;

    fn record_mut(&mut self) -> &mut TaskRecord;

    /// The instant the task was logically due.
    fn due_instant(&self) -> DateTime<Utc> {
        self.record().created_date
    }

    fn id(&self) -> TaskId {
        self.record().id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_record_is_scheduled_and_untagged() {
        let record = TaskRecord::new();
        assert_eq!(record.state, TaskState::Scheduled);
        assert_eq!(record.try_count, 0);
        assert!(!record.has_tags());

        let doc = serde_json::to_value(&record).unwrap();
        assert!(doc.get("tags").is_none());
        assert_eq!(doc["tryCount"], 0);
        assert_eq!(doc["state"], "SCHEDULED");
        assert!(doc.get("_id").is_some());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut record = TaskRecord::new();
        let err = record.transition(TaskState::Succeeded).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
        assert_eq!(record.state, TaskState::Scheduled);

        record.transition(TaskState::InProgress).unwrap();
        record.transition(TaskState::Succeeded).unwrap();
        assert_eq!(record.state, TaskState::Succeeded);
    }

    #[test]
    fn queue_latency_is_rounded_to_two_decimals() {
        let due = Utc::now();
        let started = due + Duration::seconds(100);
        assert_eq!(queue_latency_minutes(due, started), 1.67);
    }

    #[test]
    fn queue_latency_is_measured_once() {
        let due = Utc::now() - Duration::minutes(30);
        let mut record = TaskRecord::new();

        record.begin_attempt(due + Duration::minutes(6), due, "/tmp/a".into());
        assert_eq!(record.try_count, 1);
        assert_eq!(record.queue_latency_in_minutes, Some(6.0));

        record.end_date = Some(Utc::now());
        record.begin_attempt(due + Duration::minutes(20), due, "/tmp/a".into());
        assert_eq!(record.try_count, 2);
        assert_eq!(record.queue_latency_in_minutes, Some(6.0));
        assert!(record.end_date.is_none());
        assert_eq!(record.start_date, Some(due + Duration::minutes(20)));
    }

    #[test]
    fn errors_and_warnings_are_filtered_from_logs() {
        let mut record = TaskRecord::new();
        let now = Utc::now();
        record.logs.push(LogEntry::new(TaskState::InProgress, EventType::Info, now));
        record.logs.push(LogEntry::new(TaskState::InProgress, EventType::Warning, now));
        record.logs.push(LogEntry::new(TaskState::Failed, EventType::Error, now).with_message("boom"));

        assert_eq!(record.warnings().len(), 1);
        assert_eq!(record.errors().len(), 1);
        assert_eq!(record.errors()[0].message.as_deref(), Some("boom"));
    }
}
