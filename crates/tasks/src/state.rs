//! Task lifecycle states and the append-only log entries that record them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Log entry name used for every state transition.
pub const EVENT_STATE_CHANGE: &str = "STATE_CHANGE";

/// Lifecycle state of a task.
///
/// ```text
/// SCHEDULED -> IN_PROGRESS -> SUCCEEDED
///                          -> FAILED -> CANCELED
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Scheduled,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Scheduled => "SCHEDULED",
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::Succeeded => "SUCCEEDED",
            TaskState::Failed => "FAILED",
            TaskState::Canceled => "CANCELED",
        }
    }

    /// Terminal for the engine: nothing it does moves a task out of these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Canceled)
    }

    /// Whether the engine may move a task from `self` to `next`.
    ///
    /// `CANCELED -> CANCELED` is allowed: the cleanup path claims a failed task
    /// straight into `CANCELED` and confirms the state once cleanup finishes.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (Failed, Canceled)
                | (Canceled, Canceled)
        )
    }
}

impl core::fmt::Display for TaskState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<TaskState> for serde_json::Value {
    fn from(value: TaskState) -> Self {
        serde_json::Value::String(value.as_str().to_string())
    }
}

/// Severity of a log entry.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    #[default]
    Info,
    Warning,
    Error,
}

/// One entry of a task's audit trail. Entries are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub state: TaskState,
    #[serde(default)]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    pub fn new(state: TaskState, event_type: EventType, date: DateTime<Utc>) -> Self {
        Self {
            state,
            event_type,
            name: None,
            date,
            message: None,
            details: None,
        }
    }

    /// A `STATE_CHANGE` entry for a transition into `state`.
    pub fn state_change(state: TaskState, message: Option<String>) -> Self {
        Self {
            name: Some(EVENT_STATE_CHANGE.to_string()),
            message,
            ..Self::new(state, EventType::Info, Utc::now())
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_serialize_as_screaming_snake_case() {
        assert_eq!(
            serde_json::to_value(TaskState::InProgress).unwrap(),
            serde_json::json!("IN_PROGRESS")
        );
        let parsed: TaskState = serde_json::from_str("\"CANCELED\"").unwrap();
        assert_eq!(parsed, TaskState::Canceled);
    }

    #[test]
    fn engine_transitions() {
        use TaskState::*;
        assert!(Scheduled.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Canceled));

        assert!(!Failed.can_transition_to(Scheduled));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Scheduled.can_transition_to(Succeeded));
        assert!(!Canceled.can_transition_to(InProgress));
    }

    #[test]
    fn state_change_entry_is_named() {
        let entry = LogEntry::state_change(TaskState::Failed, Some("crashed".into()));
        assert_eq!(entry.name.as_deref(), Some(EVENT_STATE_CHANGE));
        assert_eq!(entry.event_type, EventType::Info);

        let doc = serde_json::to_value(&entry).unwrap();
        assert_eq!(doc["state"], "FAILED");
        assert_eq!(doc["eventType"], "INFO");
        assert!(doc.get("details").is_none());
    }
}
