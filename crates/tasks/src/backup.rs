//! Backup tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::BackupPlan;
use crate::record::{Task, TaskKind, TaskRecord};

/// Opaque description of a backup source, target or restore destination.
///
/// The engine never interprets these; they are handed to the executor as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointDocument {
    #[serde(rename = "_type")]
    pub kind: String,
    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EndpointDocument {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            properties: serde_json::Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Where a finished backup's artifact lives and whether it has been expired.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub expired_date: Option<DateTime<Utc>>,
}

impl TargetReference {
    pub fn is_expired(&self) -> bool {
        self.expired_date.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backup {
    #[serde(flatten)]
    pub task: TaskRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub source: EndpointDocument,
    pub target: EndpointDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_reference: Option<TargetReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_stats: Option<serde_json::Value>,
    #[serde(
        rename = "backupRateInMBPS",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub backup_rate_in_mbps: Option<f64>,
    /// Snapshot of the owning plan at the time the backup was scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<BackupPlan>,
    #[serde(default)]
    pub plan_occurrence: Option<DateTime<Utc>>,
}

impl Backup {
    pub fn new(source: EndpointDocument, target: EndpointDocument) -> Self {
        Self {
            task: TaskRecord::new(),
            name: None,
            description: None,
            source,
            target,
            target_reference: None,
            source_stats: None,
            backup_rate_in_mbps: None,
            plan: None,
            plan_occurrence: None,
        }
    }

    pub fn with_task(mut self, task: TaskRecord) -> Self {
        self.task = task;
        self
    }

    /// Bind the backup to one occurrence of a plan.
    pub fn for_plan(mut self, plan: BackupPlan, occurrence: DateTime<Utc>) -> Self {
        self.plan = Some(plan);
        self.plan_occurrence = Some(occurrence);
        self
    }

    pub fn with_target_reference(mut self, reference: TargetReference) -> Self {
        self.target_reference = Some(reference);
        self
    }
}

impl Task for Backup {
    const KIND: TaskKind = TaskKind::Backup;

    fn record(&self) -> &TaskRecord {
        &self.task
    }

    fn record_mut(&mut self) -> &mut TaskRecord {
        &mut self.task
    }

    /// A planned backup is due at its plan occurrence, not when it was created.
    fn due_instant(&self) -> DateTime<Utc> {
        self.plan_occurrence.unwrap_or(self.task.created_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Schedule;
    use chrono::Duration;

    fn sample() -> Backup {
        Backup::new(
            EndpointDocument::new("DatabaseSource").with_property("uri", "db://primary/app"),
            EndpointDocument::new("FileTarget").with_property("dir", "/var/backups"),
        )
    }

    #[test]
    fn document_uses_persisted_field_names() {
        let mut backup = sample().with_target_reference(TargetReference {
            uri: Some("file:///var/backups/a.tgz".into()),
            ..Default::default()
        });
        backup.backup_rate_in_mbps = Some(12.5);

        let doc = serde_json::to_value(&backup).unwrap();
        assert_eq!(doc["state"], "SCHEDULED");
        assert_eq!(doc["source"]["_type"], "DatabaseSource");
        assert_eq!(doc["source"]["uri"], "db://primary/app");
        assert_eq!(doc["targetReference"]["expiredDate"], serde_json::Value::Null);
        assert_eq!(doc["backupRateInMBPS"], 12.5);
        assert!(doc.get("plan").is_none());

        let back: Backup = serde_json::from_value(doc).unwrap();
        assert_eq!(back, backup);
    }

    #[test]
    fn due_instant_prefers_plan_occurrence() {
        let backup = sample();
        assert_eq!(backup.due_instant(), backup.task.created_date);

        let occurrence = Utc::now() - Duration::hours(1);
        let plan = BackupPlan::new(Schedule::new(occurrence, 3600).unwrap());
        let planned = sample().for_plan(plan, occurrence);
        assert_eq!(planned.due_instant(), occurrence);
    }
}
