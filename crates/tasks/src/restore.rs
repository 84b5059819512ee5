//! Restore tasks.

use serde::{Deserialize, Serialize};

use vaultline_core::TaskId;

use crate::backup::EndpointDocument;
use crate::record::{Task, TaskKind, TaskRecord};

/// Restores the artifact of a finished backup into `destination`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restore {
    #[serde(flatten)]
    pub task: TaskRecord,
    pub source_backup: TaskId,
    pub destination: EndpointDocument,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_database: Option<String>,
}

impl Restore {
    pub fn new(source_backup: TaskId, destination: EndpointDocument) -> Self {
        Self {
            task: TaskRecord::new(),
            source_backup,
            destination,
            source_database: None,
        }
    }

    pub fn with_task(mut self, task: TaskRecord) -> Self {
        self.task = task;
        self
    }
}

impl Task for Restore {
    const KIND: TaskKind = TaskKind::Restore;

    fn record(&self) -> &TaskRecord {
        &self.task
    }

    fn record_mut(&mut self) -> &mut TaskRecord {
        &mut self.task
    }
}
