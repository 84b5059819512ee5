//! Document collections backing tasks, plans and audit reports.
//!
//! Every operation the engine relies on for mutual exclusion goes through
//! [`Collection::find_and_modify`], which selects and updates a single document
//! atomically: two concurrent callers can never both receive the same
//! document from the same matching state.

mod filter;
mod in_memory;
mod postgres;
mod update;

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use vaultline_tasks::{AuditReport, Backup, BackupPlan, EventType, LogEntry, Restore, Task};

pub use filter::{compare_documents, compare_values, date_value, lookup, Filter, SortKey, SortOrder};
pub use in_memory::InMemoryCollection;
pub use postgres::{PostgresCollection, PostgresStore};
pub use update::Update;

/// Store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A value persisted as one JSON document keyed by `_id`.
pub trait Document: Serialize + DeserializeOwned + Send + Sync {
    fn document_id(&self) -> String;
}

impl Document for Backup {
    fn document_id(&self) -> String {
        self.task.id.to_string()
    }
}

impl Document for Restore {
    fn document_id(&self) -> String {
        self.task.id.to_string()
    }
}

impl Document for BackupPlan {
    fn document_id(&self) -> String {
        self.id.to_string()
    }
}

impl Document for AuditReport {
    fn document_id(&self) -> String {
        self.id.to_string()
    }
}

/// A named collection of documents of one type.
pub trait Collection<D>: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a new document; fails if its `_id` is taken.
    fn insert(&self, doc: &D) -> Result<(), StoreError>;

    /// Insert or fully replace a document.
    fn save(&self, doc: &D) -> Result<(), StoreError>;

    fn find(&self, filter: &Filter, sort: &[SortKey], limit: Option<usize>) -> Result<Vec<D>, StoreError>;

    fn find_one(&self, filter: &Filter, sort: &[SortKey]) -> Result<Option<D>, StoreError> {
        Ok(self.find(filter, sort, Some(1))?.into_iter().next())
    }

    /// Atomically select the first document matching `filter` in `sort`
    /// order, apply `update` to it and return the updated document.
    fn find_and_modify(&self, filter: &Filter, sort: &[SortKey], update: &Update) -> Result<Option<D>, StoreError>;

    /// Apply `update` to the document with `id`. Returns whether it existed.
    fn update_one(&self, id: &str, update: &Update) -> Result<bool, StoreError>;

    fn count(&self, filter: &Filter) -> Result<usize, StoreError>;
}

impl<D, C: Collection<D> + ?Sized> Collection<D> for Arc<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn insert(&self, doc: &D) -> Result<(), StoreError> {
        (**self).insert(doc)
    }

    fn save(&self, doc: &D) -> Result<(), StoreError> {
        (**self).save(doc)
    }

    fn find(&self, filter: &Filter, sort: &[SortKey], limit: Option<usize>) -> Result<Vec<D>, StoreError> {
        (**self).find(filter, sort, limit)
    }

    fn find_one(&self, filter: &Filter, sort: &[SortKey]) -> Result<Option<D>, StoreError> {
        (**self).find_one(filter, sort)
    }

    fn find_and_modify(&self, filter: &Filter, sort: &[SortKey], update: &Update) -> Result<Option<D>, StoreError> {
        (**self).find_and_modify(filter, sort, update)
    }

    fn update_one(&self, id: &str, update: &Update) -> Result<bool, StoreError> {
        (**self).update_one(id, update)
    }

    fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        (**self).count(filter)
    }
}

/// What to persist from a task, and the log entry to append alongside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    /// Top-level fields to write. `None` writes every field except `_id` and `logs`.
    pub properties: Option<Vec<String>>,
    pub event_type: EventType,
    pub event_name: Option<String>,
    pub message: Option<String>,
    pub details: Option<String>,
}

impl TaskUpdate {
    /// Persist every field.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn properties<I, S>(properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            properties: Some(properties.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn with_event_type(mut self, event_type: EventType) -> Self {
        self.event_type = event_type;
        self
    }

    pub fn with_event_name(mut self, name: impl Into<String>) -> Self {
        self.event_name = Some(name.into());
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

    fn records_event(&self) -> bool {
        self.event_name.is_some()
            || self.message.is_some()
            || self.details.is_some()
            || self.event_type != EventType::Info
    }
}

/// Task-aware writes on top of a [`Collection`].
pub trait TaskCollection<T: Task + Document>: Collection<T> {
    /// Persist selected fields of `task` and append a log entry when the
    /// update carries one. The entry is mirrored into `task`'s own logs.
    fn update_task(&self, task: &mut T, update: TaskUpdate) -> Result<(), StoreError> {
        let entry = update.records_event().then(|| LogEntry {
            state: task.record().state,
            event_type: update.event_type,
            name: update.event_name.clone(),
            date: Utc::now(),
            message: update.message.clone(),
            details: update.details.clone(),
        });

        let Value::Object(fields) = serde_json::to_value(&*task)? else {
            return Err(StoreError::Serialization(format!(
                "{} did not serialize to an object",
                T::KIND
            )));
        };

        let mut change = Update::new();
        match &update.properties {
            Some(properties) => {
                for property in properties {
                    change = match fields.get(property) {
                        Some(value) => change.set(property.as_str(), value.clone()),
                        None => change.unset(property.as_str()),
                    };
                }
            }
            None => {
                for (key, value) in fields {
                    if key != "_id" && key != "logs" {
                        change = change.set(key, value);
                    }
                }
            }
        }
        if let Some(entry) = &entry {
            change = change.push("logs", serde_json::to_value(entry)?);
        }

        let id = task.document_id();
        if !self.update_one(&id, &change)? {
            return Err(StoreError::NotFound(id));
        }
        if let Some(entry) = entry {
            task.record_mut().logs.push(entry);
        }
        Ok(())
    }
}

impl<T: Task + Document, C: Collection<T> + ?Sized> TaskCollection<T> for C {}
