//! In-memory collection for tests and single-process deployments.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use super::{compare_documents, Collection, Document, Filter, SortKey, StoreError, Update};

/// Documents held as JSON behind a single lock. `find_and_modify` runs under
/// the write lock, so selection and update are one atomic step.
#[derive(Debug)]
pub struct InMemoryCollection<D> {
    name: String,
    docs: RwLock<BTreeMap<String, Value>>,
    _marker: PhantomData<fn() -> D>,
}

impl<D> InMemoryCollection<D> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Value>>, StoreError> {
        self.docs
            .read()
            .map_err(|_| StoreError::Storage(format!("collection '{}' lock poisoned", self.name)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Value>>, StoreError> {
        self.docs
            .write()
            .map_err(|_| StoreError::Storage(format!("collection '{}' lock poisoned", self.name)))
    }
}

/// Ids of the matching documents in sort order.
fn select<'a>(
    docs: &'a BTreeMap<String, Value>,
    filter: &Filter,
    sort: &[SortKey],
) -> Vec<(&'a String, &'a Value)> {
    let mut hits: Vec<_> = docs.iter().filter(|(_, doc)| filter.matches(doc)).collect();
    if !sort.is_empty() {
        hits.sort_by(|(_, a), (_, b)| compare_documents(a, b, sort));
    }
    hits
}

impl<D: Document> Collection<D> for InMemoryCollection<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn insert(&self, doc: &D) -> Result<(), StoreError> {
        let id = doc.document_id();
        let value = serde_json::to_value(doc)?;
        let mut docs = self.write()?;
        if docs.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        docs.insert(id, value);
        Ok(())
    }

    fn save(&self, doc: &D) -> Result<(), StoreError> {
        let id = doc.document_id();
        let value = serde_json::to_value(doc)?;
        self.write()?.insert(id, value);
        Ok(())
    }

    fn find(&self, filter: &Filter, sort: &[SortKey], limit: Option<usize>) -> Result<Vec<D>, StoreError> {
        let docs = self.read()?;
        select(&docs, filter, sort)
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|(_, doc)| serde_json::from_value(doc.clone()).map_err(StoreError::from))
            .collect()
    }

    fn find_and_modify(&self, filter: &Filter, sort: &[SortKey], update: &Update) -> Result<Option<D>, StoreError> {
        let mut docs = self.write()?;
        let Some(id) = select(&docs, filter, sort).first().map(|(id, _)| (*id).clone()) else {
            return Ok(None);
        };
        let Some(current) = docs.get(&id) else {
            return Ok(None);
        };
        let mut modified = current.clone();
        update.apply(&mut modified)?;
        let result: D = serde_json::from_value(modified.clone())?;
        docs.insert(id, modified);
        Ok(Some(result))
    }

    fn update_one(&self, id: &str, update: &Update) -> Result<bool, StoreError> {
        let mut docs = self.write()?;
        let Some(doc) = docs.get_mut(id) else {
            return Ok(false);
        };
        let mut modified = doc.clone();
        update.apply(&mut modified)?;
        *doc = modified;
        Ok(true)
    }

    fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
        let docs = self.read()?;
        Ok(docs.values().filter(|doc| filter.matches(doc)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    use vaultline_tasks::{Backup, EndpointDocument, TaskRecord, TaskState};

    fn backup(priority: i32) -> Backup {
        Backup::new(EndpointDocument::new("DbSource"), EndpointDocument::new("FileTarget"))
            .with_task(TaskRecord::new().with_priority(priority))
    }

    fn claim_update() -> Update {
        Update::new().set("state", TaskState::InProgress)
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let store = InMemoryCollection::<Backup>::new("backups");
        let task = backup(0);
        store.insert(&task).unwrap();
        assert!(matches!(store.insert(&task), Err(StoreError::AlreadyExists(_))));
        store.save(&task).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn find_and_modify_takes_first_in_sort_order() {
        let store = InMemoryCollection::<Backup>::new("backups");
        for p in [5, 1, 3] {
            store.insert(&backup(p)).unwrap();
        }

        let claimed: Backup = store
            .find_and_modify(
                &Filter::eq("state", TaskState::Scheduled),
                &[SortKey::asc("priority")],
                &claim_update(),
            )
            .unwrap()
            .unwrap();
        assert_eq!(claimed.task.priority, 1);
        assert_eq!(claimed.task.state, TaskState::InProgress);
        assert_eq!(store.count(&Filter::eq("state", TaskState::Scheduled)).unwrap(), 2);
    }

    #[test]
    fn find_and_modify_with_no_match_changes_nothing() {
        let store = InMemoryCollection::<Backup>::new("backups");
        store.insert(&backup(0)).unwrap();
        let claimed = store
            .find_and_modify(&Filter::eq("state", TaskState::Failed), &[], &claim_update())
            .unwrap();
        assert!(claimed.is_none());
        assert_eq!(store.count(&Filter::eq("state", TaskState::Scheduled)).unwrap(), 1);
    }

    #[test]
    fn concurrent_claims_are_exclusive() {
        const TASKS: usize = 20;
        const CLAIMERS: usize = 8;

        let store = Arc::new(InMemoryCollection::<Backup>::new("backups"));
        for i in 0..TASKS {
            store.insert(&backup(i as i32)).unwrap();
        }

        let barrier = Arc::new(Barrier::new(CLAIMERS));
        let handles: Vec<_> = (0..CLAIMERS)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    loop {
                        let next: Option<Backup> = store
                            .find_and_modify(
                                &Filter::eq("state", TaskState::Scheduled),
                                &[SortKey::asc("priority")],
                                &claim_update(),
                            )
                            .unwrap();
                        match next {
                            Some(task) => mine.push(task.task.id),
                            None => break mine,
                        }
                    }
                })
            })
            .collect();

        let mut claimed: Vec<_> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let total = claimed.len();
        claimed.sort();
        claimed.dedup();
        assert_eq!(total, TASKS);
        assert_eq!(claimed.len(), TASKS);
    }

    #[test]
    fn failed_update_leaves_document_untouched() {
        let store = InMemoryCollection::<Backup>::new("backups");
        let task = backup(0);
        store.insert(&task).unwrap();
        let id = task.task.id.to_string();

        let bad = Update::new().set("state", TaskState::Failed).push("state", 1);
        assert!(store.update_one(&id, &bad).is_err());
        let stored: Backup = store.find_one(&Filter::All, &[]).unwrap().unwrap();
        assert_eq!(stored.task.state, TaskState::Scheduled);
        assert!(!store.update_one("missing", &Update::new()).unwrap());
    }
}
