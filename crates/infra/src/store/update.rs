//! Partial document updates (`$set`, `$unset`, `$push`).

use serde_json::{Map, Value};

use super::StoreError;

/// A partial update applied atomically to one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub set: Vec<(String, Value)>,
    pub unset: Vec<String>,
    pub push: Vec<(String, Value)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn push(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push.push((path.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.push.is_empty()
    }

    /// Apply to `doc` in place. Missing intermediate objects are created.
    pub fn apply(&self, doc: &mut Value) -> Result<(), StoreError> {
        for (path, _) in self.set.iter().chain(self.push.iter()) {
            reject_id(path)?;
        }
        for path in &self.unset {
            reject_id(path)?;
        }

        for (path, value) in &self.set {
            *slot(doc, path)? = value.clone();
        }
        for path in &self.unset {
            remove(doc, path);
        }
        for (path, value) in &self.push {
            let target = slot(doc, path)?;
            match target {
                Value::Null => *target = Value::Array(vec![value.clone()]),
                Value::Array(items) => items.push(value.clone()),
                _ => {
                    return Err(StoreError::InvalidUpdate(format!(
                        "cannot push onto non-array field '{path}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn reject_id(path: &str) -> Result<(), StoreError> {
    if path == "_id" {
        return Err(StoreError::InvalidUpdate("'_id' is immutable".to_string()));
    }
    Ok(())
}

/// Mutable slot at `path`, creating objects along the way. A missing leaf is
/// inserted as null.
fn slot<'a>(doc: &'a mut Value, path: &str) -> Result<&'a mut Value, StoreError> {
    let mut current = doc;
    for segment in path.split('.') {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        current = match current {
            Value::Object(map) => map.entry(segment.to_string()).or_insert(Value::Null),
            _ => {
                return Err(StoreError::InvalidUpdate(format!(
                    "path '{path}' crosses a non-object value"
                )));
            }
        };
    }
    Ok(current)
}

fn remove(doc: &mut Value, path: &str) {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (parent, leaf),
        None => {
            if let Value::Object(map) = doc {
                map.remove(path);
            }
            return;
        }
    };
    let mut current = doc;
    for segment in parent.split('.') {
        current = match current {
            Value::Object(map) => match map.get_mut(segment) {
                Some(next) => next,
                None => return,
            },
            _ => return,
        };
    }
    if let Value::Object(map) = current {
        map.remove(leaf);
    }
}
