//! Query expressions evaluated against stored JSON documents.
//!
//! Paths are dotted (`tags.region`, `targetReference.expiredDate`). Values are
//! compared the way a document database would: numbers numerically, RFC3339
//! strings as instants, other strings lexicographically.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A predicate over a document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Equal to the value. `Eq(path, Null)` also matches a missing field.
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    /// Field present (`true`) or absent (`false`). A stored null counts as present.
    Exists(String, bool),
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

impl Filter {
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(path.into(), value.into())
    }

    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(path.into(), value.into())
    }

    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(path.into(), value.into())
    }

    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(path.into(), value.into())
    }

    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(path.into(), value.into())
    }

    pub fn exists(path: impl Into<String>, exists: bool) -> Self {
        Self::Exists(path.into(), exists)
    }

    /// Missing or explicitly null.
    pub fn is_null(path: impl Into<String>) -> Self {
        Self::Eq(path.into(), Value::Null)
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, Value::Null) => lookup(doc, path).is_none_or(Value::is_null),
            Filter::Eq(path, value) => lookup(doc, path).is_some_and(|v| values_equal(v, value)),
            Filter::Ne(path, value) => !Filter::Eq(path.clone(), value.clone()).matches(doc),
            Filter::Lt(path, value) => compare_at(doc, path, value) == Some(Ordering::Less),
            Filter::Lte(path, value) => matches!(
                compare_at(doc, path, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::Gt(path, value) => compare_at(doc, path, value) == Some(Ordering::Greater),
            Filter::Gte(path, value) => matches!(
                compare_at(doc, path, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Exists(path, exists) => lookup(doc, path).is_some() == *exists,
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
        }
    }
}

/// Convert an instant into the stored representation.
pub fn date_value(date: DateTime<Utc>) -> Value {
    Value::String(date.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One sort criterion. Missing and null values sort first in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Order two documents by `keys`, most significant first.
pub fn compare_documents(a: &Value, b: &Value, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let ordering = sort_compare(lookup(a, &key.path), lookup(b, &key.path));
        let ordering = match key.order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Resolve a dotted path inside a document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

pub(crate) fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn compare_at(doc: &Value, path: &str, value: &Value) -> Option<Ordering> {
    lookup(doc, path).and_then(|v| compare_values(v, value))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(_), Value::String(_)) | (Value::Number(_), Value::Number(_)) => {
            compare_values(a, b) == Some(Ordering::Equal)
        }
        _ => a == b,
    }
}

/// Compare two scalars of the same kind; `None` when they are not comparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_instant(x), parse_instant(y)) {
            (Some(dx), Some(dy)) => Some(dx.cmp(&dy)),
            _ => Some(x.cmp(y)),
        },
        _ => None,
    }
}

fn type_rank(v: Option<&Value>) -> u8 {
    match v {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn sort_compare(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
        _ => Ordering::Equal,
    }
}
