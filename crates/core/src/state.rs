//! Persistent-state snapshots and field-level diffs.
//!
//! A snapshot maps a field name to the value used for update comparison. The store
//! boundary keeps the snapshot taken when an entity was loaded, diffs it against the
//! current one, and writes only the changed fields.
//!
//! Absent keys and `StateValue::Null` compare equal, so optional entries (a blob id
//! that does not exist yet) can simply be left out of the map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Comparison value for a single persisted field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StateValue {
    Null,
    Int(i64),
    Text(String),
    Id(Uuid),
    Timestamp(DateTime<Utc>),
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for StateValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Uuid> for StateValue {
    fn from(value: Uuid) -> Self {
        Self::Id(value)
    }
}

impl From<DateTime<Utc>> for StateValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(StateValue::Null)
    }
}

const NULL: StateValue = StateValue::Null;

/// Deterministic field-name → value mapping of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PersistentState {
    fields: BTreeMap<&'static str, StateValue>,
}

impl PersistentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field value (builder style).
    pub fn with(mut self, field: &'static str, value: impl Into<StateValue>) -> Self {
        self.fields.insert(field, value.into());
        self
    }

    /// Record a field only when a value is present.
    pub fn with_optional(mut self, field: &'static str, value: Option<impl Into<StateValue>>) -> Self {
        if let Some(value) = value {
            self.fields.insert(field, value.into());
        }
        self
    }

    pub fn get(&self, field: &str) -> &StateValue {
        self.fields.get(field).unwrap_or(&NULL)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &StateValue)> {
        self.fields.iter().map(|(k, v)| (*k, v))
    }

    /// Fields whose value differs between `self` (the baseline) and `current`.
    pub fn diff(&self, current: &PersistentState) -> StateDiff {
        let mut changed = BTreeMap::new();
        for field in self.fields.keys().chain(current.fields.keys()) {
            let after = current.get(field);
            if self.get(field) != after {
                changed.insert(*field, after.clone());
            }
        }
        StateDiff { changed }
    }
}

/// Changed fields with their new values, in field-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateDiff {
    changed: BTreeMap<&'static str, StateValue>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changed.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.changed.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.changed.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &StateValue)> {
        self.changed.iter().map(|(k, v)| (*k, v))
    }
}
