use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::contracts::error::StoreError;

/// Key of a pending batch in the coalescing map. Equal to the target's path.
pub type TargetKey = String;

/// Address of one record in the backing document store.
///
/// Paths are `/`-separated collection and document segments, e.g.
/// `squads/s1/members/u1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    path: String,
}

impl TargetRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Top-level document `collection/id`.
    pub fn doc(collection: &str, id: &str) -> Self {
        Self::new(format!("{}/{}", collection, id))
    }

    /// Nested document `<self>/collection/id`.
    pub fn child(&self, collection: &str, id: &str) -> Self {
        Self::new(format!("{}/{}/{}", self.path, collection, id))
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the coalescing key for this target.
    pub fn key(&self) -> TargetKey {
        self.path.clone()
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// New value for a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValue {
    /// Replace the field's value.
    Set(serde_json::Value),
    /// Add a delta to a numeric field. A missing field counts as zero.
    Increment(i64),
    /// Remove the field.
    Delete,
}

impl FieldValue {
    /// Returns true for values that overwrite whatever the field held before.
    pub fn is_replacement(&self) -> bool {
        !matches!(self, FieldValue::Increment(_))
    }
}

impl From<serde_json::Value> for FieldValue {
    fn from(value: serde_json::Value) -> Self {
        FieldValue::Set(value)
    }
}

/// A (field, value) pair destined for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub value: FieldValue,
}

impl FieldUpdate {
    pub fn new(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn set(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self::new(field, FieldValue::Set(value.into()))
    }

    pub fn increment(field: impl Into<String>, delta: i64) -> Self {
        Self::new(field, FieldValue::Increment(delta))
    }

    pub fn delete(field: impl Into<String>) -> Self {
        Self::new(field, FieldValue::Delete)
    }
}

/// Backing store that applies partial updates to a single record.
///
/// # Invariants
/// - One call is atomic: either every update in `updates` is applied or none is
/// - Safe to call concurrently from many tasks
/// - The dispatcher never retries a failed call
pub trait PartialUpdateStore: Send + Sync {
    /// Applies `updates` to the record addressed by `target`, in order.
    fn apply(
        &self,
        target: &TargetRef,
        updates: &[FieldUpdate],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

impl<S: PartialUpdateStore> PartialUpdateStore for Arc<S> {
    fn apply(
        &self,
        target: &TargetRef,
        updates: &[FieldUpdate],
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        (**self).apply(target, updates)
    }
}
