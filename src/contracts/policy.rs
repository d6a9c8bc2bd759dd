use std::time::SystemTime;

use serde::Serialize;

use crate::contracts::error::StoreError;
use crate::contracts::store::{FieldUpdate, TargetRef};

/// Combines the ordered updates of a claimed batch into the set sent to the store.
///
/// Runs once per flushed batch, outside the coalescing lock.
pub trait MergePolicy: Send + Sync {
    /// Short name used in logs and stats.
    fn name(&self) -> &'static str;

    /// Returns the updates to apply, in application order.
    /// `updates` is in arrival order and never empty.
    fn combine(&self, updates: Vec<FieldUpdate>) -> Vec<FieldUpdate>;
}

/// A batch whose store call failed.
#[derive(Debug, Clone, Serialize)]
pub struct FailedFlush {
    pub target: TargetRef,
    pub updates: Vec<FieldUpdate>,
    pub error: String,
    pub failed_at: SystemTime,
}

impl FailedFlush {
    pub fn new(target: TargetRef, updates: Vec<FieldUpdate>, error: &StoreError) -> Self {
        Self {
            target,
            updates,
            error: error.to_string(),
            failed_at: SystemTime::now(),
        }
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.updates.iter().map(|u| u.field.as_str()).collect()
    }
}

/// Decides what happens to a batch after the store rejected it.
///
/// Called from the flush task after the gate permit has been released. Must not block.
pub trait FailurePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_failure(&self, failed: FailedFlush);
}
