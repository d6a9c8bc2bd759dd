//! What happens to a batch the store refused.
//!
//! Neither policy retries: a failed flush is lost for the backing store.
//! `DeadLetter` only keeps it around so the loss can be observed and
//! reconciled out of band.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::contracts::{FailedFlush, FailurePolicy};

/// Logs the failure and drops the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAndDrop;

impl FailurePolicy for LogAndDrop {
    fn name(&self) -> &'static str {
        "log_and_drop"
    }

    fn on_failure(&self, failed: FailedFlush) {
        log_failure(&failed);
    }
}

/// Logs the failure and keeps the batch in a bounded queue.
///
/// When full, the oldest entry is evicted.
#[derive(Debug)]
pub struct DeadLetter {
    capacity: usize,
    entries: Mutex<VecDeque<FailedFlush>>,
}

impl Default for DeadLetter {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}

impl DeadLetter {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every recorded failure, oldest first.
    pub fn drain(&self) -> Vec<FailedFlush> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl FailurePolicy for DeadLetter {
    fn name(&self) -> &'static str {
        "dead_letter"
    }

    fn on_failure(&self, failed: FailedFlush) {
        log_failure(&failed);

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            if let Some(evicted) = entries.pop_front() {
                tracing::warn!(
                    target_key = %evicted.target,
                    capacity = self.capacity,
                    "Dead letter queue full, evicting oldest failed flush"
                );
            }
        }
        entries.push_back(failed);
    }
}

fn log_failure(failed: &FailedFlush) {
    tracing::error!(
        target_key = %failed.target,
        fields = ?failed.field_names(),
        updates = ?failed.updates,
        error = %failed.error,
        "Failed to apply coalesced update"
    );
}
