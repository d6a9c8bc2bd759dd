use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::contracts::{FieldUpdate, TargetKey, TargetRef};
use crate::metrics::DispatcherMetrics;

/// Updates accumulated for one target since its last claim.
#[derive(Debug, Clone)]
pub struct PendingBatch {
    pub target: TargetRef,
    /// Arrival order
    pub updates: Vec<FieldUpdate>,
    pub created_at: Instant,
}

impl PendingBatch {
    fn new(target: TargetRef) -> Self {
        Self {
            target,
            updates: Vec::new(),
            created_at: Instant::now(),
        }
    }
}

/// Target key to pending batch, guarded by one mutex.
///
/// # Invariants
/// - A key is present iff something was appended since its last claim
/// - Critical sections are O(1) map operations and never span an await
/// - The `pending_keys` gauge, when attached, is written inside the same
///   critical section as the mutation it reflects
#[derive(Debug, Default)]
pub struct CoalescingMap {
    batches: Mutex<HashMap<TargetKey, PendingBatch>>,
    metrics: Option<Arc<DispatcherMetrics>>,
}

impl CoalescingMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map that keeps `metrics.pending_keys` in step with its length.
    pub fn with_metrics(metrics: Arc<DispatcherMetrics>) -> Self {
        Self {
            batches: Mutex::default(),
            metrics: Some(metrics),
        }
    }

    fn publish_len(&self, len: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending_keys(len);
        }
    }

    // Nothing inside a critical section can panic halfway through a mutation,
    // so a poisoned map is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<TargetKey, PendingBatch>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends updates to the target's batch, creating it if needed.
    /// Returns the key and the number of keys pending afterwards.
    pub fn append(
        &self,
        target: &TargetRef,
        updates: impl IntoIterator<Item = FieldUpdate>,
    ) -> (TargetKey, usize) {
        let key = target.key();
        let mut batches = self.lock();
        batches
            .entry(key.clone())
            .or_insert_with(|| PendingBatch::new(target.clone()))
            .updates
            .extend(updates);
        let pending = batches.len();
        self.publish_len(pending);
        (key, pending)
    }

    /// Removes and returns the batch for `key`.
    ///
    /// `None` means another flush attempt already claimed it.
    pub fn claim(&self, key: &str) -> Option<PendingBatch> {
        let mut batches = self.lock();
        let batch = batches.remove(key);
        if batch.is_some() {
            self.publish_len(batches.len());
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of updates waiting for `key`.
    pub fn pending_updates(&self, key: &str) -> usize {
        self.lock().get(key).map(|b| b.updates.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn target(id: &str) -> TargetRef {
        TargetRef::doc("events", id)
    }

    #[test]
    fn append_creates_then_extends_batch() {
        let map = CoalescingMap::new();
        let (key, pending) = map.append(&target("e1"), [FieldUpdate::increment("Going", 1)]);
        assert_eq!(key, "events/e1");
        assert_eq!(pending, 1);

        map.append(&target("e1"), [FieldUpdate::increment("Applied", -1)]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.pending_updates("events/e1"), 2);
    }

    #[test]
    fn claim_removes_the_entry() {
        let map = CoalescingMap::new();
        map.append(&target("e1"), [FieldUpdate::set("Status", "open")]);

        let batch = map.claim("events/e1").expect("batch should be pending");
        assert_eq!(batch.target, target("e1"));
        assert_eq!(batch.updates.len(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn second_claim_finds_nothing() {
        let map = CoalescingMap::new();
        map.append(&target("e1"), [FieldUpdate::set("Status", "open")]);

        assert!(map.claim("events/e1").is_some());
        assert!(map.claim("events/e1").is_none());
    }

    #[test]
    fn append_after_claim_starts_fresh_batch() {
        let map = CoalescingMap::new();
        map.append(&target("e1"), [FieldUpdate::set("A", 1)]);
        map.claim("events/e1");
        map.append(&target("e1"), [FieldUpdate::set("B", 2)]);

        let batch = map.claim("events/e1").unwrap();
        assert_eq!(batch.updates, vec![FieldUpdate::set("B", 2)]);
    }

    #[test]
    fn keys_are_independent() {
        let map = CoalescingMap::new();
        map.append(&target("a"), [FieldUpdate::set("X", 1)]);
        map.append(&target("b"), [FieldUpdate::set("Y", 2)]);

        let a = map.claim("events/a").unwrap();
        assert_eq!(a.updates, vec![FieldUpdate::set("X", 1)]);
        assert_eq!(map.pending_updates("events/b"), 1);
    }

    #[test]
    fn concurrent_appends_and_claims_lose_nothing() {
        let map = Arc::new(CoalescingMap::new());
        let writers = 8;
        let per_writer = 250;

        let appenders: Vec<_> = (0..writers)
            .map(|w| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..per_writer {
                        map.append(&target("hot"), [FieldUpdate::set(format!("w{}-{}", w, i), i)]);
                    }
                })
            })
            .collect();

        let claimer = {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut seen = 0;
                for _ in 0..1_000 {
                    if let Some(batch) = map.claim("events/hot") {
                        seen += batch.updates.len();
                    }
                }
                seen
            })
        };

        for handle in appenders {
            handle.join().unwrap();
        }
        let mut seen = claimer.join().unwrap();
        if let Some(batch) = map.claim("events/hot") {
            seen += batch.updates.len();
        }

        assert_eq!(seen, writers * per_writer);
    }

    #[test]
    fn attached_gauge_follows_appends_and_claims() {
        let metrics = Arc::new(DispatcherMetrics::new());
        let map = CoalescingMap::with_metrics(Arc::clone(&metrics));
        let gauge = || metrics.pending_keys.load(Ordering::Relaxed);

        map.append(&target("a"), [FieldUpdate::set("X", 1)]);
        map.append(&target("b"), [FieldUpdate::set("Y", 2)]);
        assert_eq!(gauge(), 2);

        map.claim("events/a");
        assert_eq!(gauge(), 1);
        map.claim("events/a");
        assert_eq!(gauge(), 1);
        map.claim("events/b");
        assert_eq!(gauge(), 0);
    }

    #[test]
    fn attached_gauge_matches_length_after_racing_threads() {
        let metrics = Arc::new(DispatcherMetrics::new());
        let map = Arc::new(CoalescingMap::with_metrics(Arc::clone(&metrics)));

        let workers: Vec<_> = (0..8)
            .map(|w| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        let id = format!("k{}", i % 4);
                        map.append(&target(&id), [FieldUpdate::set(format!("w{}", w), i)]);
                        map.claim(&format!("events/{}", id));
                    }
                })
            })
            .collect();
        for handle in workers {
            handle.join().unwrap();
        }

        assert_eq!(metrics.pending_keys.load(Ordering::Relaxed), map.len() as u64);
    }
}
