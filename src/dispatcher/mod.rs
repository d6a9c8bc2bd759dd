//! Demand-driven write coalescing.
//!
//! Every `dispatch` appends to the target's pending batch and spawns one
//! flush attempt. Attempts queue on a semaphore shared by all targets, then
//! claim whatever is pending for their key. The first attempt to get there
//! flushes the whole batch; later ones find the entry gone and exit.

mod coalescing;
mod failure;
mod merge;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore};

use crate::contracts::{
    CoalescerError, ConfigError, FailedFlush, FailurePolicy, FieldUpdate, FieldValue,
    MergePolicy, PartialUpdateStore, TargetKey, TargetRef,
};
use crate::metrics::DispatcherMetrics;

pub use coalescing::{CoalescingMap, PendingBatch};
pub use failure::{DeadLetter, LogAndDrop};
pub use merge::{LastWriteWins, SumIncrements};

pub const DEFAULT_MAX_CONCURRENT_FLUSHES: usize = 4;

/// Configuration for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Maximum number of store calls in flight across all targets.
    pub max_concurrent_flushes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_flushes: DEFAULT_MAX_CONCURRENT_FLUSHES,
        }
    }
}

impl DispatcherConfig {
    pub fn with_max_concurrent_flushes(max_concurrent_flushes: usize) -> Self {
        Self {
            max_concurrent_flushes,
        }
    }

    /// Creates a config from environment variables.
    ///
    /// Environment variables:
    /// - `COALESCER_MAX_CONCURRENT_FLUSHES`: gate capacity (default: 4)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_flushes: std::env::var("COALESCER_MAX_CONCURRENT_FLUSHES")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default.max_concurrent_flushes),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_flushes == 0 {
            return Err(ConfigError::InvalidConcurrency(self.max_concurrent_flushes));
        }
        Ok(())
    }
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub max_concurrent_flushes: usize,
    pub available_permits: usize,
    pub pending_keys: usize,
    pub outstanding_attempts: usize,
    pub enqueued_total: u64,
    pub flush_attempts_total: u64,
    pub noop_claims_total: u64,
    pub flushes_total: u64,
    pub flush_failures_total: u64,
    pub updates_flushed_total: u64,
    pub updates_coalesced_total: u64,
    pub peak_inflight_flushes: u64,
    pub merge_policy: &'static str,
    pub failure_policy: &'static str,
}

/// Counts spawned flush attempts that have not finished yet.
#[derive(Default)]
struct AttemptTracker {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl AttemptTracker {
    fn start(self: &Arc<Self>) -> AttemptGuard {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        AttemptGuard {
            tracker: Arc::clone(self),
        }
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Decrements the outstanding count when the attempt ends, even if the task
/// is dropped before it runs.
struct AttemptGuard {
    tracker: Arc<AttemptTracker>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.tracker.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

struct Shared<S> {
    store: Arc<S>,
    pending: CoalescingMap,
    gate: Arc<Semaphore>,
    merge: Arc<dyn MergePolicy>,
    failure: Arc<dyn FailurePolicy>,
    metrics: Arc<DispatcherMetrics>,
    attempts: Arc<AttemptTracker>,
    config: DispatcherConfig,
}

/// Coalesces field updates per target and flushes them through `S`.
///
/// Cheap to clone; clones share the same pending batches and gate.
pub struct Dispatcher<S>
where
    S: PartialUpdateStore + 'static,
{
    shared: Arc<Shared<S>>,
    runtime: Handle,
}

impl<S> Clone for Dispatcher<S>
where
    S: PartialUpdateStore + 'static,
{
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            runtime: self.runtime.clone(),
        }
    }
}

impl<S> Dispatcher<S>
where
    S: PartialUpdateStore + 'static,
{
    /// Creates a dispatcher with last-write-wins merging and log-and-drop
    /// failure handling, spawning onto the current tokio runtime.
    pub fn new(store: Arc<S>, config: DispatcherConfig) -> Result<Self, CoalescerError> {
        Self::with_policies(
            store,
            config,
            Arc::new(LastWriteWins),
            Arc::new(LogAndDrop),
        )
    }

    pub fn with_policies(
        store: Arc<S>,
        config: DispatcherConfig,
        merge: Arc<dyn MergePolicy>,
        failure: Arc<dyn FailurePolicy>,
    ) -> Result<Self, CoalescerError> {
        let runtime =
            Handle::try_current().map_err(|e| CoalescerError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(store, config, merge, failure, runtime)?)
    }

    /// Creates a dispatcher that spawns flush attempts onto `runtime`.
    pub fn with_runtime(
        store: Arc<S>,
        config: DispatcherConfig,
        merge: Arc<dyn MergePolicy>,
        failure: Arc<dyn FailurePolicy>,
        runtime: Handle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        tracing::info!(
            max_concurrent_flushes = config.max_concurrent_flushes,
            merge_policy = merge.name(),
            failure_policy = failure.name(),
            "Update dispatcher created"
        );

        let metrics = Arc::new(DispatcherMetrics::new());
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                pending: CoalescingMap::with_metrics(Arc::clone(&metrics)),
                gate: Arc::new(Semaphore::new(config.max_concurrent_flushes)),
                merge,
                failure,
                metrics,
                attempts: Arc::new(AttemptTracker::default()),
                config,
            }),
            runtime,
        })
    }

    /// Queues `field = value` for `target`. Never blocks and never fails;
    /// the outcome is only visible through logs and metrics.
    pub fn dispatch(
        &self,
        target: &TargetRef,
        field: impl Into<String>,
        value: impl Into<FieldValue>,
    ) {
        self.dispatch_many(target, [FieldUpdate::new(field, value)]);
    }

    pub fn dispatch_update(&self, target: &TargetRef, update: FieldUpdate) {
        self.dispatch_many(target, [update]);
    }

    /// Queues several updates for one target under a single lock acquisition
    /// and spawns one flush attempt for them.
    pub fn dispatch_many(
        &self,
        target: &TargetRef,
        updates: impl IntoIterator<Item = FieldUpdate>,
    ) {
        let updates: Vec<FieldUpdate> = updates.into_iter().collect();
        if updates.is_empty() {
            return;
        }
        let count = updates.len() as u64;

        let (key, _) = self.shared.pending.append(target, updates);
        self.shared.metrics.record_enqueued(count);

        let guard = self.shared.attempts.start();
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(async move {
            let _guard = guard;
            shared.flush_attempt(key).await;
        });
    }

    /// Resolves once every flush attempt spawned so far has finished.
    pub async fn wait_idle(&self) {
        self.shared.attempts.wait_idle().await;
    }

    pub fn pending_keys(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.shared.store
    }

    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.shared.metrics
    }

    pub fn stats(&self) -> DispatcherStats {
        let m = &self.shared.metrics;
        DispatcherStats {
            max_concurrent_flushes: self.shared.config.max_concurrent_flushes,
            available_permits: self.shared.gate.available_permits(),
            pending_keys: self.shared.pending.len(),
            outstanding_attempts: self.shared.attempts.outstanding(),
            enqueued_total: m.enqueued_total.load(Ordering::Relaxed),
            flush_attempts_total: m.flush_attempts_total.load(Ordering::Relaxed),
            noop_claims_total: m.noop_claims_total.load(Ordering::Relaxed),
            flushes_total: m.flushes_total.load(Ordering::Relaxed),
            flush_failures_total: m.flush_failures_total.load(Ordering::Relaxed),
            updates_flushed_total: m.updates_flushed_total.load(Ordering::Relaxed),
            updates_coalesced_total: m.updates_coalesced_total.load(Ordering::Relaxed),
            peak_inflight_flushes: m.peak_inflight_flushes.load(Ordering::Relaxed),
            merge_policy: self.shared.merge.name(),
            failure_policy: self.shared.failure.name(),
        }
    }
}

impl<S> Shared<S>
where
    S: PartialUpdateStore + 'static,
{
    async fn flush_attempt(&self, key: TargetKey) {
        let permit = match Arc::clone(&self.gate).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::error!(target_key = %key, error = %e, "Concurrency gate closed");
                return;
            }
        };

        let Some(batch) = self.pending.claim(&key) else {
            self.metrics.record_noop_claim();
            tracing::trace!(target_key = %key, "Batch already claimed by another attempt");
            return;
        };

        let received = batch.updates.len();
        let age_us = batch.created_at.elapsed().as_micros() as u64;
        let updates = self.merge.combine(batch.updates);
        self.metrics.record_claim(age_us, received, updates.len());

        let inflight = self.metrics.flush_started();
        let result = self.store.apply(&batch.target, &updates).await;
        let duration_us = inflight.finish(updates.len(), result.is_ok());
        drop(permit);

        match result {
            Ok(()) => {
                tracing::debug!(
                    target_key = %key,
                    received = received,
                    applied = updates.len(),
                    duration_us = duration_us,
                    "Flushed coalesced batch"
                );
            }
            Err(e) => {
                self.failure
                    .on_failure(FailedFlush::new(batch.target, updates, &e));
            }
        }
    }
}
