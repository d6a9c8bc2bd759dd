//! Counters and gauges for the dispatcher.
//!
//! Everything is an atomic so recording from flush tasks never contends
//! with the coalescing lock.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::Histogram;

#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Field updates accepted by `dispatch`
    pub enqueued_total: AtomicU64,
    /// Flush attempts spawned (one per dispatch call)
    pub flush_attempts_total: AtomicU64,
    /// Attempts that found their key already claimed
    pub noop_claims_total: AtomicU64,
    /// Store calls that succeeded
    pub flushes_total: AtomicU64,
    /// Store calls that failed
    pub flush_failures_total: AtomicU64,
    /// Field updates sent to the store after merging
    pub updates_flushed_total: AtomicU64,
    /// Field updates folded away by the merge policy
    pub updates_coalesced_total: AtomicU64,
    /// Keys with a pending batch
    pub pending_keys: AtomicU64,
    /// Store calls currently executing
    pub inflight_flushes: AtomicU64,
    /// Highest value `inflight_flushes` has reached
    pub peak_inflight_flushes: AtomicU64,
    /// Store call latency in microseconds
    pub flush_duration_us: Histogram,
    /// Time between batch creation and claim, in microseconds
    pub batch_age_us: Histogram,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_enqueued(&self, updates: u64) {
        self.enqueued_total.fetch_add(updates, Ordering::Relaxed);
        self.flush_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_noop_claim(&self) {
        self.noop_claims_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_pending_keys(&self, keys: usize) {
        self.pending_keys.store(keys as u64, Ordering::Relaxed);
    }

    /// Records a claimed batch and how much the merge policy shrank it.
    #[inline]
    pub fn record_claim(&self, age_us: u64, received: usize, merged: usize) {
        self.batch_age_us.observe(age_us);
        self.updates_coalesced_total
            .fetch_add(received.saturating_sub(merged) as u64, Ordering::Relaxed);
    }

    /// Marks a store call as started and updates the peak.
    ///
    /// The returned guard leaves the in-flight gauge on drop, so a store
    /// call that panics is still counted out (as a failure).
    pub fn flush_started(&self) -> InflightFlush<'_> {
        let now = self.inflight_flushes.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_inflight_flushes.fetch_max(now, Ordering::AcqRel);
        InflightFlush {
            metrics: self,
            started: Instant::now(),
            finished: false,
        }
    }

    fn record_outcome(&self, updates: usize, duration_us: u64, ok: bool) {
        self.flush_duration_us.observe(duration_us);
        if ok {
            self.flushes_total.fetch_add(1, Ordering::Relaxed);
            self.updates_flushed_total
                .fetch_add(updates as u64, Ordering::Relaxed);
        } else {
            self.flush_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn format_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        let counters = [
            (
                "coalescer_enqueued_total",
                "Field updates accepted for dispatch",
                &self.enqueued_total,
            ),
            (
                "coalescer_flush_attempts_total",
                "Flush attempts spawned",
                &self.flush_attempts_total,
            ),
            (
                "coalescer_noop_claims_total",
                "Flush attempts that found nothing to flush",
                &self.noop_claims_total,
            ),
            (
                "coalescer_flushes_total",
                "Successful partial-update calls",
                &self.flushes_total,
            ),
            (
                "coalescer_flush_failures_total",
                "Failed partial-update calls",
                &self.flush_failures_total,
            ),
            (
                "coalescer_updates_flushed_total",
                "Field updates written to the store",
                &self.updates_flushed_total,
            ),
            (
                "coalescer_updates_coalesced_total",
                "Field updates merged away before flushing",
                &self.updates_coalesced_total,
            ),
        ];
        for (name, help, value) in counters {
            write_metric(&mut output, name, help, "counter", value);
        }

        let gauges = [
            (
                "coalescer_pending_keys",
                "Targets with a pending batch",
                &self.pending_keys,
            ),
            (
                "coalescer_inflight_flushes",
                "Partial-update calls in progress",
                &self.inflight_flushes,
            ),
            (
                "coalescer_peak_inflight_flushes",
                "Highest number of concurrent partial-update calls",
                &self.peak_inflight_flushes,
            ),
        ];
        for (name, help, value) in gauges {
            write_metric(&mut output, name, help, "gauge", value);
        }

        output.push_str(&self.flush_duration_us.format_prometheus(
            "coalescer_flush_duration_us",
            "Partial-update call latency in microseconds",
        ));
        output.push_str(&self.batch_age_us.format_prometheus(
            "coalescer_batch_age_us",
            "Age of a batch when it was claimed, in microseconds",
        ));

        output
    }
}

/// One store call in flight. See [`DispatcherMetrics::flush_started`].
#[must_use = "dropping the guard ends the flush immediately"]
pub struct InflightFlush<'a> {
    metrics: &'a DispatcherMetrics,
    started: Instant,
    finished: bool,
}

impl InflightFlush<'_> {
    /// Records the outcome and returns the call duration in microseconds.
    pub fn finish(mut self, updates: usize, ok: bool) -> u64 {
        let duration_us = self.started.elapsed().as_micros() as u64;
        self.metrics.record_outcome(updates, duration_us, ok);
        self.finished = true;
        duration_us
    }
}

impl Drop for InflightFlush<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_flushes.fetch_sub(1, Ordering::AcqRel);
        if !self.finished {
            let duration_us = self.started.elapsed().as_micros() as u64;
            self.metrics.record_outcome(0, duration_us, false);
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, kind: &str, value: &AtomicU64) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
    let _ = writeln!(output, "{} {}", name, value.load(Ordering::Relaxed));
}
