//! Lock-free histogram for flush latency and batch age.
//!
//! Buckets are cumulative so the output works with Prometheus
//! `histogram_quantile()`.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

const BUCKET_COUNT: usize = 12;

/// Bucket upper bounds in microseconds.
/// Remote document stores answer in milliseconds to seconds, so the range
/// spans 100μs to 5s.
pub const HISTOGRAM_BUCKETS: [u64; BUCKET_COUNT] = [
    100,       // 100μs
    500,       // 500μs
    1_000,     // 1ms
    5_000,     // 5ms
    10_000,    // 10ms
    25_000,    // 25ms
    50_000,    // 50ms
    100_000,   // 100ms
    250_000,   // 250ms
    500_000,   // 500ms
    1_000_000, // 1s
    5_000_000, // 5s
];

/// Histogram of microsecond observations.
///
/// # Example
///
/// ```
/// use coalescer::metrics::Histogram;
///
/// let histogram = Histogram::new();
/// histogram.observe(1_500);
///
/// let (sum, count, _) = histogram.snapshot();
/// assert_eq!(count, 1);
/// assert_eq!(sum, 1_500);
/// ```
#[derive(Debug)]
pub struct Histogram {
    sum: AtomicU64,
    count: AtomicU64,
    buckets: [AtomicU64; BUCKET_COUNT],
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    #[allow(clippy::declare_interior_mutable_const)]
    pub fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            buckets: [ZERO; BUCKET_COUNT],
        }
    }

    /// Records one observation in microseconds.
    #[inline]
    pub fn observe(&self, value_us: u64) {
        self.sum.fetch_add(value_us, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (bucket, &bound) in self.buckets.iter().zip(HISTOGRAM_BUCKETS.iter()) {
            if value_us <= bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Returns `(sum, count, cumulative_bucket_counts)`.
    pub fn snapshot(&self) -> (u64, u64, [u64; BUCKET_COUNT]) {
        let mut buckets = [0u64; BUCKET_COUNT];
        for (slot, bucket) in buckets.iter_mut().zip(self.buckets.iter()) {
            *slot = bucket.load(Ordering::Relaxed);
        }
        (
            self.sum.load(Ordering::Relaxed),
            self.count.load(Ordering::Relaxed),
            buckets,
        )
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Mean observation, or 0 when nothing was recorded.
    pub fn mean(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            0
        } else {
            self.sum() / count
        }
    }

    pub fn format_prometheus(&self, name: &str, help: &str) -> String {
        let (sum, count, buckets) = self.snapshot();
        let mut output = String::with_capacity(1024);

        let _ = writeln!(output, "# HELP {} {}", name, help);
        let _ = writeln!(output, "# TYPE {} histogram", name);
        for (bound, value) in HISTOGRAM_BUCKETS.iter().zip(buckets.iter()) {
            let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", name, bound, value);
        }
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
        let _ = writeln!(output, "{}_sum {}", name, sum);
        let _ = writeln!(output, "{}_count {}", name, count);

        output
    }
}
