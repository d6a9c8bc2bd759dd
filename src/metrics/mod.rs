//! Observability metrics for the dispatcher.
//!
//! Lock-free atomics rendered in Prometheus exposition format.

pub mod histogram;
pub mod registry;

pub use histogram::Histogram;
pub use registry::{DispatcherMetrics, InflightFlush};
