use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{Map, Number, Value};

use crate::contracts::{FieldUpdate, FieldValue, PartialUpdateStore, StoreError, TargetRef};

pub type Document = Map<String, Value>;

/// Configuration for the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreConfig {
    /// Simulated round-trip time of every `apply` call.
    pub latency: Duration,
    /// Fail with `NotFound` when updating a document that does not exist,
    /// instead of creating it.
    pub require_existing: bool,
}

impl MemoryStoreConfig {
    /// Creates a config from environment variables.
    ///
    /// Environment variables:
    /// - `COALESCER_STORE_LATENCY_MS`: simulated latency per call (default: 0)
    /// - `COALESCER_STORE_REQUIRE_EXISTING`: reject updates to missing documents (default: false)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            latency: std::env::var("COALESCER_STORE_LATENCY_MS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.latency),
            require_existing: std::env::var("COALESCER_STORE_REQUIRE_EXISTING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default.require_existing),
        }
    }
}

/// One recorded `apply` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyCall {
    pub target: TargetRef,
    pub updates: Vec<FieldUpdate>,
    pub outcome: Result<(), StoreError>,
}

/// Concurrent in-memory document store.
///
/// Applies a batch all-or-nothing, records every call and tracks how many
/// calls ran at the same time. Failures can be injected per document.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: MemoryStoreConfig,
    documents: DashMap<String, Document>,
    injected_failures: DashMap<String, usize>,
    calls: Mutex<Vec<ApplyCall>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self::with_config(MemoryStoreConfig {
            latency,
            ..MemoryStoreConfig::default()
        })
    }

    pub fn config(&self) -> &MemoryStoreConfig {
        &self.config
    }

    /// Creates or replaces a document.
    pub fn insert_document(&self, target: &TargetRef, document: Document) {
        self.documents.insert(target.key(), document);
    }

    pub fn document(&self, target: &TargetRef) -> Option<Document> {
        self.documents.get(target.path()).map(|d| d.clone())
    }

    pub fn field(&self, target: &TargetRef, field: &str) -> Option<Value> {
        self.documents
            .get(target.path())
            .and_then(|d| d.get(field).cloned())
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Makes the next `times` calls for `target` fail with `Unavailable`.
    pub fn fail_next(&self, target: &TargetRef, times: usize) {
        *self.injected_failures.entry(target.key()).or_insert(0) += times;
    }

    pub fn calls(&self) -> Vec<ApplyCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, target: &TargetRef) -> Vec<ApplyCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| &c.target == target)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Highest number of `apply` calls that were executing at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn take_injected_failure(&self, path: &str) -> bool {
        match self.injected_failures.get_mut(path) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn apply_now(&self, target: &TargetRef, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        if self.take_injected_failure(target.path()) {
            return Err(StoreError::Unavailable(format!(
                "injected failure for {}",
                target
            )));
        }

        match self.documents.entry(target.key()) {
            Entry::Occupied(mut entry) => {
                let mut document = entry.get().clone();
                apply_updates(&mut document, updates)?;
                *entry.get_mut() = document;
            }
            Entry::Vacant(entry) => {
                if self.config.require_existing {
                    return Err(StoreError::NotFound(target.to_string()));
                }
                let mut document = Document::new();
                apply_updates(&mut document, updates)?;
                entry.insert(document);
            }
        }
        Ok(())
    }
}

impl PartialUpdateStore for MemoryStore {
    async fn apply(&self, target: &TargetRef, updates: &[FieldUpdate]) -> Result<(), StoreError> {
        let _active = ActiveCall::enter(&self.active, &self.peak);

        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }

        let outcome = self.apply_now(target, updates);
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ApplyCall {
                target: target.clone(),
                updates: updates.to_vec(),
                outcome: outcome.clone(),
            });
        outcome
    }
}

struct ActiveCall<'a> {
    active: &'a AtomicUsize,
}

impl<'a> ActiveCall<'a> {
    fn enter(active: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { active }
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn apply_updates(document: &mut Document, updates: &[FieldUpdate]) -> Result<(), StoreError> {
    for update in updates {
        match &update.value {
            FieldValue::Set(value) => {
                document.insert(update.field.clone(), value.clone());
            }
            FieldValue::Delete => {
                document.remove(&update.field);
            }
            FieldValue::Increment(delta) => {
                let current = document.get(&update.field).unwrap_or(&Value::Null);
                let next = increment(current, *delta).ok_or_else(|| {
                    StoreError::Rejected(format!(
                        "cannot increment field {} holding {}",
                        update.field, current
                    ))
                })?;
                document.insert(update.field.clone(), next);
            }
        }
    }
    Ok(())
}

fn increment(current: &Value, delta: i64) -> Option<Value> {
    match current {
        Value::Null => Some(Value::from(delta)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.checked_add(delta).map(Value::from)
            } else if let Some(u) = n.as_u64() {
                u.checked_add_signed(delta).map(Value::from)
            } else {
                n.as_f64()
                    .and_then(|f| Number::from_f64(f + delta as f64))
                    .map(Value::Number)
            }
        }
        _ => None,
    }
}
