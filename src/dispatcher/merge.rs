//! Value-combination strategies applied to a claimed batch.

use std::collections::HashMap;

use serde_json::{Number, Value};

use crate::contracts::{FieldUpdate, FieldValue, MergePolicy};

/// Last write wins among replacements: a `Set` or `Delete` supersedes every
/// earlier entry for its field. `Increment` entries after the latest
/// replacement are additive and kept as separate operations, in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl MergePolicy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last_write_wins"
    }

    fn combine(&self, updates: Vec<FieldUpdate>) -> Vec<FieldUpdate> {
        let mut merged: Vec<Option<FieldUpdate>> = Vec::with_capacity(updates.len());
        let mut live: HashMap<String, Vec<usize>> = HashMap::new();

        for update in updates {
            let slots = live.entry(update.field.clone()).or_default();
            if update.value.is_replacement() {
                for slot in slots.drain(..) {
                    merged[slot] = None;
                }
            }
            slots.push(merged.len());
            merged.push(Some(update));
        }
        merged.into_iter().flatten().collect()
    }
}

/// Folds increments into the preceding value for the same field where the
/// result is unambiguous; everything else is kept in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SumIncrements;

impl MergePolicy for SumIncrements {
    fn name(&self) -> &'static str {
        "sum_increments"
    }

    fn combine(&self, updates: Vec<FieldUpdate>) -> Vec<FieldUpdate> {
        let mut merged: Vec<Option<FieldUpdate>> = Vec::with_capacity(updates.len());
        let mut live: HashMap<String, Vec<usize>> = HashMap::new();

        for update in updates {
            let slots = live.entry(update.field.clone()).or_default();

            if update.value.is_replacement() {
                for slot in slots.drain(..) {
                    merged[slot] = None;
                }
            } else if let Some(&last) = slots.last() {
                if let Some(prev) = merged[last].as_mut() {
                    if let Some(folded) = fold(&prev.value, &update.value) {
                        prev.value = folded;
                        continue;
                    }
                }
            }

            slots.push(merged.len());
            merged.push(Some(update));
        }
        merged.into_iter().flatten().collect()
    }
}

/// Combines `prev` followed by `next` into one value, if possible.
fn fold(prev: &FieldValue, next: &FieldValue) -> Option<FieldValue> {
    let FieldValue::Increment(delta) = next else {
        return Some(next.clone());
    };

    match prev {
        FieldValue::Increment(a) => a.checked_add(*delta).map(FieldValue::Increment),
        FieldValue::Delete => Some(FieldValue::Set(Value::from(*delta))),
        FieldValue::Set(Value::Number(n)) => add_to_number(n, *delta).map(FieldValue::Set),
        FieldValue::Set(_) => None,
    }
}

fn add_to_number(n: &Number, delta: i64) -> Option<Value> {
    if let Some(i) = n.as_i64() {
        return i.checked_add(delta).map(Value::from);
    }
    if let Some(u) = n.as_u64() {
        return u.checked_add_signed(delta).map(Value::from);
    }
    n.as_f64()
        .and_then(|f| Number::from_f64(f + delta as f64))
        .map(Value::Number)
}
