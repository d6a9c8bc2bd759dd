use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use coalescer::contracts::{FieldUpdate, FieldValue, MergePolicy, PartialUpdateStore, TargetRef};
use coalescer::dispatcher::{Dispatcher, DispatcherConfig, LastWriteWins, SumIncrements};
use coalescer::storage::{Document, MemoryStore};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime should build")
}

/// Applies `updates` one call at a time and returns the resulting document.
fn apply_sequentially(rt: &tokio::runtime::Runtime, updates: &[FieldUpdate]) -> Option<Document> {
    let store = MemoryStore::new();
    let target = TargetRef::doc("events", "e1");
    rt.block_on(async {
        for update in updates {
            store
                .apply(&target, std::slice::from_ref(update))
                .await
                .expect("numeric updates never fail");
        }
    });
    store.document(&target)
}

// =============================================================================
// Merge policies
// =============================================================================

/// Property: last-write-wins keeps at most one replacement per field, placed
/// before any increments kept for that field, and the field's final update
/// always survives.
pub fn prop_last_write_wins_keeps_latest(updates: Vec<FieldUpdate>) {
    let mut latest: HashMap<String, FieldValue> = HashMap::new();
    for u in &updates {
        latest.insert(u.field.clone(), u.value.clone());
    }

    let merged = LastWriteWins.combine(updates);

    for (field, last) in &latest {
        let kept: Vec<&FieldValue> = merged
            .iter()
            .filter(|u| &u.field == field)
            .map(|u| &u.value)
            .collect();
        assert_eq!(kept.last().copied(), Some(last));
        let replacements: Vec<usize> = kept
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_replacement())
            .map(|(i, _)| i)
            .collect();
        assert!(replacements.is_empty() || replacements == vec![0]);
    }
}

/// Property: a merge policy produces the same document as applying every
/// update on its own.
pub fn prop_policy_preserves_semantics<P: MergePolicy>(
    rt: &tokio::runtime::Runtime,
    policy: &P,
    updates: Vec<FieldUpdate>,
) {
    let expected = apply_sequentially(rt, &updates);
    let merged = policy.combine(updates.clone());
    assert!(merged.len() <= updates.len());
    let actual = apply_sequentially(rt, &merged);
    assert_eq!(actual, expected, "{} changed the outcome", policy.name());
}

// =============================================================================
// Dispatcher
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Dispatch { target: usize, field: usize },
    Yield,
}

/// Property: every dispatched update is flushed exactly once unless a later
/// update to the same field superseded it, and the store ends with the latest
/// value per field.
pub fn prop_no_lost_or_duplicated_updates(ops: Vec<Op>, max_concurrent_flushes: usize) {
    let rt = runtime();
    let store = Arc::new(MemoryStore::new());

    rt.block_on(async {
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            DispatcherConfig::with_max_concurrent_flushes(max_concurrent_flushes),
        )
        .unwrap();

        for (seq, op) in ops.iter().enumerate() {
            match op {
                Op::Dispatch { target, field } => dispatcher.dispatch(
                    &TargetRef::doc("events", &format!("e{}", target)),
                    format!("f{}", field),
                    json!(seq),
                ),
                Op::Yield => tokio::task::yield_now().await,
            }
        }
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.pending_keys(), 0);
    });

    // seq -> number of calls carrying it
    let mut flushed: HashMap<usize, usize> = HashMap::new();
    for call in store.calls() {
        assert!(!call.updates.is_empty());
        for update in &call.updates {
            let FieldValue::Set(value) = &update.value else {
                panic!("only Set values were dispatched");
            };
            let seq = value.as_u64().unwrap() as usize;
            let Op::Dispatch { target, field } = &ops[seq] else {
                panic!("seq {} was not a dispatch", seq);
            };
            assert_eq!(call.target.path(), format!("events/e{}", target));
            assert_eq!(update.field, format!("f{}", field));
            *flushed.entry(seq).or_insert(0) += 1;
        }
    }

    assert!(flushed.values().all(|&n| n == 1), "an update was flushed twice");

    let mut last_seq: HashMap<(usize, usize), usize> = HashMap::new();
    for (seq, op) in ops.iter().enumerate() {
        if let Op::Dispatch { target, field } = op {
            last_seq.insert((*target, *field), seq);
        }
    }
    for (seq, op) in ops.iter().enumerate() {
        if let Op::Dispatch { target, field } = op {
            let superseded = last_seq[&(*target, *field)] > seq;
            assert!(
                flushed.contains_key(&seq) || superseded,
                "update {} was lost",
                seq
            );
        }
    }
    for ((target, field), seq) in last_seq {
        let doc = TargetRef::doc("events", &format!("e{}", target));
        assert_eq!(store.field(&doc, &format!("f{}", field)), Some(json!(seq)));
    }
}

// =============================================================================
// Strategies
// =============================================================================

fn arb_field() -> impl Strategy<Value = String> {
    (0..4usize).prop_map(|i| format!("f{}", i))
}

fn arb_numeric_update() -> impl Strategy<Value = FieldUpdate> {
    (
        arb_field(),
        prop_oneof![
            (-1000i64..1000).prop_map(|n| FieldValue::Set(json!(n))),
            (-50i64..50).prop_map(FieldValue::Increment),
            Just(FieldValue::Delete),
        ],
    )
        .prop_map(|(field, value)| FieldUpdate::new(field, value))
}

fn arb_any_update() -> impl Strategy<Value = FieldUpdate> {
    (
        arb_field(),
        prop_oneof![
            any::<i64>().prop_map(|n| FieldValue::Set(json!(n))),
            "[a-z]{0,6}".prop_map(|s| FieldValue::Set(json!(s))),
            any::<i64>().prop_map(FieldValue::Increment),
            Just(FieldValue::Delete),
        ],
    )
        .prop_map(|(field, value)| FieldUpdate::new(field, value))
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            4 => (0..3usize, 0..3usize).prop_map(|(target, field)| Op::Dispatch { target, field }),
            1 => Just(Op::Yield),
        ],
        1..80,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn test_last_write_wins_keeps_latest(
            updates in prop::collection::vec(arb_any_update(), 1..40)
        ) {
            prop_last_write_wins_keeps_latest(updates);
        }

        #[test]
        fn test_last_write_wins_preserves_semantics(
            updates in prop::collection::vec(arb_numeric_update(), 1..30)
        ) {
            prop_policy_preserves_semantics(&runtime(), &LastWriteWins, updates);
        }

        #[test]
        fn test_sum_increments_preserves_semantics(
            updates in prop::collection::vec(arb_numeric_update(), 1..30)
        ) {
            prop_policy_preserves_semantics(&runtime(), &SumIncrements, updates);
        }

        #[test]
        fn test_merge_policies_never_panic(
            updates in prop::collection::vec(arb_any_update(), 1..40)
        ) {
            let _ = LastWriteWins.combine(updates.clone());
            let merged = SumIncrements.combine(updates.clone());
            prop_assert!(!merged.is_empty());
            prop_assert!(merged.len() <= updates.len());
        }

        #[test]
        fn test_no_lost_or_duplicated_updates(
            ops in arb_ops(),
            max_concurrent_flushes in 1..5usize
        ) {
            prop_no_lost_or_duplicated_updates(ops, max_concurrent_flushes);
        }
    }
}
