#![no_main]

use std::collections::HashSet;

use coalescer::contracts::{FieldUpdate, FieldValue, MergePolicy};
use coalescer::dispatcher::{LastWriteWins, SumIncrements};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Each 3-byte chunk is (field, kind, operand)
    let updates: Vec<FieldUpdate> = data
        .chunks_exact(3)
        .map(|chunk| {
            let field = format!("f{}", chunk[0] % 8);
            let operand = chunk[2] as i8 as i64;
            let value = match chunk[1] % 4 {
                0 => FieldValue::Set(serde_json::json!(operand)),
                1 => FieldValue::Set(serde_json::json!(format!("s{}", operand))),
                2 => FieldValue::Increment(operand * i64::from(chunk[1])),
                _ => FieldValue::Delete,
            };
            FieldUpdate::new(field, value)
        })
        .collect();

    if updates.is_empty() {
        return;
    }

    let mut fields = HashSet::new();
    for u in &updates {
        fields.insert(u.field.clone());
    }

    // Last write wins keeps only the final replacement per field and every
    // increment after it
    let merged = LastWriteWins.combine(updates.clone());
    for field in &fields {
        let kept: Vec<&FieldValue> = merged
            .iter()
            .filter(|u| &u.field == field)
            .map(|u| &u.value)
            .collect();
        let replacements = kept.iter().filter(|v| v.is_replacement()).count();
        assert!(replacements <= 1);
        if replacements == 1 {
            assert!(kept[0].is_replacement());
        }
        let last = updates.iter().rev().find(|u| &u.field == field).map(|u| &u.value);
        assert_eq!(kept.last().copied(), last);
    }

    for merged in [merged, SumIncrements.combine(updates.clone())] {
        assert!(merged.len() <= updates.len());
        for field in &fields {
            assert!(merged.iter().any(|u| &u.field == field));
        }
    }
});
