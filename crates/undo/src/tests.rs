use std::collections::HashMap;

use common::{Config, TableId};
use proptest::prelude::*;
use types::Value;

use super::*;

fn spilling_config(max_memory_undo: usize) -> Config {
    Config::builder()
        .max_memory_undo(max_memory_undo)
        .persistent(true)
        .mv_store(false)
        .build()
}

fn row(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| Value::Int(*v)).collect()
}

#[test]
fn add_then_get_last_peeks_without_removing() {
    let mut log = UndoLog::new(&Config::default());
    log.add(UndoEntry::insert(TableId(1), 1, row(&[1]))).unwrap();
    let peeked = log.get_last().unwrap().unwrap();
    assert_eq!(peeked.key, 1);
    // peeking twice returns the same record, not a pop.
    let peeked_again = log.get_last().unwrap().unwrap();
    assert_eq!(peeked_again.key, 1);
    assert_eq!(log.len(), 1);
}

#[test]
fn remove_last_pops_in_lifo_order_without_spill() {
    let mut log = UndoLog::new(&Config::default());
    for key in 1..=5 {
        log.add(UndoEntry::insert(TableId(1), key, row(&[key]))).unwrap();
    }
    let mut seen = Vec::new();
    while let Some(entry) = log.remove_last().unwrap() {
        seen.push(entry.key);
    }
    assert_eq!(seen, vec![5, 4, 3, 2, 1]);
    assert!(log.is_empty());
}

#[test]
fn default_config_never_spills() {
    // MV_STORE defaults to true, so the threshold is never armed.
    let mut log = UndoLog::new(&Config::default());
    for key in 0..10_000 {
        log.add(UndoEntry::insert(TableId(1), key, row(&[key]))).unwrap();
    }
    assert!(!log.has_spilled());
}

#[test]
fn exceeding_threshold_spills_to_disk() {
    let mut log = UndoLog::new(&spilling_config(2));
    for key in 1..=3 {
        log.add(UndoEntry::insert(TableId(1), key, row(&[key]))).unwrap();
    }
    assert!(log.has_spilled(), "3 records with max_memory_undo=2 must spill");
}

/// S3 (spec §8): with a small memory threshold, ten inserts followed by
/// repeated `get_last`/`remove_last` must come back in LIFO order, the
/// spilled count must shrink as records are reloaded, and the log ends up
/// fully empty with the temp file dropped.
#[test]
fn spill_and_lifo_reverse_apply_scenario() {
    let mut log = UndoLog::new(&spilling_config(2));
    for key in 1..=10 {
        log.add(UndoEntry::insert(TableId(1), key, row(&[key]))).unwrap();
    }
    assert!(log.has_spilled());

    let mut seen = Vec::new();
    let mut spilled_shrunk = false;
    let mut last_spilled = log.len() - log_in_memory_len(&log);
    while let Some(entry) = log.remove_last().unwrap() {
        seen.push(entry.key);
        let now_spilled = log.len().saturating_sub(log_in_memory_len(&log));
        if now_spilled < last_spilled {
            spilled_shrunk = true;
        }
        last_spilled = now_spilled;
    }

    assert_eq!(seen, (1..=10).rev().collect::<Vec<_>>());
    assert!(spilled_shrunk, "spilled record count must shrink as records reload");
    assert!(log.is_empty());
    assert!(!log.has_spilled(), "temp file must be dropped once fully drained");
}

fn log_in_memory_len(log: &UndoLog) -> usize {
    log.in_memory.len()
}

#[test]
fn clear_discards_everything_including_spilled_file() {
    let mut log = UndoLog::new(&spilling_config(1));
    for key in 1..=5 {
        log.add(UndoEntry::insert(TableId(1), key, row(&[key]))).unwrap();
    }
    assert!(log.has_spilled());
    log.clear();
    assert!(log.is_empty());
    assert!(!log.has_spilled());
}

/// Property #4 (spec §8): rollback — draining the log and applying each
/// record's inverse — must restore the pre-sequence table state, across a
/// variety of spill thresholds.
fn reverse_apply_roundtrip(max_memory_undo: usize, ops: &[(bool, i64)]) {
    let mut log = UndoLog::new(&spilling_config(max_memory_undo));
    let mut table: HashMap<i64, Vec<Value>> = HashMap::new();
    let before = table.clone();

    for (is_insert, key) in ops {
        if *is_insert {
            let values = row(&[*key]);
            table.insert(*key, values.clone());
            log.add(UndoEntry::insert(TableId(7), *key, values)).unwrap();
        } else {
            let prior = table.remove(key).unwrap_or_default();
            log.add(UndoEntry::delete(TableId(7), *key, prior)).unwrap();
        }
    }

    while let Some(entry) = log.remove_last().unwrap() {
        match entry.op {
            // Reversing an INSERT removes the row it added.
            UndoOp::Insert => {
                table.remove(&entry.key);
            }
            // Reversing a DELETE restores the values it captured.
            UndoOp::Delete => {
                table.insert(entry.key, entry.values);
            }
        }
    }

    assert_eq!(table, before, "rollback must restore pre-sequence state");
    assert!(log.is_empty());
}

#[test]
fn reverse_apply_restores_state_no_spill() {
    let ops = [(true, 1), (true, 2), (false, 1), (true, 3)];
    reverse_apply_roundtrip(10_000, &ops);
}

#[test]
fn reverse_apply_restores_state_spill_threshold_one() {
    let ops = [(true, 1), (true, 2), (false, 1), (true, 3), (true, 4), (false, 2)];
    reverse_apply_roundtrip(1, &ops);
}

#[test]
fn reverse_apply_restores_state_spill_threshold_two() {
    let ops: Vec<(bool, i64)> = (1..=20)
        .map(|k| (true, k))
        .chain((1..=10).map(|k| (false, k)))
        .collect();
    reverse_apply_roundtrip(2, &ops);
}

#[test]
fn undo_sink_log_add_or_remove_row_feeds_the_log() {
    let mut log = UndoLog::new(&Config::default());
    let live = common::Row::new(42, row(&[42]));
    log.log_add_or_remove_row(TableId(3), &live, true).unwrap();
    let entry = log.get_last().unwrap().unwrap();
    assert_eq!(entry.key, 42);
    assert!(matches!(entry.op, UndoOp::Insert));
}

#[test]
fn undo_sink_log_undo_and_log_truncate_are_passthroughs() {
    let mut log = UndoLog::new(&Config::default());
    log.log_undo(PageId(9), vec![1, 2, 3]).unwrap();
    log.log_truncate(TableId(1)).unwrap();
    assert!(log.is_empty());
}

#[test]
fn decode_rejects_non_positive_block_count() {
    let mut bad = vec![0u8; UNDO_BLOCK_SIZE];
    bad[0..4].copy_from_slice(&0i32.to_le_bytes());
    let err = decode_record(&bad).unwrap_err();
    assert!(matches!(err, DbError::Undo(_)));
}

#[test]
fn decode_rejects_bad_operation_code() {
    let mut bad = vec![0u8; UNDO_BLOCK_SIZE];
    bad[0..4].copy_from_slice(&1i32.to_le_bytes());
    bad[4..8].copy_from_slice(&99i32.to_le_bytes());
    let err = decode_record(&bad).unwrap_err();
    assert!(matches!(err, DbError::Undo(_)));
}

#[test]
fn encode_decode_round_trips_a_record() {
    let entry = UndoEntry::insert(TableId(5), -7, row(&[1, 2, 3]));
    let encoded = encode_record(&entry).unwrap();
    assert_eq!(encoded.len() % UNDO_BLOCK_SIZE, 0);
    let (decoded, consumed) = decode_record(&encoded).unwrap();
    assert_eq!(consumed, encoded.len());
    assert_eq!(decoded.table, TableId(5));
    assert_eq!(decoded.key, -7);
    assert_eq!(decoded.values, row(&[1, 2, 3]));
    assert!(matches!(decoded.op, UndoOp::Insert));
}

proptest! {
    #[test]
    fn reverse_apply_is_reversible_for_arbitrary_sequences(
        max_memory_undo in 1usize..5,
        keys in proptest::collection::vec(0i64..8, 1..30),
    ) {
        let mut log = UndoLog::new(&spilling_config(max_memory_undo));
        let mut table: HashMap<i64, Vec<Value>> = HashMap::new();
        let before = table.clone();

        for key in &keys {
            if table.contains_key(key) {
                let prior = table.remove(key).unwrap();
                log.add(UndoEntry::delete(TableId(1), *key, prior)).unwrap();
            } else {
                let values = row(&[*key]);
                table.insert(*key, values.clone());
                log.add(UndoEntry::insert(TableId(1), *key, values)).unwrap();
            }
        }

        while let Some(entry) = log.remove_last().unwrap() {
            match entry.op {
                UndoOp::Insert => { table.remove(&entry.key); }
                UndoOp::Delete => { table.insert(entry.key, entry.values); }
            }
        }

        prop_assert_eq!(table, before);
    }
}
