use super::*;
use catalog::IndexId;
use common::{NullUndoSink, PageId, RecordId, TableId};
use storage::MemPagedFile;

fn rid(slot: u16) -> RecordId {
    RecordId {
        page_id: PageId(0),
        slot,
    }
}

fn small_index() -> BTreeIndex<MemPagedFile> {
    // Force splits every few entries, the way scenario S1 forces them with a
    // small index page size.
    BTreeIndex::create(MemPagedFile::default(), IndexId(1), 4, 4).unwrap()
}

#[test]
fn create_empty_index_has_no_rows() {
    let mut index = small_index();
    assert_eq!(index.row_count(), 0);
    assert!(index.find(None, None).unwrap().is_empty());
}

#[test]
fn insert_and_find_single_key() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    let r = rid(0);
    index.add(&mut sink, TableId(1), 42, r).unwrap();

    let found = index.find(Some(42), Some(42)).unwrap();
    assert_eq!(found, vec![(42, r)]);
    assert_eq!(index.row_count(), 1);
}

/// Invariant 2 / scenario S1: keys come back from `find` in ascending order
/// regardless of insertion order, even once enough entries have forced
/// several splits and the tree has grown past one level.
#[test]
fn ascending_order_preserved_across_splits_any_insertion_order() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    let mut keys: Vec<i64> = (0..200).collect();
    // deterministic shuffle: reverse every other chunk of 7
    for chunk in keys.chunks_mut(7) {
        if chunk.len() == 7 {
            chunk.reverse();
        }
    }
    for (i, &k) in keys.iter().enumerate() {
        index.add(&mut sink, TableId(1), k + 1, rid(i as u16))
            .unwrap();
    }

    let found = index.find(None, None).unwrap();
    let returned_keys: Vec<i64> = found.iter().map(|(k, _)| *k).collect();
    let mut expected: Vec<i64> = keys.iter().map(|k| k + 1).collect();
    expected.sort_unstable();
    assert_eq!(returned_keys, expected);
    assert_eq!(index.row_count(), 200);
}

#[test]
fn duplicate_explicit_key_is_rejected() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    index.add(&mut sink, TableId(1), 7, rid(0)).unwrap();
    let err = index.add(&mut sink, TableId(1), 7, rid(1)).unwrap_err();
    assert!(matches!(err, DbError::Constraint(_)));
    assert_eq!(index.row_count(), 1);
}

#[test]
fn auto_assigned_keys_increment_from_last_key() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    let k1 = index.add(&mut sink, TableId(1), 0, rid(0)).unwrap();
    let k2 = index.add(&mut sink, TableId(1), 0, rid(1)).unwrap();
    assert!(k2 > k1);
    assert_eq!(index.last_key(), k2);
}

#[test]
fn remove_drops_entry_and_row_count() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    index.add(&mut sink, TableId(1), 1, rid(0)).unwrap();
    index.add(&mut sink, TableId(1), 2, rid(1)).unwrap();
    assert_eq!(index.row_count(), 2);

    let removed = index.remove(&mut sink, TableId(1), 1).unwrap();
    assert!(removed);
    assert_eq!(index.row_count(), 1);
    assert!(index.find(Some(1), Some(1)).unwrap().is_empty());
    assert_eq!(index.find(Some(2), Some(2)).unwrap(), vec![(2, rid(1))]);
}

#[test]
fn remove_missing_key_is_a_noop() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    index.add(&mut sink, TableId(1), 1, rid(0)).unwrap();
    let removed = index.remove(&mut sink, TableId(1), 99).unwrap();
    assert!(!removed);
    assert_eq!(index.row_count(), 1);
}

/// Spec §4.6: removing the tree's last row replaces the root with a fresh
/// empty leaf page rather than leaving a tombstoned/emptied entry behind in
/// the existing leaf.
#[test]
fn removing_last_row_resets_root_to_a_fresh_empty_leaf() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    index.add(&mut sink, TableId(1), 1, rid(0)).unwrap();
    let old_root = index.root;

    let removed = index.remove(&mut sink, TableId(1), 1).unwrap();
    assert!(removed);
    assert_eq!(index.row_count(), 0);
    assert_ne!(index.root, old_root, "root page must be replaced, not reused");
    assert!(index.find(None, None).unwrap().is_empty());

    // The fresh root is usable for further inserts.
    index.add(&mut sink, TableId(1), 5, rid(1)).unwrap();
    assert_eq!(index.find(Some(5), Some(5)).unwrap(), vec![(5, rid(1))]);
}

#[test]
fn range_find_respects_both_bounds() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    for k in 1..=50 {
        index.add(&mut sink, TableId(1), k, rid(k as u16)).unwrap();
    }
    let found = index.find(Some(10), Some(20)).unwrap();
    let keys: Vec<i64> = found.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, (10..=20).collect::<Vec<_>>());
}

#[test]
fn flush_succeeds_after_mutation() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    index.add(&mut sink, TableId(1), 1, rid(0)).unwrap();
    index.flush().unwrap();
}

#[test]
fn memory_per_page_tracks_node_growth() {
    let mut index = small_index();
    let mut sink = NullUndoSink;
    assert_eq!(index.memory_per_page(), 0.0);
    for k in 1..=20 {
        index.add(&mut sink, TableId(1), k, rid(k as u16)).unwrap();
    }
    assert!(index.memory_per_page() > 0.0);
}
