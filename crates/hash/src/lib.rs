//! C7 — Hash Index.
//!
//! A pure in-memory, non-unique, equality-only index. Spec §4.7: no disk
//! residency, no range scans — `find` requires `first == last`. Two storage
//! backends are supported depending on whether the indexed value type's
//! equality is hash-safe: a `hashbrown` map for types whose `Eq`/`Hash`
//! contract always agrees with their natural ordering (everything
//! `types::Value` represents today), or a sorted map keyed by the declared
//! comparator for value types where that isn't true (e.g. floating point
//! with NaN) and hashing would silently duplicate/lose entries.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use catalog::IndexId;
use common::{DbError, DbResult, RecordId};
use hashbrown::HashMap;
use types::Value;

/// Cost the join-order optimizer (C9) assigns an equality lookup through
/// this index.
pub const COST_EQUALITY: i64 = 2;
/// Cost signaling "this index cannot serve the given condition set at all".
pub const COST_UNUSABLE: i64 = i64::MAX;

/// The single condition type a hash index can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexCondition {
    Equality,
    Range,
}

/// Cost model for a hash index: usable (cost [`COST_EQUALITY`]) only when
/// every condition offered against it is an equality; any range condition
/// makes it [`COST_UNUSABLE`] (spec §4.7 / §4.9).
pub fn cost(conditions: &[IndexCondition]) -> i64 {
    if !conditions.is_empty() && conditions.iter().all(|c| *c == IndexCondition::Equality) {
        COST_EQUALITY
    } else {
        COST_UNUSABLE
    }
}

/// Wraps a `Value` so it can key a `BTreeMap` via the declared
/// same-type comparator. Two values that cannot be compared (different
/// variants) are never expected to coexist in one index — all entries share
/// the index's declared `SqlType` — so `cmp` treats that case as `Equal`
/// rather than panicking, falling back to the variant's declaration order.
#[derive(Clone, Debug, PartialEq, Eq)]
struct OrderedValue(Value);

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_same_type(&other.0).unwrap_or(Ordering::Equal)
    }
}

enum Backing {
    Hashed(HashMap<Value, Vec<RecordId>>),
    Sorted(BTreeMap<OrderedValue, Vec<RecordId>>),
}

/// An in-memory, non-unique, equality-only index over a single column.
pub struct HashIndex {
    pub index_id: IndexId,
    backing: Backing,
    row_count: u64,
}

impl HashIndex {
    /// Build a hash-backed index: the default, since every `Value` variant
    /// we support has an `Eq`/`Hash` contract consistent with its ordering.
    pub fn new_hashed(index_id: IndexId) -> Self {
        Self {
            index_id,
            backing: Backing::Hashed(HashMap::new()),
            row_count: 0,
        }
    }

    /// Build a sorted-map-backed index for value types whose equality isn't
    /// hash-safe.
    pub fn new_sorted(index_id: IndexId) -> Self {
        Self {
            index_id,
            backing: Backing::Sorted(BTreeMap::new()),
            row_count: 0,
        }
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Insert `value -> rid`. Non-unique: repeated inserts of the same
    /// value accumulate into one bucket rather than erroring.
    pub fn add(&mut self, value: Value, rid: RecordId) {
        match &mut self.backing {
            Backing::Hashed(map) => map.entry(value).or_default().push(rid),
            Backing::Sorted(map) => map.entry(OrderedValue(value)).or_default().push(rid),
        }
        self.row_count += 1;
    }

    /// Remove one `(value, rid)` pair. Returns `true` if an entry was
    /// removed. An empty bucket after removal is dropped from the map.
    pub fn remove(&mut self, value: &Value, rid: RecordId) -> bool {
        let removed = match &mut self.backing {
            Backing::Hashed(map) => remove_from_bucket(map.get_mut(value), rid, || {
                map.remove(value);
            }),
            Backing::Sorted(map) => {
                let key = OrderedValue(value.clone());
                remove_from_bucket(map.get_mut(&key), rid, || {
                    map.remove(&key);
                })
            }
        };
        if removed {
            self.row_count = self.row_count.saturating_sub(1);
        }
        removed
    }

    /// Equality lookup. Spec §4.7: `first` and `last` must be equal — a
    /// hash index cannot serve a range.
    pub fn find(&self, first: &Value, last: &Value) -> DbResult<Vec<RecordId>> {
        if first != last {
            return Err(DbError::Constraint(
                "hash index find requires first == last (equality only)".into(),
            ));
        }
        Ok(match &self.backing {
            Backing::Hashed(map) => map.get(first).cloned().unwrap_or_default(),
            Backing::Sorted(map) => map
                .get(&OrderedValue(first.clone()))
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// Remove `rid` from a bucket returned by `get_mut`. Drops the bucket's
/// entry entirely (via `on_empty`) once the last matching id is removed, so
/// a subsequent `find` sees a clean miss rather than an empty `Vec`.
fn remove_from_bucket(
    bucket: Option<&mut Vec<RecordId>>,
    rid: RecordId,
    on_empty: impl FnOnce(),
) -> bool {
    let Some(bucket) = bucket else {
        return false;
    };
    let before = bucket.len();
    bucket.retain(|r| *r != rid);
    let removed = bucket.len() != before;
    if removed && bucket.is_empty() {
        on_empty();
    }
    removed
}
