//! C5 — Scan Index and Tombstone Freelist.
//!
//! The fallback table-scan access path: a dense, append-mostly array of
//! rows addressed by slot, with removed slots linked into a LIFO freelist
//! (`first_free`) so a later `add` reuses the most recently vacated slot
//! before growing the array (spec §4.5).

use common::{DbError, DbResult, Row};
use types::Value;

/// Base cost the join-order optimizer (C9) adds on top of row count for a
/// full scan through this index (spec §4.9's `COST_ROW_OFFSET`).
pub const COST_ROW_OFFSET: i64 = 2;

/// Sentinel meaning "no free slot" — the head of an empty freelist.
const NO_FREE_SLOT: i64 = -1;

pub struct ScanIndex {
    rows: Vec<Row>,
    first_free: i64,
    row_count: u64,
}

impl Default for ScanIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanIndex {
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            first_free: NO_FREE_SLOT,
            row_count: 0,
        }
    }

    /// Number of live rows (tombstones don't count).
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Total slots, live or tombstoned — the array's current length.
    pub fn slot_count(&self) -> usize {
        self.rows.len()
    }

    /// Cost of a full scan through this index: row count plus a fixed
    /// per-scan offset (spec §4.9).
    pub fn cost(&self) -> i64 {
        COST_ROW_OFFSET + self.row_count as i64
    }

    /// Insert `values`, reusing the most recently freed slot if one exists,
    /// otherwise appending a new slot. Returns the assigned slot.
    pub fn add(&mut self, values: Vec<Value>) -> i64 {
        let slot = if self.first_free != NO_FREE_SLOT {
            let slot = self.first_free;
            self.first_free = match &self.rows[slot as usize] {
                Row::Removed(r) => r.next_free,
                Row::Live(_) => {
                    unreachable!("freelist head {slot} pointed at a live row")
                }
            };
            self.rows[slot as usize] = Row::new(slot, values);
            slot
        } else {
            let slot = self.rows.len() as i64;
            self.rows.push(Row::new(slot, values));
            slot
        };
        self.row_count += 1;
        slot
    }

    /// Remove `slot`: if it's the last live row in the table, clear the
    /// entire index back to its empty state (spec §4.5); otherwise
    /// tombstone it, threading it onto the head of the freelist.
    pub fn remove(&mut self, slot: i64) -> DbResult<()> {
        let row = self.rows.get_mut(usize::try_from(slot).map_err(|_| {
            DbError::Storage(format!("scan index: invalid slot {slot}"))
        })?).ok_or_else(|| DbError::Storage(format!("scan index: slot {slot} out of range")))?;
        if row.is_removed() {
            return Err(DbError::Storage(format!(
                "scan index: slot {slot} already removed"
            )));
        }
        if self.row_count == 1 {
            self.rows.clear();
            self.first_free = NO_FREE_SLOT;
            self.row_count = 0;
            return Ok(());
        }
        *row = Row::removed(self.first_free);
        self.first_free = slot;
        self.row_count -= 1;
        Ok(())
    }

    /// Live values at `slot`, or `None` if the slot is tombstoned or out of
    /// range.
    pub fn get(&self, slot: i64) -> Option<&[Value]> {
        let idx = usize::try_from(slot).ok()?;
        self.rows.get(idx).and_then(|r| r.values())
    }

    /// The next live slot at or after `from`, skipping tombstones — the
    /// primitive a full-table scan iterates with.
    pub fn get_next_row(&self, from: i64) -> Option<i64> {
        let start = usize::try_from(from.max(0)).ok()?;
        self.rows[start.min(self.rows.len())..]
            .iter()
            .enumerate()
            .find(|(_, r)| !r.is_removed())
            .map(|(i, _)| (start + i) as i64)
    }
}
