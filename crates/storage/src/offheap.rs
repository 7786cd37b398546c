//! C10 — Off-Heap Page Backing.
//!
//! A sorted map of directly-allocated buffers, addressed by byte position,
//! standing in for the page store's disk file when a table lives entirely
//! off-heap. Spec §4.10.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use common::{DbError, DbResult};

/// Sorted-map-backed off-heap store. Every entry is keyed by its starting
/// byte position; entries never overlap.
#[derive(Debug, Default)]
pub struct OffHeapStore {
    entries: BTreeMap<u64, Vec<u8>>,
    pub read_count: AtomicU64,
    pub read_bytes: AtomicU64,
    pub write_count: AtomicU64,
    pub write_bytes: AtomicU64,
}

impl OffHeapStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the entry whose key is the greatest address `<= pos`.
    fn containing_entry(&self, pos: u64) -> Option<(u64, &Vec<u8>)> {
        self.entries
            .range(..=pos)
            .next_back()
            .map(|(k, v)| (*k, v))
    }

    /// Read `len` bytes starting at `pos`. Fails if no entry covers the
    /// whole range.
    pub fn read_fully(&self, pos: u64, len: usize) -> DbResult<Vec<u8>> {
        let (start, buf) = self
            .containing_entry(pos)
            .ok_or_else(|| DbError::OffHeap(format!("ERROR_READING_FAILED: no entry covers {pos}")))?;
        let offset = (pos - start) as usize;
        if offset + len > buf.len() {
            return Err(DbError::OffHeap(format!(
                "ERROR_READING_FAILED: entry at {start} does not cover [{pos}, {})",
                pos + len as u64
            )));
        }
        self.read_count.fetch_add(1, Ordering::Relaxed);
        self.read_bytes.fetch_add(len as u64, Ordering::Relaxed);
        Ok(buf[offset..offset + len].to_vec())
    }

    /// Write `src` at `pos`. Overwrites in place only when an entry starts
    /// exactly at `pos` with exactly `src.len()` capacity; a write that
    /// starts strictly inside an existing entry is rejected (partial
    /// overwrite is unsupported); otherwise a fresh buffer is allocated.
    pub fn write_fully(&mut self, pos: u64, src: &[u8]) -> DbResult<()> {
        if let Some(existing) = self.entries.get(&pos) {
            if existing.len() == src.len() {
                self.entries.insert(pos, src.to_vec());
                self.write_count.fetch_add(1, Ordering::Relaxed);
                self.write_bytes.fetch_add(src.len() as u64, Ordering::Relaxed);
                return Ok(());
            }
        } else if let Some((start, buf)) = self.containing_entry(pos) {
            if pos > start && pos < start + buf.len() as u64 {
                return Err(DbError::OffHeap(format!(
                    "ERROR_READING_FAILED: partial overwrite of entry at {start} rejected"
                )));
            }
        }
        self.entries.insert(pos, src.to_vec());
        self.write_count.fetch_add(1, Ordering::Relaxed);
        self.write_bytes.fetch_add(src.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Return `[pos, pos + len)` to the free pool. Only a frees an entry
    /// whose bounds exactly match; a partial free is rejected.
    pub fn free(&mut self, pos: u64, len: usize) -> DbResult<()> {
        match self.entries.get(&pos) {
            Some(buf) if buf.len() == len => {
                self.entries.remove(&pos);
                Ok(())
            }
            Some(buf) => Err(DbError::OffHeap(format!(
                "partial free rejected: entry at {pos} has length {}, asked to free {len}",
                buf.len()
            ))),
            None => Err(DbError::OffHeap(format!("no entry at {pos} to free"))),
        }
    }

    /// Remove every entry at or beyond `size`. Rejects a truncation that
    /// would cut an existing buffer in half.
    pub fn truncate(&mut self, size: u64) -> DbResult<()> {
        if let Some((start, buf)) = self.containing_entry(size.saturating_sub(1)) {
            if start < size && start + buf.len() as u64 > size {
                return Err(DbError::OffHeap(format!(
                    "truncate at {size} would partially cut entry at {start}"
                )));
            }
        }
        self.entries.retain(|&k, _| k < size);
        Ok(())
    }
}
