//! C8 — Undo Log.
//!
//! A per-session ordered list of undo records (spec §4.8): held entirely in
//! memory until the in-memory count exceeds `max_memory_undo`, at which
//! point the whole list spills to a temp file as one or more
//! [`FILE_BLOCK_SIZE`]-aligned, self-delimiting records. `get_last` walks
//! the list from the tail, pulling a batch back from disk (and truncating
//! the file behind it) when memory is empty; `remove_last` pops the
//! in-memory tail produced by the most recent `get_last`.
//!
//! Spill is gated on three conditions (spec §4.8): the in-memory count
//! exceeds the configured threshold, the database is persistent, and the
//! store is *not* multi-versioned (`mv_store == false` — `MV_STORE`
//! defaults to `true` in `common::Config`, so most configurations never
//! spill; see DESIGN.md).

#[cfg(test)]
mod tests;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use common::{Config, DbError, DbResult, PageId, Row, TableId, UndoSink};
use serde::{Deserialize, Serialize};
use types::Value;

/// Alignment unit for spilled undo records, matching the stream crate's
/// `FILE_BLOCK_SIZE` (spec §4.8: "aligned to FILE_BLOCK_SIZE").
pub const UNDO_BLOCK_SIZE: usize = 4096;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

/// The two operations an undo record can reverse (spec §3: INSERT, DELETE —
/// table truncation is logged through the page store's separate
/// `log_truncate` hook, not as a row-level record; see DESIGN.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoOp {
    Insert,
    Delete,
}

/// Where a record currently lives, per spec §3's undo record lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UndoState {
    /// Never spilled; lives only in the in-memory list.
    InMemory,
    /// Spilled once, then pulled back into memory as a rehydration
    /// prefetch; its cached `file_pos` no longer points at live data
    /// because the region it occupied has since been truncated away.
    InMemoryInvalid,
    /// Loaded fresh from the temp file by the current `get_last` call.
    Stored,
}

/// One undo record: the operation to reverse, which table and row it
/// touched, and (for a reversed DELETE) the column values to reinsert.
#[derive(Clone, Debug)]
pub struct UndoEntry {
    pub op: UndoOp,
    pub table: TableId,
    pub key: i64,
    pub values: Vec<Value>,
    pub state: UndoState,
    pub file_pos: Option<u64>,
}

impl UndoEntry {
    pub fn insert(table: TableId, key: i64, values: Vec<Value>) -> Self {
        Self {
            op: UndoOp::Insert,
            table,
            key,
            values,
            state: UndoState::InMemory,
            file_pos: None,
        }
    }

    pub fn delete(table: TableId, key: i64, values: Vec<Value>) -> Self {
        Self {
            op: UndoOp::Delete,
            table,
            key,
            values,
            state: UndoState::InMemory,
            file_pos: None,
        }
    }
}

/// Per-session undo log. Not `Sync`/`Send` beyond what `std::fs::File`
/// already gives — spec §5 treats the log as single-owner, non-thread-safe
/// state the session envelope serializes access to.
pub struct UndoLog {
    /// The live tail of the log: either records that never left memory, or
    /// records most recently pulled back from the temp file by `get_last`.
    in_memory: Vec<UndoEntry>,
    /// Count of `in_memory` entries still in state `InMemory` (i.e. not
    /// counted against a prior spill) — the quantity compared against
    /// `max_memory_undo` to decide whether to spill again.
    memory_undo_count: usize,
    /// Start offsets of spilled batches still on disk, oldest first.
    stored_entries_pos: Vec<u64>,
    /// Count of records currently on disk (not reflected in `in_memory`).
    spilled_count: usize,
    /// Logical end of file (also the next spill's write offset).
    file_length: u64,
    /// Created on first spill; dropping it deletes the backing file
    /// (`tempfile::tempfile` unlinks its anonymous file immediately on
    /// platforms that support it).
    temp_file: Option<File>,
    max_memory_undo: usize,
    persistent: bool,
    mv_store: bool,
}

impl UndoLog {
    pub fn new(config: &Config) -> Self {
        Self {
            in_memory: Vec::new(),
            memory_undo_count: 0,
            stored_entries_pos: Vec::new(),
            spilled_count: 0,
            file_length: 0,
            temp_file: None,
            max_memory_undo: config.max_memory_undo,
            persistent: config.persistent,
            mv_store: config.mv_store,
        }
    }

    /// Total record count, in memory plus spilled.
    pub fn len(&self) -> usize {
        self.in_memory.len() + self.spilled_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any records have ever been spilled to disk this session.
    pub fn has_spilled(&self) -> bool {
        self.temp_file.is_some()
    }

    /// Append a record. May trigger a spill (spec §4.8) if the in-memory
    /// count now exceeds `max_memory_undo` and the store is configured for
    /// it (persistent, non-MV-store).
    pub fn add(&mut self, mut entry: UndoEntry) -> DbResult<()> {
        entry.state = UndoState::InMemory;
        entry.file_pos = None;
        self.in_memory.push(entry);
        self.memory_undo_count += 1;
        if self.memory_undo_count > self.max_memory_undo && self.persistent && !self.mv_store {
            self.spill()?;
        }
        Ok(())
    }

    /// Peek the most recently added record still in the log, pulling a
    /// batch back from the temp file (and shrinking it) if memory is
    /// currently empty. Spec §4.8.
    pub fn get_last(&mut self) -> DbResult<Option<UndoEntry>> {
        if self.in_memory.is_empty() {
            let Some(pos) = self.stored_entries_pos.pop() else {
                return Ok(None);
            };
            let mut entries = self.load_batch(pos)?;
            for e in entries.iter_mut() {
                e.state = UndoState::Stored;
                e.file_pos = Some(pos);
            }
            self.spilled_count = self.spilled_count.saturating_sub(entries.len());
            self.in_memory.extend(entries);

            if matches!(
                self.in_memory.last().map(|e| e.state),
                Some(UndoState::Stored)
            ) {
                self.rehydrate_predecessors()?;
            }
        }
        Ok(self.in_memory.last().cloned())
    }

    /// Pop the trailing record (loading it first via `get_last` if
    /// necessary). Only decrements the memory-undo counter when the popped
    /// record was never spilled — a record rehydrated from disk doesn't
    /// count against the spill threshold again. Spec §4.8.
    pub fn remove_last(&mut self) -> DbResult<Option<UndoEntry>> {
        if self.get_last()?.is_none() {
            return Ok(None);
        }
        let entry = self.in_memory.pop();
        if let Some(e) = &entry {
            if e.state == UndoState::InMemory {
                self.memory_undo_count = self.memory_undo_count.saturating_sub(1);
            }
        }
        if self.in_memory.is_empty() && self.stored_entries_pos.is_empty() {
            self.spilled_count = 0;
            self.temp_file = None;
            self.file_length = 0;
        }
        Ok(entry)
    }

    /// Discard the whole log without applying it — the commit-time
    /// lifecycle transition from spec §3 ("held in memory until the
    /// session commits (cleared)..."). Drops the temp file, deleting it.
    pub fn clear(&mut self) {
        self.in_memory.clear();
        self.stored_entries_pos.clear();
        self.spilled_count = 0;
        self.memory_undo_count = 0;
        self.temp_file = None;
        self.file_length = 0;
    }

    fn spill(&mut self) -> DbResult<()> {
        if self.in_memory.is_empty() {
            return Ok(());
        }
        if self.temp_file.is_none() {
            self.temp_file = Some(tempfile::tempfile()?);
            log::debug!("undo log spilling to temp file for the first time");
        }
        let entries = std::mem::take(&mut self.in_memory);
        let count = entries.len();
        let mut buf = Vec::new();
        let mut batch_start = self.file_length;
        for entry in &entries {
            buf.extend_from_slice(&encode_record(entry)?);
            if buf.len() >= UNDO_BLOCK_SIZE {
                self.flush_batch(batch_start, &buf)?;
                batch_start = self.file_length;
                buf.clear();
            }
        }
        if !buf.is_empty() {
            self.flush_batch(batch_start, &buf)?;
        }
        self.spilled_count += count;
        self.memory_undo_count = 0;
        log::trace!("undo log spilled {count} record(s), {} total on disk", self.spilled_count);
        Ok(())
    }

    fn flush_batch(&mut self, pos: u64, buf: &[u8]) -> DbResult<()> {
        let file = self
            .temp_file
            .as_mut()
            .expect("temp file created before the first flush");
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(buf)?;
        self.stored_entries_pos.push(pos);
        self.file_length = pos + buf.len() as u64;
        Ok(())
    }

    /// Read `[pos, file_length)`, decode every self-delimiting record in
    /// it, then truncate the file back to `pos` — the bytes now live only
    /// in the returned `Vec`.
    fn load_batch(&mut self, pos: u64) -> DbResult<Vec<UndoEntry>> {
        let file = self
            .temp_file
            .as_mut()
            .ok_or_else(|| DbError::Undo("get_last: stored entry but no temp file".into()))?;
        let len = (self.file_length - pos) as usize;
        let mut buf = vec![0u8; len];
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf)?;
        file.set_len(pos)?;
        file.seek(SeekFrom::Start(pos))?;
        self.file_length = pos;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < buf.len() {
            let (entry, consumed) = decode_record(&buf[offset..])?;
            offset += consumed;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// After loading the newest spilled batch, proactively pull back
    /// earlier batches too (spec §4.8: "re-hydrate up to
    /// `maxMemoryUndo/2` predecessors"), so a run of `get_last`/`remove_last`
    /// calls doesn't re-hit the disk once per record. Predecessors are
    /// marked `InMemoryInvalid` since their `file_pos` no longer points at
    /// live data once this truncates the file further.
    fn rehydrate_predecessors(&mut self) -> DbResult<()> {
        let target = self.max_memory_undo / 2;
        let mut fetched = 0usize;
        while fetched < target {
            let Some(pos) = self.stored_entries_pos.pop() else {
                break;
            };
            let mut entries = self.load_batch(pos)?;
            for e in entries.iter_mut() {
                e.state = UndoState::InMemoryInvalid;
                e.file_pos = Some(pos);
            }
            self.spilled_count = self.spilled_count.saturating_sub(entries.len());
            fetched += entries.len();
            entries.extend(std::mem::take(&mut self.in_memory));
            self.in_memory = entries;
        }
        Ok(())
    }
}

impl UndoSink for UndoLog {
    /// Page pre-image capture (spec §4.3's `logUndo`) is a page-store-level
    /// concern distinct from this log's row-level record format — §4.8's
    /// record layout has no slot for a raw page image. Under the default
    /// `MV_STORE = true` configuration, page pre-images are superseded by
    /// the multi-version store entirely, so this hook is a passthrough; see
    /// DESIGN.md.
    fn log_undo(&mut self, page: PageId, _prev_image: Vec<u8>) -> DbResult<()> {
        log::trace!("undo: log_undo passthrough for page {page:?}");
        Ok(())
    }

    fn log_add_or_remove_row(&mut self, table: TableId, row: &Row, insert: bool) -> DbResult<()> {
        let values = row.values().map(|v| v.to_vec()).unwrap_or_default();
        let entry = if insert {
            UndoEntry::insert(table, row.key(), values)
        } else {
            UndoEntry::delete(table, row.key(), values)
        };
        self.add(entry)
    }

    /// Table truncation has no row-level undo representation in spec §3's
    /// operation enum (`{INSERT, DELETE}` only); a real engine recovers a
    /// truncated table via a whole-root-page undo image through
    /// `log_undo`, not a per-row record here. See DESIGN.md.
    fn log_truncate(&mut self, table: TableId) -> DbResult<()> {
        log::trace!("undo: log_truncate passthrough for table {table:?}");
        Ok(())
    }
}

/// Encode one record: `block_count | operation | table_id | row_key |
/// column_count | Value[column_count]`, zero-padded to the next
/// `UNDO_BLOCK_SIZE` multiple (spec §4.8). `block_count` is written last
/// logically but first on the wire so a reader can size its buffer before
/// decoding anything else.
fn encode_record(entry: &UndoEntry) -> DbResult<Vec<u8>> {
    let mut body = Vec::new();
    let op = match entry.op {
        UndoOp::Insert => 0i32,
        UndoOp::Delete => 1i32,
    };
    body.extend_from_slice(&op.to_le_bytes());
    body.extend_from_slice(&entry.table.0.to_le_bytes());
    body.extend_from_slice(&entry.key.to_le_bytes());
    body.extend_from_slice(&(entry.values.len() as i32).to_le_bytes());
    for value in &entry.values {
        let encoded = bincode::serde::encode_to_vec(value, bincode_config())
            .map_err(|e| DbError::Undo(format!("encode undo value failed: {e}")))?;
        body.extend_from_slice(&encoded);
    }

    let total_len = 4 + body.len();
    let block_count = total_len.div_ceil(UNDO_BLOCK_SIZE).max(1);
    let padded_len = block_count * UNDO_BLOCK_SIZE;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(&(block_count as i32).to_le_bytes());
    out.extend_from_slice(&body);
    out.resize(padded_len, 0);
    Ok(out)
}

/// Decode one record from the front of `buf`, returning it plus the number
/// of bytes consumed (`block_count * UNDO_BLOCK_SIZE`, per the self-
/// delimiting contract spec §6 calls out for the undo record format).
fn decode_record(buf: &[u8]) -> DbResult<(UndoEntry, usize)> {
    if buf.len() < 4 {
        return Err(DbError::Undo("truncated undo record: missing header".into()));
    }
    let block_count = i32::from_le_bytes(buf[0..4].try_into().unwrap());
    if block_count <= 0 {
        return Err(DbError::Undo(format!(
            "corrupted undo record: non-positive block count {block_count}"
        )));
    }
    let total_len = block_count as usize * UNDO_BLOCK_SIZE;
    if buf.len() < total_len {
        return Err(DbError::Undo(format!(
            "truncated undo record: expected {total_len} bytes, have {}",
            buf.len()
        )));
    }

    let mut offset = 4;
    let op = match i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) {
        0 => UndoOp::Insert,
        1 => UndoOp::Delete,
        other => {
            return Err(DbError::Undo(format!(
                "corrupted undo record: bad operation code {other}"
            )))
        }
    };
    offset += 4;
    let table = TableId(u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap()));
    offset += 8;
    let key = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    offset += 8;
    let column_count = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
    if column_count < 0 {
        return Err(DbError::Undo("corrupted undo record: negative column count".into()));
    }
    offset += 4;

    let mut values = Vec::with_capacity(column_count as usize);
    for _ in 0..column_count {
        let (value, consumed): (Value, usize) =
            bincode::serde::decode_from_slice(&buf[offset..], bincode_config())
                .map_err(|e| DbError::Undo(format!("decode undo value failed: {e}")))?;
        offset += consumed;
        values.push(value);
    }

    Ok((
        UndoEntry {
            op,
            table,
            key,
            values,
            state: UndoState::Stored,
            file_pos: None,
        },
        total_len,
    ))
}
