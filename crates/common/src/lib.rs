
use std::cell::Cell;

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use types::Value;

/// Identifier for a column within a table schema.
pub type ColumnId = u32;

/// Pseudo-column that aliases a row's key, the `ROWID` escape hatch indexes
/// expose alongside their declared columns.
pub const ROWID_COLUMN: ColumnId = ColumnId::MAX;

/// Logical identifier for a page in the storage layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// Logical identifier for a table registered in the catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId(pub u64);

/// Pointer to a row stored inside a page-store-managed page: the page holding
/// it plus a slot offset within that page. Index leaf entries (both the
/// B-tree and the hash index) carry `RecordId`s rather than embedding rows
/// directly, so a row can move between compaction passes without forcing
/// every index that references it to be rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: u16,
}

/// A row as seen by the scan index and the data B-tree: either a live tuple
/// of values keyed by a 64-bit row key, or a tombstone occupying a freed
/// slot and pointing at the next free slot in the chain.
///
/// `values()` returning `None` is the only "is this a tombstone" test —
/// there is no separate boolean flag to fall out of sync with the variant.
#[derive(Clone, Debug)]
pub enum Row {
    Live(LiveRow),
    Removed(RemovedRow),
}

#[derive(Clone, Debug)]
pub struct LiveRow {
    pub key: i64,
    pub values: Vec<Value>,
    /// Cached memory estimate in bytes; `-1` means uncomputed.
    pub memory_estimate: Cell<i64>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RemovedRow {
    pub next_free: i64,
}

impl Row {
    pub fn new(key: i64, values: Vec<Value>) -> Self {
        Row::Live(LiveRow {
            key,
            values,
            memory_estimate: Cell::new(-1),
        })
    }

    pub fn removed(next_free: i64) -> Self {
        Row::Removed(RemovedRow { next_free })
    }

    pub fn key(&self) -> i64 {
        match self {
            Row::Live(r) => r.key,
            Row::Removed(r) => r.next_free,
        }
    }

    pub fn set_key(&mut self, key: i64) {
        match self {
            Row::Live(r) => r.key = key,
            Row::Removed(r) => r.next_free = key,
        }
    }

    /// Returns `None` exactly when this row is a tombstone.
    pub fn values(&self) -> Option<&[Value]> {
        match self {
            Row::Live(r) => Some(&r.values),
            Row::Removed(_) => None,
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, Row::Removed(_))
    }

    /// Exponentially-smoothed memory estimate: a plain running mean for the
    /// first `MEMORY_FACTOR` samples, then `avg + (x - avg) / MEMORY_FACTOR`
    /// afterwards.
    pub fn memory_estimate(&self) -> i64 {
        match self {
            Row::Live(r) => r.memory_estimate.get(),
            Row::Removed(_) => 0,
        }
    }

    pub fn set_memory_estimate(&self, estimate: i64) {
        if let Row::Live(r) = self {
            r.memory_estimate.set(estimate);
        }
    }
}

/// Canonical error type shared across database subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("catalog: {0}")]
    Catalog(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("undo log: {0}")]
    Undo(String),
    #[error("optimizer: {0}")]
    Optimizer(String),
    #[error("off-heap store: {0}")]
    OffHeap(String),
    #[error("stream: {0}")]
    Stream(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration shared across the storage engine's subsystems.
///
/// # Example
/// ```
/// use common::Config;
///
/// let config = Config::builder()
///     .page_size(4096)
///     .cache_capacity_bytes(1 << 20)
///     .max_memory_undo(1024)
///     .build();
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Fixed-size page allocation in bytes (the immutable page size).
    #[builder(default = 4096)]
    pub page_size: usize,
    /// Resident capacity of the block read cache, in bytes.
    #[builder(default = 1 << 20)]
    pub cache_capacity_bytes: usize,
    /// In-memory undo record threshold before the undo log spills to a temp
    /// file.
    #[builder(default = 1024)]
    pub max_memory_undo: usize,
    /// Filter-count ceiling below which the join-order optimizer searches
    /// every permutation exhaustively.
    #[builder(default = 7)]
    pub max_brute_force_filters: usize,
    /// Iteration cap for the join-order optimizer's genetic search.
    #[builder(default = 500)]
    pub max_genetic_iterations: usize,
    /// Total permutation budget for the optimizer's partial brute force.
    #[builder(default = 2000)]
    pub max_brute_force: usize,
    /// Whether the page store backs a multi-version store. Controls
    /// undo-log spill eligibility.
    #[builder(default = true)]
    pub mv_store: bool,
    /// Whether the database is persistent (vs. purely in-memory); also
    /// gates undo-log spill eligibility.
    #[builder(default = true)]
    pub persistent: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity_bytes: 1 << 20,
            max_memory_undo: 1024,
            max_brute_force_filters: 7,
            max_genetic_iterations: 500,
            max_brute_force: 2000,
            mv_store: true,
            persistent: true,
        }
    }
}

/// External collaborator contract for LOB handling: large values get
/// intercepted on the way into a data index and registered for cleanup on
/// rollback. LOB materialization itself is out of scope; this is the named
/// seam the data index consumes.
pub trait LobStorage {
    /// Copy an external LOB value into index-owned storage, returning an
    /// opaque handle the index can persist in place of the original value.
    fn adopt(&mut self, table: TableId, value: &Value) -> DbResult<Value>;
    /// Release a previously-adopted LOB on rollback.
    fn release(&mut self, table: TableId, value: &Value) -> DbResult<()>;
}

/// No-op `LobStorage` for configurations without LOB columns.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLobStorage;

impl LobStorage for NullLobStorage {
    fn adopt(&mut self, _table: TableId, value: &Value) -> DbResult<Value> {
        Ok(value.clone())
    }

    fn release(&mut self, _table: TableId, _value: &Value) -> DbResult<()> {
        Ok(())
    }
}

/// Named external collaborator seam for the page store's undo-logging hooks
/// (spec §4.3: `logUndo`, `logAddOrRemoveRow`, `logTruncate`). The page store
/// itself has no notion of sessions or transactions — it calls back into
/// whatever implements this trait, which in practice is the per-session
/// undo log. Kept here rather than in `storage` so neither `storage` nor
/// `undo` needs to depend on the other.
pub trait UndoSink {
    /// Record the pre-image of a page about to be overwritten.
    fn log_undo(&mut self, page: PageId, prev_image: Vec<u8>) -> DbResult<()>;
    /// Record a row insert (`insert = true`) or delete (`insert = false`).
    fn log_add_or_remove_row(&mut self, table: TableId, row: &Row, insert: bool) -> DbResult<()>;
    /// Record a whole-table truncate.
    fn log_truncate(&mut self, table: TableId) -> DbResult<()>;
}

/// `UndoSink` that discards everything: used when a store is opened without
/// an owning session (e.g. bulk load, or the scan index's fallback tables).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUndoSink;

impl UndoSink for NullUndoSink {
    fn log_undo(&mut self, _page: PageId, _prev_image: Vec<u8>) -> DbResult<()> {
        Ok(())
    }
    fn log_add_or_remove_row(&mut self, _table: TableId, _row: &Row, _insert: bool) -> DbResult<()> {
        Ok(())
    }
    fn log_truncate(&mut self, _table: TableId) -> DbResult<()> {
        Ok(())
    }
}

/// Lightweight counters surfaced by the execution layer for observability;
/// not consulted by any correctness-critical path in the core.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub rows_examined: u64,
    pub pages_read: u64,
    pub pages_written: u64,
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        Config, DbError, DbResult, ExecutionStats, LiveRow, NullUndoSink, PageId, RecordId,
        RemovedRow, Row, TableId, UndoSink, ROWID_COLUMN,
    };
    pub use types::{SqlType, Value};
}
