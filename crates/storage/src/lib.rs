//! Paged storage core: C1 (paged file), C3 (page store), and C10 (off-heap
//! backing) from the storage/execution engine spec.
//!
//! Layering: `channel::PagedFile` is the page-aligned I/O seam shared by a
//! disk file, an in-memory file, and (via `buffer::BlockCache`, a separate
//! crate) a cached wrapper around either. `page_store::PageStore` is
//! generic over any `PagedFile` and adds allocation, type dispatch, and
//! undo/row-logging hooks on top.

pub mod channel;
pub mod offheap;
pub mod page_store;


use common::DbResult;

/// Store-wide immutable page size (spec §3). Equal to `CACHE_BLOCK_SIZE`
/// used by the block read cache (C2), which is why a cache block and a page
/// always align.
pub const PAGE_SIZE: usize = 4096;

pub use channel::{DiskPagedFile, MemPagedFile, OpenMode, PagedFile};
pub use offheap::OffHeapStore;
pub use page_store::{PageKind, PageStore, StoredPage};

/// Named external collaborator from spec §6: block streams ask this to
/// compress/expand record payloads without knowing which algorithm is
/// configured. The algorithm name itself is never stored in the record —
/// the caller is responsible for picking the same `CompressTool` on read
/// that it used on write.
pub trait CompressTool {
    fn compress(&self, buf: &[u8]) -> DbResult<Vec<u8>>;
    fn expand(&self, src: &[u8], dst: &mut [u8]) -> DbResult<()>;
}

/// Named external collaborator from spec §1: the trace/logging sink pages
/// and streams report interesting events to. Deliberately thin — a real
/// trace sink lives outside this core; `NullTrace` is for tests and
/// contexts that don't care.
pub trait Trace {
    fn event(&self, msg: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrace;

impl Trace for NullTrace {
    fn event(&self, _msg: &str) {}
}
