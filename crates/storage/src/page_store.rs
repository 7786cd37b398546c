//! C3 — Page Store.
//!
//! Sits on top of a [`PagedFile`] (a raw disk file, an in-memory region, or
//! a [`buffer`]-crate cache wrapping either) and adds: a bitmap free-page
//! allocator, a root-page registry per index id, page-type dispatch, dirty
//! tracking, and the undo/row-logging hooks the data index (C6) and hash
//! index (C7) call into on every mutation.

use std::collections::HashMap;

use common::{DbError, DbResult, PageId, TableId, UndoSink};
use serde::{Deserialize, Serialize};

use crate::channel::PagedFile;
use crate::PAGE_SIZE;

/// Reserved bytes at the front of every page for the header. Generous
/// relative to the header's actual encoded size so the encoding never has
/// to be revisited as fields are added.
const HEADER_RESERVED: usize = 64;

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

/// The role a page plays. Spec §6: `LEAF, NODE, OVERFLOW, STREAM_TRUNK,
/// STREAM_DATA, META`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageKind {
    Leaf,
    Node,
    Overflow,
    StreamTrunk,
    StreamData,
    Meta,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PageHeader {
    kind: PageKind,
    parent: Option<PageId>,
    /// Monotonically-maintained row-count hint for leaves/subtrees (spec §6).
    row_count_hint: u32,
}

/// A page as handed back by [`PageStore::get_page`]: typed, with its parent
/// link and a mutable payload region callers serialize their own node
/// layout into.
#[derive(Clone, Debug)]
pub struct StoredPage {
    pub id: PageId,
    pub kind: PageKind,
    pub parent: Option<PageId>,
    pub row_count_hint: u32,
    pub payload: Vec<u8>,
}

impl StoredPage {
    fn encode(&self) -> DbResult<Vec<u8>> {
        if self.payload.len() != PAGE_SIZE - HEADER_RESERVED {
            return Err(DbError::Storage(format!(
                "page {} payload must be exactly {} bytes",
                self.id.0,
                PAGE_SIZE - HEADER_RESERVED
            )));
        }
        let header = PageHeader {
            kind: self.kind,
            parent: self.parent,
            row_count_hint: self.row_count_hint,
        };
        let mut buf = vec![0u8; PAGE_SIZE];
        bincode::serde::encode_into_slice(&header, &mut buf[..HEADER_RESERVED], bincode_config())
            .map_err(|e| DbError::Storage(format!("encode page header failed: {e}")))?;
        buf[HEADER_RESERVED..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    fn decode(id: PageId, buf: &[u8]) -> DbResult<Self> {
        let (header, _): (PageHeader, usize) =
            bincode::serde::decode_from_slice(&buf[..HEADER_RESERVED], bincode_config())
                .map_err(|e| {
                    DbError::Storage(format!(
                        "page {}: FILE_CORRUPTED_1 (bad header: {e})",
                        id.0
                    ))
                })?;
        Ok(StoredPage {
            id,
            kind: header.kind,
            parent: header.parent,
            row_count_hint: header.row_count_hint,
            payload: buf[HEADER_RESERVED..].to_vec(),
        })
    }

    fn empty(id: PageId, kind: PageKind, parent: Option<PageId>) -> Self {
        StoredPage {
            id,
            kind,
            parent,
            row_count_hint: 0,
            payload: vec![0u8; PAGE_SIZE - HEADER_RESERVED],
        }
    }
}

/// Lifecycle state for an allocated page slot (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Allocated,
    Dirty,
    Clean,
}

/// The paged store: allocator + type dispatch + dirty tracking atop any
/// [`PagedFile`].
pub struct PageStore<F: PagedFile> {
    file: F,
    /// `true` at an index means that page id is free for reuse.
    free_bitmap: Vec<bool>,
    slot_state: HashMap<PageId, SlotState>,
    /// Root page per index id, persisted conceptually in a meta page; kept
    /// in memory here and the caller is responsible for persisting it (e.g.
    /// by serializing it into a reserved meta page on close).
    roots: HashMap<u64, PageId>,
    change_count: u64,
}

impl<F: PagedFile> PageStore<F> {
    pub fn new(file: F) -> Self {
        Self {
            file,
            free_bitmap: Vec::new(),
            slot_state: HashMap::new(),
            roots: HashMap::new(),
            change_count: 0,
        }
    }

    /// Allocate a page of the given kind, preferring a freed slot from the
    /// bitmap before growing the underlying file.
    pub fn allocate_page(&mut self, kind: PageKind, parent: Option<PageId>) -> DbResult<PageId> {
        let id = if let Some(idx) = self.free_bitmap.iter().position(|&free| free) {
            self.free_bitmap[idx] = false;
            PageId(idx as u32)
        } else {
            let id = self.file.allocate()?;
            if self.free_bitmap.len() <= id.0 as usize {
                self.free_bitmap.resize(id.0 as usize + 1, false);
            }
            id
        };
        let page = StoredPage::empty(id, kind, parent);
        self.file.write(id, &page.encode()?)?;
        self.slot_state.insert(id, SlotState::Allocated);
        self.increment_change_count();
        Ok(id)
    }

    /// Fetch a page, verifying it is the expected type. A type mismatch is
    /// the storage-corruption case from spec §4.3/§7: fatal, with page-id
    /// context (`FILE_CORRUPTED_1`).
    pub fn get_page(&mut self, id: PageId, expected: PageKind) -> DbResult<StoredPage> {
        let page = self.get_page_any(id)?;
        if std::mem::discriminant(&page.kind) != std::mem::discriminant(&expected) {
            return Err(DbError::Storage(format!(
                "FILE_CORRUPTED_1: page {} expected {:?}, found {:?}",
                id.0, expected, page.kind
            )));
        }
        Ok(page)
    }

    /// Fetch a page without asserting its type; used by callers (e.g. the
    /// stream reader walking a trunk/data chain) that dispatch on the
    /// returned kind themselves.
    pub fn get_page_any(&mut self, id: PageId) -> DbResult<StoredPage> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.file.read(id, &mut buf)?;
        StoredPage::decode(id, &buf)
    }

    /// Mark a page dirty and write it through immediately. The page store
    /// does not defer writes past this call — caching, if any, lives below
    /// in the `PagedFile` the store was constructed with.
    pub fn update(&mut self, page: &StoredPage) -> DbResult<()> {
        self.file.write(page.id, &page.encode()?)?;
        self.slot_state.insert(page.id, SlotState::Dirty);
        self.increment_change_count();
        Ok(())
    }

    /// Transition every `Dirty` slot to `Clean` and sync the backing file.
    pub fn flush(&mut self) -> DbResult<()> {
        for state in self.slot_state.values_mut() {
            if *state == SlotState::Dirty {
                *state = SlotState::Clean;
            }
        }
        self.file.sync()
    }

    /// Return a page to the free pool: zero it (so a stray read sees an
    /// empty page rather than stale bytes) and mark the bitmap slot free.
    pub fn free(&mut self, id: PageId) -> DbResult<()> {
        self.file.write(id, &vec![0u8; PAGE_SIZE])?;
        if self.free_bitmap.len() <= id.0 as usize {
            self.free_bitmap.resize(id.0 as usize + 1, false);
        }
        self.free_bitmap[id.0 as usize] = true;
        self.slot_state.remove(&id);
        self.increment_change_count();
        log::trace!("page {} freed", id.0);
        Ok(())
    }

    pub fn root(&self, index_id: u64) -> Option<PageId> {
        self.roots.get(&index_id).copied()
    }

    pub fn set_root(&mut self, index_id: u64, root: PageId) {
        self.roots.insert(index_id, root);
    }

    /// Store-global monotonic counter, bumped on every mutating call. A
    /// happens-after point for optimistic read validation by higher layers
    /// (spec §5).
    pub fn change_count(&self) -> u64 {
        self.change_count
    }

    fn increment_change_count(&mut self) {
        self.change_count += 1;
    }

    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync()
    }

    /// Forward a page pre-image to the session's undo log (spec §4.3
    /// `logUndo`).
    pub fn log_undo(&self, sink: &mut impl UndoSink, page: PageId, prev_image: Vec<u8>) -> DbResult<()> {
        sink.log_undo(page, prev_image)
    }

    /// Forward a row mutation to the session's undo log (`logAddOrRemoveRow`).
    pub fn log_add_or_remove_row(
        &self,
        sink: &mut impl UndoSink,
        table: TableId,
        row: &common::Row,
        insert: bool,
    ) -> DbResult<()> {
        sink.log_add_or_remove_row(table, row, insert)
    }

    /// Forward a table truncate to the session's undo log (`logTruncate`).
    pub fn log_truncate(&self, sink: &mut impl UndoSink, table: TableId) -> DbResult<()> {
        sink.log_truncate(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemPagedFile;

    #[test]
    fn allocate_then_get_round_trips_kind_and_parent() {
        let mut store = PageStore::new(MemPagedFile::default());
        let root = store.allocate_page(PageKind::Node, None).unwrap();
        let leaf = store.allocate_page(PageKind::Leaf, Some(root)).unwrap();

        let fetched = store.get_page(leaf, PageKind::Leaf).unwrap();
        assert_eq!(fetched.parent, Some(root));
        assert_eq!(store.change_count(), 2);
    }

    #[test]
    fn wrong_kind_fetch_is_fatal() {
        let mut store = PageStore::new(MemPagedFile::default());
        let page = store.allocate_page(PageKind::Leaf, None).unwrap();
        let err = store.get_page(page, PageKind::Node).unwrap_err();
        assert!(format!("{err}").contains("FILE_CORRUPTED_1"));
    }

    #[test]
    fn free_then_reuse_recycles_page_id() {
        let mut store = PageStore::new(MemPagedFile::default());
        let a = store.allocate_page(PageKind::Leaf, None).unwrap();
        store.free(a).unwrap();
        let b = store.allocate_page(PageKind::Overflow, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn payload_round_trips() {
        let mut store = PageStore::new(MemPagedFile::default());
        let id = store.allocate_page(PageKind::Leaf, None).unwrap();
        let mut page = store.get_page(id, PageKind::Leaf).unwrap();
        page.payload[0] = 7;
        page.payload[1] = 9;
        store.update(&page).unwrap();

        let reloaded = store.get_page(id, PageKind::Leaf).unwrap();
        assert_eq!(reloaded.payload[0], 7);
        assert_eq!(reloaded.payload[1], 9);
    }

    #[test]
    fn root_registry_tracks_per_index_roots() {
        let mut store = PageStore::new(MemPagedFile::default());
        let r1 = store.allocate_page(PageKind::Leaf, None).unwrap();
        let r2 = store.allocate_page(PageKind::Leaf, None).unwrap();
        store.set_root(1, r1);
        store.set_root(2, r2);
        assert_eq!(store.root(1), Some(r1));
        assert_eq!(store.root(2), Some(r2));
        assert_eq!(store.root(3), None);
    }
}
