//! C4 — Buffered Block Streams.
//!
//! A logical byte stream multiplexed over a chain of `StreamData` pages
//! (spec §6), written and read through a length-prefixed record framing:
//! plain records carry `int32 len | bytes`; compressed records carry
//! `int32 compressed_len | int32 uncompressed_len | bytes`. The stream
//! never picks a compression algorithm itself — callers hand it a
//! [`storage::CompressTool`] (or `None`) on both the write and the matching
//! read, the same way the spec's external-collaborator seam works for the
//! rest of the core. A clean `close` appends a `-1` length marker; a reader
//! that reaches it returns `Ok(None)` from every subsequent `read_record`
//! call rather than erroring.
//!
//! [`PageOutputStream`]/[`PageInputStream`] are the other half of C4: a
//! `StreamTrunk`-chained variant for logs a reader discovers by walking
//! forward from a single head page id rather than one written against a
//! page list already known in full.

use common::{DbError, DbResult, PageId};
use serde::{Deserialize, Serialize};
use storage::{CompressTool, PageKind, PageStore, PagedFile};

/// Alignment unit streams are buffered in. Equal to the store's page size —
/// every `StreamData` page holds exactly one block's worth of stream bytes,
/// zero-padded past the last record.
pub const FILE_BLOCK_SIZE: usize = storage::PAGE_SIZE;

/// Appends length-framed records to a chain of `StreamData` pages.
pub struct StreamWriter<'s, F: PagedFile> {
    store: &'s mut PageStore<F>,
    data_pages: Vec<PageId>,
    cur_page: PageId,
    cur_buf: Vec<u8>,
    capacity: usize,
    closed: bool,
}

impl<'s, F: PagedFile> StreamWriter<'s, F> {
    /// Allocate the first `StreamData` page and start a new stream.
    pub fn create(store: &'s mut PageStore<F>) -> DbResult<Self> {
        let first = store.allocate_page(PageKind::StreamData, None)?;
        let capacity = store.get_page(first, PageKind::StreamData)?.payload.len();
        Ok(Self {
            store,
            data_pages: vec![first],
            cur_page: first,
            cur_buf: Vec::with_capacity(capacity),
            capacity,
            closed: false,
        })
    }

    /// Write one record. Pass the same `compress` on the matching
    /// `StreamReader::read_record` call, or decoding will misparse the
    /// header.
    pub fn write_record(
        &mut self,
        record: &[u8],
        compress: Option<&dyn CompressTool>,
    ) -> DbResult<()> {
        if self.closed {
            return Err(DbError::Stream("write after close".into()));
        }
        let mut header = Vec::with_capacity(8);
        let payload = if let Some(tool) = compress {
            let compressed = tool.compress(record)?;
            header.extend_from_slice(&(compressed.len() as i32).to_le_bytes());
            header.extend_from_slice(&(record.len() as i32).to_le_bytes());
            compressed
        } else {
            header.extend_from_slice(&(record.len() as i32).to_le_bytes());
            record.to_vec()
        };
        self.push_bytes(&header)?;
        self.push_bytes(&payload)?;
        self.pad_to_block_boundary()?;
        Ok(())
    }

    /// Append the clean end-of-stream marker and flush the final page.
    /// Returns the page chain for the reader side to walk. Idempotent.
    pub fn close(&mut self) -> DbResult<Vec<PageId>> {
        if !self.closed {
            self.push_bytes(&(-1i32).to_le_bytes())?;
            self.flush_page()?;
            self.closed = true;
        }
        Ok(self.data_pages.clone())
    }

    /// Spec §4.4: "each record is aligned to `FILE_BLOCK_SIZE` boundaries
    /// by zero-padding." A `StreamData` page *is* one `FILE_BLOCK_SIZE`
    /// block, so alignment means every record starts at the beginning of a
    /// page: if the record just written didn't land exactly on a page
    /// boundary, zero-pad the rest of the current page and roll onto a
    /// fresh one before the next record starts.
    fn pad_to_block_boundary(&mut self) -> DbResult<()> {
        if self.cur_buf.is_empty() {
            // The record ended exactly at capacity; `push_bytes` already
            // flushed and rolled onto a fresh page for us.
            return Ok(());
        }
        self.flush_page()?;
        let next = self.store.allocate_page(PageKind::StreamData, None)?;
        self.data_pages.push(next);
        self.cur_page = next;
        Ok(())
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) -> DbResult<()> {
        while !bytes.is_empty() {
            let space = self.capacity - self.cur_buf.len();
            let take = space.min(bytes.len());
            self.cur_buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.cur_buf.len() == self.capacity {
                self.flush_page()?;
                let next = self.store.allocate_page(PageKind::StreamData, None)?;
                self.data_pages.push(next);
                self.cur_page = next;
            }
        }
        Ok(())
    }

    fn flush_page(&mut self) -> DbResult<()> {
        let mut page = self.store.get_page(self.cur_page, PageKind::StreamData)?;
        page.payload.fill(0);
        page.payload[..self.cur_buf.len()].copy_from_slice(&self.cur_buf);
        self.store.update(&page)?;
        self.cur_buf.clear();
        Ok(())
    }
}

/// Reads length-framed records back out of a `StreamData` page chain
/// previously produced by a [`StreamWriter`].
pub struct StreamReader<'s, F: PagedFile> {
    store: &'s mut PageStore<F>,
    data_pages: Vec<PageId>,
    page_idx: usize,
    page_buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<'s, F: PagedFile> StreamReader<'s, F> {
    pub fn open(store: &'s mut PageStore<F>, data_pages: Vec<PageId>) -> DbResult<Self> {
        if data_pages.is_empty() {
            return Err(DbError::Stream("empty page chain".into()));
        }
        let mut reader = Self {
            store,
            data_pages,
            page_idx: 0,
            page_buf: Vec::new(),
            pos: 0,
            eof: false,
        };
        reader.load_page(0)?;
        Ok(reader)
    }

    fn load_page(&mut self, idx: usize) -> DbResult<()> {
        let id = self.data_pages[idx];
        let page = self.store.get_page(id, PageKind::StreamData)?;
        self.page_buf = page.payload;
        self.pos = 0;
        Ok(())
    }

    fn read_exact_bytes(&mut self, n: usize) -> DbResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos >= self.page_buf.len() {
                self.page_idx += 1;
                if self.page_idx >= self.data_pages.len() {
                    return Err(DbError::Stream(
                        "ran off the end of the page chain mid-record".into(),
                    ));
                }
                self.load_page(self.page_idx)?;
            }
            let avail = self.page_buf.len() - self.pos;
            let take = avail.min(n - out.len());
            out.extend_from_slice(&self.page_buf[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    /// Read the next record, or `Ok(None)` once the `-1` end marker has
    /// been consumed. Must be called with the same `compress` value the
    /// matching `StreamWriter::write_record` call used.
    pub fn read_record(
        &mut self,
        compress: Option<&dyn CompressTool>,
    ) -> DbResult<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        let len = i32::from_le_bytes(self.read_exact_bytes(4)?.try_into().unwrap());
        if len < 0 {
            self.eof = true;
            return Ok(None);
        }
        let result = if let Some(tool) = compress {
            let ulen =
                i32::from_le_bytes(self.read_exact_bytes(4)?.try_into().unwrap()) as usize;
            let compressed = self.read_exact_bytes(len as usize)?;
            let mut out = vec![0u8; ulen];
            tool.expand(&compressed, &mut out)?;
            out
        } else {
            self.read_exact_bytes(len as usize)?
        };
        self.skip_to_next_page_boundary();
        Ok(Some(result))
    }

    /// The writer always starts the next record (if any) at the beginning
    /// of a fresh page (spec §4.4 block alignment); discard this page's
    /// zero-padded remainder so the following header read lands there.
    fn skip_to_next_page_boundary(&mut self) {
        self.pos = self.page_buf.len();
    }
}

/// The on-disk payload of a `StreamTrunk` page: the `StreamData` pages it
/// owns, its position in the chain (`log_key`), and the next trunk, if any.
/// Spec §4.4: a `PageInputStream` walks this chain, checking `log_key`
/// increases by exactly one at every hop.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct TrunkPayload {
    log_key: i64,
    data_pages: Vec<PageId>,
    next_trunk: Option<PageId>,
}

fn bincode_config() -> impl bincode::config::Config {
    bincode::config::legacy()
}

impl TrunkPayload {
    fn encode(&self, into: &mut [u8]) -> DbResult<()> {
        into.fill(0);
        bincode::serde::encode_into_slice(self, into, bincode_config())
            .map_err(|e| DbError::Stream(format!("encode stream trunk failed: {e}")))?;
        Ok(())
    }

    fn decode(buf: &[u8]) -> DbResult<Self> {
        let (payload, _): (Self, usize) =
            bincode::serde::decode_from_slice(buf, bincode_config())
                .map_err(|e| DbError::Stream(format!("decode stream trunk failed: {e}")))?;
        Ok(payload)
    }
}

/// Appends records to an open-ended chain of `StreamTrunk` pages, each owning
/// a run of `StreamData` pages, linked by a `log_key` that increases by one
/// per trunk (spec §4.4). Unlike [`StreamWriter`] — which hands back a fixed,
/// already-known page list — this is for logs a reader discovers by walking
/// forward from a single head page id, without the writer ever telling it
/// how many pages that turned out to be.
pub struct PageOutputStream<'s, F: PagedFile> {
    store: &'s mut PageStore<F>,
    head_trunk: PageId,
    trunk_id: PageId,
    log_key: i64,
    trunk_data_pages: Vec<PageId>,
    cur_page: PageId,
    cur_buf: Vec<u8>,
    capacity: usize,
    closed: bool,
}

/// Data pages a single `StreamTrunk` may own before it seals and a fresh
/// trunk takes over. Keeps trunk payloads small relative to `PAGE_SIZE`
/// regardless of how long the overall stream runs.
const DATA_PAGES_PER_TRUNK: usize = 64;

impl<'s, F: PagedFile> PageOutputStream<'s, F> {
    /// Allocate the head trunk and its first data page. `head_trunk()` is
    /// what a later `PageInputStream::open` call needs.
    pub fn create(store: &'s mut PageStore<F>) -> DbResult<Self> {
        let trunk_id = store.allocate_page(PageKind::StreamTrunk, None)?;
        let first_data = store.allocate_page(PageKind::StreamData, Some(trunk_id))?;
        let capacity = store
            .get_page(first_data, PageKind::StreamData)?
            .payload
            .len();
        Ok(Self {
            store,
            head_trunk: trunk_id,
            trunk_id,
            log_key: 0,
            trunk_data_pages: vec![first_data],
            cur_page: first_data,
            cur_buf: Vec::with_capacity(capacity),
            capacity,
            closed: false,
        })
    }

    /// The entry point a `PageInputStream` opens from.
    pub fn head_trunk(&self) -> PageId {
        self.head_trunk
    }

    pub fn write_record(
        &mut self,
        record: &[u8],
        compress: Option<&dyn CompressTool>,
    ) -> DbResult<()> {
        if self.closed {
            return Err(DbError::Stream("write after close".into()));
        }
        let mut header = Vec::with_capacity(8);
        let payload = if let Some(tool) = compress {
            let compressed = tool.compress(record)?;
            header.extend_from_slice(&(compressed.len() as i32).to_le_bytes());
            header.extend_from_slice(&(record.len() as i32).to_le_bytes());
            compressed
        } else {
            header.extend_from_slice(&(record.len() as i32).to_le_bytes());
            record.to_vec()
        };
        self.push_bytes(&header)?;
        self.push_bytes(&payload)?;
        if !self.cur_buf.is_empty() {
            self.flush_page()?;
            self.roll_data_page()?;
        }
        Ok(())
    }

    /// Seal the current trunk (writing `-1` as its end marker on the final
    /// data page) and return the head trunk id.
    pub fn close(&mut self) -> DbResult<PageId> {
        if !self.closed {
            self.push_bytes(&(-1i32).to_le_bytes())?;
            self.flush_page()?;
            self.seal_trunk(None)?;
            self.closed = true;
        }
        Ok(self.head_trunk)
    }

    fn push_bytes(&mut self, mut bytes: &[u8]) -> DbResult<()> {
        while !bytes.is_empty() {
            let space = self.capacity - self.cur_buf.len();
            let take = space.min(bytes.len());
            self.cur_buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.cur_buf.len() == self.capacity {
                self.flush_page()?;
                self.roll_data_page()?;
            }
        }
        Ok(())
    }

    fn flush_page(&mut self) -> DbResult<()> {
        let mut page = self.store.get_page(self.cur_page, PageKind::StreamData)?;
        page.payload.fill(0);
        page.payload[..self.cur_buf.len()].copy_from_slice(&self.cur_buf);
        self.store.update(&page)?;
        self.cur_buf.clear();
        Ok(())
    }

    /// Allocate the next `StreamData` page, sealing the current trunk and
    /// starting a fresh one first if it has already reached
    /// `DATA_PAGES_PER_TRUNK`.
    fn roll_data_page(&mut self) -> DbResult<()> {
        if self.trunk_data_pages.len() >= DATA_PAGES_PER_TRUNK {
            let next_trunk = self.store.allocate_page(PageKind::StreamTrunk, None)?;
            self.seal_trunk(Some(next_trunk))?;
            self.trunk_id = next_trunk;
            self.log_key += 1;
            self.trunk_data_pages.clear();
        }
        let next = self
            .store
            .allocate_page(PageKind::StreamData, Some(self.trunk_id))?;
        self.trunk_data_pages.push(next);
        self.cur_page = next;
        Ok(())
    }

    fn seal_trunk(&mut self, next_trunk: Option<PageId>) -> DbResult<()> {
        let mut page = self.store.get_page(self.trunk_id, PageKind::StreamTrunk)?;
        let payload = TrunkPayload {
            log_key: self.log_key,
            data_pages: self.trunk_data_pages.clone(),
            next_trunk,
        };
        payload.encode(&mut page.payload)?;
        self.store.update(&page)
    }
}

/// Reads a record chain written by [`PageOutputStream`], following
/// `StreamTrunk` links as they're discovered rather than from a page list
/// known up front. Spec §4.4: end-of-stream is "the next trunk is absent or
/// its `logKey` does not match the expected value," both treated the same
/// as a clean `-1` end marker rather than an error.
pub struct PageInputStream<'s, F: PagedFile> {
    store: &'s mut PageStore<F>,
    expected_log_key: i64,
    trunk_data_pages: Vec<PageId>,
    next_trunk: Option<PageId>,
    page_idx: usize,
    page_buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<'s, F: PagedFile> PageInputStream<'s, F> {
    pub fn open(store: &'s mut PageStore<F>, head_trunk: PageId) -> DbResult<Self> {
        let trunk = store.get_page(head_trunk, PageKind::StreamTrunk)?;
        let payload = TrunkPayload::decode(&trunk.payload)?;
        if payload.log_key != 0 {
            return Err(DbError::Stream(format!(
                "stream trunk {}: expected logKey 0, found {}",
                head_trunk.0, payload.log_key
            )));
        }
        let mut reader = Self {
            store,
            expected_log_key: 0,
            trunk_data_pages: payload.data_pages,
            next_trunk: payload.next_trunk,
            page_idx: 0,
            page_buf: Vec::new(),
            pos: 0,
            eof: false,
        };
        reader.load_page(0)?;
        Ok(reader)
    }

    fn load_page(&mut self, idx: usize) -> DbResult<()> {
        let id = self.trunk_data_pages[idx];
        let page = self.store.get_page(id, PageKind::StreamData)?;
        self.page_buf = page.payload;
        self.pos = 0;
        Ok(())
    }

    /// Move onto the next data page, following a trunk link if the current
    /// trunk's data pages are exhausted. Returns `Ok(false)` at a clean
    /// end-of-stream (absent or mismatched next trunk) rather than erroring.
    fn advance_page(&mut self) -> DbResult<bool> {
        if self.page_idx + 1 < self.trunk_data_pages.len() {
            self.page_idx += 1;
            self.load_page(self.page_idx)?;
            return Ok(true);
        }
        let Some(next_id) = self.next_trunk else {
            return Ok(false);
        };
        let Ok(trunk) = self.store.get_page(next_id, PageKind::StreamTrunk) else {
            return Ok(false);
        };
        let Ok(payload) = TrunkPayload::decode(&trunk.payload) else {
            return Ok(false);
        };
        if payload.log_key != self.expected_log_key + 1 || payload.data_pages.is_empty() {
            return Ok(false);
        }
        self.expected_log_key = payload.log_key;
        self.trunk_data_pages = payload.data_pages;
        self.next_trunk = payload.next_trunk;
        self.page_idx = 0;
        self.load_page(0)?;
        Ok(true)
    }

    fn read_exact_bytes(&mut self, n: usize) -> DbResult<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.pos >= self.page_buf.len() {
                if !self.advance_page()? {
                    return Err(DbError::Stream(
                        "ran off the end of the trunk chain mid-record".into(),
                    ));
                }
            }
            let avail = self.page_buf.len() - self.pos;
            let take = avail.min(n - out.len());
            out.extend_from_slice(&self.page_buf[self.pos..self.pos + take]);
            self.pos += take;
        }
        Ok(out)
    }

    /// Read the next record. Returns `Ok(None)` at a `-1` end marker, or at
    /// a trunk chain that simply stops (absent or `logKey`-mismatched next
    /// trunk) without one — both are a clean end-of-stream per spec §4.4.
    pub fn read_record(
        &mut self,
        compress: Option<&dyn CompressTool>,
    ) -> DbResult<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }
        if self.pos >= self.page_buf.len() && !self.advance_page()? {
            self.eof = true;
            return Ok(None);
        }
        let len = i32::from_le_bytes(self.read_exact_bytes(4)?.try_into().unwrap());
        if len < 0 {
            self.eof = true;
            return Ok(None);
        }
        let result = if let Some(tool) = compress {
            let ulen =
                i32::from_le_bytes(self.read_exact_bytes(4)?.try_into().unwrap()) as usize;
            let compressed = self.read_exact_bytes(len as usize)?;
            let mut out = vec![0u8; ulen];
            tool.expand(&compressed, &mut out)?;
            out
        } else {
            self.read_exact_bytes(len as usize)?
        };
        self.pos = self.page_buf.len();
        Ok(Some(result))
    }
}
