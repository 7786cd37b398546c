//! C1 — Paged File Abstraction.
//!
//! A thin, page-aligned channel over either a disk file or an in-memory
//! region (`offheap::OffHeapStore`). Every method here is page-aligned:
//! callers address pages by id, never by byte offset, and `read`/`write`
//! always move exactly `PAGE_SIZE` bytes.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use common::{DbError, DbResult, PageId};

use crate::PAGE_SIZE;

/// Open mode for [`PagedFile::open`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

/// The channel abstraction shared by the disk-backed file (C1) and the
/// off-heap region (C10): both give the page store page-aligned random
/// access without exposing which one is behind the trait object.
pub trait PagedFile {
    /// Read exactly one page into `out` (`out.len()` must equal `PAGE_SIZE`).
    /// Reading past the allocated length is not an error: the buffer is
    /// zero-filled, mirroring a freshly allocated page.
    fn read(&mut self, page_id: PageId, out: &mut [u8]) -> DbResult<()>;
    /// Write exactly one page (`buf.len()` must equal `PAGE_SIZE`).
    fn write(&mut self, page_id: PageId, buf: &[u8]) -> DbResult<()>;
    /// Allocate a fresh page at the end of the file, returning its id.
    fn allocate(&mut self) -> DbResult<PageId>;
    /// Return a page to the free pool. Implementations may not reclaim the
    /// underlying space immediately.
    fn free(&mut self, page_id: PageId) -> DbResult<()>;
    /// Truncate to exactly `num_pages` pages.
    fn truncate(&mut self, num_pages: u32) -> DbResult<()>;
    /// Flush buffered writes to the backing medium.
    fn sync(&mut self) -> DbResult<()>;
    /// Current length, in pages.
    fn length(&self) -> DbResult<u32>;
}

/// Disk-backed implementation of [`PagedFile`].
#[derive(Debug)]
pub struct DiskPagedFile {
    file: File,
    num_pages: u32,
}

impl DiskPagedFile {
    pub fn open(path: &Path, mode: OpenMode) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .create(mode == OpenMode::ReadWrite)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        let num_pages = (len / PAGE_SIZE as u64) as u32;
        Ok(Self { file, num_pages })
    }

    /// Position of the next byte the underlying file would read/write from.
    pub fn file_pointer(&mut self) -> DbResult<u64> {
        Ok(self.file.stream_position()?)
    }

    pub fn seek(&mut self, offset: u64) -> DbResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read until `out` is completely filled or the file is exhausted,
    /// looping over short reads rather than trusting a single syscall to
    /// deliver the whole buffer.
    fn read_fully(&mut self, mut out: &mut [u8]) -> DbResult<usize> {
        let mut total = 0;
        while !out.is_empty() {
            let n = self.file.read(out)?;
            if n == 0 {
                break;
            }
            total += n;
            out = &mut out[n..];
        }
        Ok(total)
    }
}

impl PagedFile for DiskPagedFile {
    fn read(&mut self, page_id: PageId, out: &mut [u8]) -> DbResult<()> {
        if out.len() != PAGE_SIZE {
            return Err(DbError::Storage(format!(
                "read buffer must be exactly PAGE_SIZE ({PAGE_SIZE}), got {}",
                out.len()
            )));
        }
        out.fill(0);
        if page_id.0 >= self.num_pages {
            return Ok(());
        }
        self.file
            .seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;
        let read = self.read_fully(out)?;
        if read != PAGE_SIZE && read != 0 {
            return Err(DbError::Storage(format!(
                "short read for page {}: got {read} of {PAGE_SIZE} bytes",
                page_id.0
            )));
        }
        Ok(())
    }

    fn write(&mut self, page_id: PageId, buf: &[u8]) -> DbResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(DbError::Storage(format!(
                "write buffer must be exactly PAGE_SIZE ({PAGE_SIZE}), got {}",
                buf.len()
            )));
        }
        self.file
            .seek(SeekFrom::Start(page_id.0 as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(buf)?;
        if page_id.0 >= self.num_pages {
            self.num_pages = page_id.0 + 1;
        }
        Ok(())
    }

    fn allocate(&mut self) -> DbResult<PageId> {
        let page_id = PageId(self.num_pages);
        self.write(page_id, &vec![0u8; PAGE_SIZE])?;
        Ok(page_id)
    }

    fn free(&mut self, _page_id: PageId) -> DbResult<()> {
        // Space reclamation happens through the page store's bitmap
        // allocator; the channel layer never shrinks the file on a single
        // free, only on an explicit truncate.
        Ok(())
    }

    fn truncate(&mut self, num_pages: u32) -> DbResult<()> {
        self.file.set_len(num_pages as u64 * PAGE_SIZE as u64)?;
        self.num_pages = num_pages;
        Ok(())
    }

    fn sync(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn length(&self) -> DbResult<u32> {
        Ok(self.num_pages)
    }
}

/// Pure in-memory [`PagedFile`], used for temporary tables and tests.
#[derive(Debug, Default)]
pub struct MemPagedFile {
    pages: Vec<Vec<u8>>,
}

impl PagedFile for MemPagedFile {
    fn read(&mut self, page_id: PageId, out: &mut [u8]) -> DbResult<()> {
        if out.len() != PAGE_SIZE {
            return Err(DbError::Storage("read buffer must be PAGE_SIZE".into()));
        }
        out.fill(0);
        if let Some(page) = self.pages.get(page_id.0 as usize) {
            out.copy_from_slice(page);
        }
        Ok(())
    }

    fn write(&mut self, page_id: PageId, buf: &[u8]) -> DbResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(DbError::Storage("write buffer must be PAGE_SIZE".into()));
        }
        let idx = page_id.0 as usize;
        if idx >= self.pages.len() {
            self.pages.resize(idx + 1, vec![0u8; PAGE_SIZE]);
        }
        self.pages[idx].copy_from_slice(buf);
        Ok(())
    }

    fn allocate(&mut self) -> DbResult<PageId> {
        let id = PageId(self.pages.len() as u32);
        self.pages.push(vec![0u8; PAGE_SIZE]);
        Ok(id)
    }

    fn free(&mut self, _page_id: PageId) -> DbResult<()> {
        Ok(())
    }

    fn truncate(&mut self, num_pages: u32) -> DbResult<()> {
        self.pages.truncate(num_pages as usize);
        Ok(())
    }

    fn sync(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn length(&self) -> DbResult<u32> {
        Ok(self.pages.len() as u32)
    }
}
