//! Paged, file-backed buffer manager with LRU eviction.
//!
//! The pager owns the backing file and a bounded cache of pages. `get`
//! returns a handle to page `n`, loading it from disk on a cache miss and,
//! if that push puts the cache over capacity, writing back and evicting
//! the least-recently-used page first. Pages are never freed once
//! allocated; the file grows monotonically as `get_free` hands out new
//! page numbers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, trace, warn};

use crate::cache::LruCache;
use crate::errors::{err, Error};
use crate::node::{Page, PageHandle, PAGE_SIZE};

/// Hard ceiling on page numbers. Pages are never reclaimed in this crate
/// (no deletion), so this is also a ceiling on total rows ever inserted
/// across the table's lifetime.
pub const MAX_PAGES: usize = 4096;

/// Default number of resident pages before the LRU cache starts evicting.
/// Deliberately smaller than `MAX_PAGES` so normal use exercises eviction
/// rather than growing unbounded in memory.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

pub struct Pager {
    file: File,
    cache: LruCache<u32, PageHandle>,
    /// One past the highest page number ever handed out by `get`/`get_free`.
    page_count: u32,
    /// One past the highest page number present on disk at open time.
    disk_page_count: u32,
}

impl Pager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        Self::open_with_capacity(path, DEFAULT_CACHE_CAPACITY)
    }

    pub fn open_with_capacity<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let file_len = file.metadata()?.len();
        if file_len % PAGE_SIZE as u64 != 0 {
            return Err(err!(
                Corrupted,
                "file size {} is not a multiple of page size {}",
                file_len,
                PAGE_SIZE
            ));
        }
        let disk_page_count = (file_len / PAGE_SIZE as u64) as u32;
        debug!(disk_page_count, "opened pager");
        Ok(Pager {
            file,
            cache: LruCache::new(capacity),
            page_count: disk_page_count,
            disk_page_count,
        })
    }

    /// Returns a handle to page `n`, loading it from disk on a cache miss.
    pub fn get(&mut self, n: u32) -> Result<PageHandle, Error> {
        if n as usize >= MAX_PAGES {
            return Err(err!(
                OutOfBound,
                "page {} is at or beyond MAX_PAGES ({})",
                n,
                MAX_PAGES
            ));
        }

        if let Some(page) = self.cache.get(&n) {
            return Ok(page.clone());
        }

        trace!(page = n, "cache miss, loading page");
        let mut page = Page::zeroed();
        if n < self.disk_page_count {
            self.file.seek(SeekFrom::Start(n as u64 * PAGE_SIZE as u64))?;
            self.file.read_exact(&mut page.0)?;
        }
        let handle: PageHandle = std::rc::Rc::new(std::cell::RefCell::new(page));
        self.cache.set(n, handle.clone());
        if n + 1 > self.page_count {
            self.page_count = n + 1;
        }
        self.evict_overflow()?;
        Ok(handle)
    }

    /// Next unused page number. Does not materialize the page; a
    /// subsequent `get` does.
    pub fn get_free(&self) -> u32 {
        self.page_count
    }

    fn write_back(&mut self, n: u32, page: &PageHandle) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(n as u64 * PAGE_SIZE as u64))?;
        self.file.write_all(&page.borrow().0)?;
        if n + 1 > self.disk_page_count {
            self.disk_page_count = n + 1;
        }
        Ok(())
    }

    fn evict_overflow(&mut self) -> Result<(), Error> {
        while let Some((n, page)) = self.cache.invalidate() {
            trace!(page = n, "evicting page");
            self.write_back(n, &page)?;
        }
        Ok(())
    }

    /// Writes page `n` back if resident; a no-op if it is not cached. This
    /// crate chooses to skip silently rather than surface `NullPage` for a
    /// single untracked page, since "not in cache" is not an error on its
    /// own — only an out-of-bound page number is.
    pub fn flush(&mut self, n: u32) -> Result<(), Error> {
        if let Some(page) = self.cache.peek(&n).cloned() {
            self.write_back(n, &page)?;
        }
        Ok(())
    }

    /// Writes back every cached page, regardless of recency.
    pub fn flush_all(&mut self) -> Result<(), Error> {
        let pages: Vec<(u32, PageHandle)> =
            self.cache.entries().map(|(n, p)| (*n, p.clone())).collect();
        for (n, page) in pages {
            self.write_back(n, &page)?;
        }
        debug!(pages = self.page_count, "flushed all pages");
        Ok(())
    }

    /// Evicts every over-capacity entry, writing each back first.
    pub fn clean(&mut self) -> Result<(), Error> {
        self.evict_overflow()
    }

    /// Flushes everything and fsyncs the backing file.
    pub fn close(mut self) -> Result<(), Error> {
        self.flush_all()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!(error = %e, "failed to flush pager on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_open_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let pager = Pager::open(f.path()).unwrap();
        assert_eq!(pager.page_count(), 0);
    }

    #[test]
    fn test_open_rejects_misaligned_file() {
        let f = NamedTempFile::new().unwrap();
        std::fs::write(f.path(), vec![0u8; PAGE_SIZE + 10]).unwrap();
        let err = Pager::open(f.path()).unwrap_err();
        assert!(matches!(err, Error::Corrupted(_)));
    }

    #[test]
    fn test_get_allocates_and_persists() {
        let f = NamedTempFile::new().unwrap();
        {
            let mut pager = Pager::open(f.path()).unwrap();
            let page = pager.get(0).unwrap();
            page.borrow_mut().0[0] = 42;
            pager.close().unwrap();
        }
        let mut pager = Pager::open(f.path()).unwrap();
        let page = pager.get(0).unwrap();
        assert_eq!(page.borrow().0[0], 42);
    }

    #[test]
    fn test_out_of_bound_page() {
        let f = NamedTempFile::new().unwrap();
        let mut pager = Pager::open(f.path()).unwrap();
        let err = pager.get(MAX_PAGES as u32).unwrap_err();
        assert!(matches!(err, Error::OutOfBound(_)));
    }

    #[test]
    fn test_eviction_writes_back_dirty_pages() {
        let f = NamedTempFile::new().unwrap();
        let mut pager = Pager::open_with_capacity(f.path(), 2).unwrap();
        for n in 0..5u32 {
            let page = pager.get(n).unwrap();
            page.borrow_mut().0[0] = n as u8 + 1;
        }
        pager.flush_all().unwrap();
        drop(pager);

        let mut pager = Pager::open_with_capacity(f.path(), 2).unwrap();
        for n in 0..5u32 {
            let page = pager.get(n).unwrap();
            assert_eq!(page.borrow().0[0], n as u8 + 1);
        }
    }

    #[test]
    fn test_flush_untracked_page_is_noop() {
        let f = NamedTempFile::new().unwrap();
        let mut pager = Pager::open(f.path()).unwrap();
        pager.flush(3).unwrap();
    }

    #[test]
    fn test_file_length_is_multiple_of_page_size_after_close() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().to_path_buf();
        {
            let mut pager = Pager::open(&path).unwrap();
            pager.get(0).unwrap();
            pager.get(2).unwrap();
            pager.close().unwrap();
        }
        let len = std::fs::metadata(&path).unwrap().len();
        assert_eq!(len % PAGE_SIZE as u64, 0);
    }
}
