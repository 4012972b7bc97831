use std::path::Path;

use log::debug;

use crate::{
    btree::page::{PageBuf, PAGE_SIZE},
    error::SmallError,
    io::SmallFile,
    types::{PageNum, SmallResult},
};

/// How many pages the file grows by when the free list is empty.
pub const NEW_PAGES_WHEN_NO_FREE_PAGES: u64 = 1;

/// The single-file backing store of one table. Page 0 is the header page
/// (free-list head, root page number, total page count); all other pages
/// are nodes or free-list members.
///
/// The file knows nothing about caching. The buffer pool decides when
/// bytes move; this layer only moves them.
pub struct TableFile {
    file: SmallFile,
}

impl TableFile {
    /// Open (or create) a table file. A fresh file gets a header page
    /// recording a page count of 1 -- the header itself.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SmallError> {
        let (file, created) = SmallFile::open(path)?;

        if created {
            debug!("creating table file {:?}", file.path());

            let mut header = PageBuf::new_zeroed();
            header.set_num_pages(1);

            let table_file = Self { file };
            table_file.write_page(0, &header)?;
            return Ok(table_file);
        }

        Ok(Self { file })
    }

    pub fn read_page(&self, pagenum: PageNum, dest: &mut PageBuf) -> SmallResult {
        self.file.read_at(pagenum * PAGE_SIZE as u64, dest.bytes_mut())
    }

    pub fn write_page(&self, pagenum: PageNum, src: &PageBuf) -> SmallResult {
        self.file.write_at(pagenum * PAGE_SIZE as u64, src.bytes())?;
        self.file.sync()
    }

    /// Number of pages the file currently has room for on disk.
    pub fn capacity(&self) -> Result<u64, SmallError> {
        Ok(self.file.size()? / PAGE_SIZE as u64)
    }

    /// Grow the file so it can hold `new_pages` more pages than the header
    /// currently counts.
    pub fn extend(&self, header: &PageBuf, new_pages: u64) -> SmallResult {
        let new_count = header.num_pages() + new_pages;
        self.file.set_len(new_count * PAGE_SIZE as u64)
    }

    /// Take a never-used page at the end of the file, extending it when
    /// full. The caller holds the pinned header page and is responsible
    /// for marking it dirty; the free-list pop lives in the buffer pool so
    /// cached free pages are never shadowed by stale disk images.
    pub fn alloc_page(&self, header: &mut PageBuf) -> Result<PageNum, SmallError> {
        let pagenum = header.num_pages();

        if self.capacity()? <= pagenum {
            self.extend(header, NEW_PAGES_WHEN_NO_FREE_PAGES)?;
        }

        header.set_num_pages(pagenum + 1);

        debug!("table file {:?}: new page {}", self.file.path(), pagenum);
        Ok(pagenum)
    }
}
