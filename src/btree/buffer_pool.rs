use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use log::debug;

use crate::{
    btree::{file::TableFile, page::PageBuf},
    error::SmallError,
    tx_log::LogManager,
    types::{PageNum, SmallResult, TableId, NULL_PAGE_NUM},
    utils::HandyRwLock,
};

const NO_TABLE: TableId = -1;

/// Contents of one buffer frame: the page bytes plus the bookkeeping that
/// travels with them under the frame's rw-lock.
pub struct FrameBuf {
    pub page: PageBuf,
    table_id: TableId,
    pagenum: PageNum,
    dirty: bool,
}

impl FrameBuf {
    fn new() -> Self {
        Self {
            page: PageBuf::new_zeroed(),
            table_id: NO_TABLE,
            pagenum: NULL_PAGE_NUM,
            dirty: false,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn pagenum(&self) -> PageNum {
        self.pagenum
    }
}

struct Frame {
    pin_count: AtomicU32,
    buf: RwLock<FrameBuf>,
}

impl Frame {
    fn new() -> Self {
        Self {
            pin_count: AtomicU32::new(0),
            buf: RwLock::new(FrameBuf::new()),
        }
    }
}

/// A pinned reference to a buffer frame. The pin is released when this
/// guard is dropped, on every control path; a frame with outstanding pins
/// is never an eviction victim, so the page cannot move under the caller.
pub struct PinnedPage {
    frame: Arc<Frame>,
}

impl PinnedPage {
    pub fn read(&self) -> RwLockReadGuard<'_, FrameBuf> {
        self.frame.buf.rl()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FrameBuf> {
        self.frame.buf.wl()
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PoolInner {
    frames: Vec<Arc<Frame>>,

    /// Frame indices in recency order: least recently used at the front.
    /// Every frame appears exactly once.
    ///
    /// TODO: an intrusive list would make the reposition O(1); the queue
    /// scan is fine at the frame counts this pool is configured with.
    lru: VecDeque<usize>,

    map: HashMap<(TableId, PageNum), usize>,

    files: HashMap<TableId, Arc<TableFile>>,
}

impl PoolInner {
    fn touch(&mut self, index: usize) {
        if let Some(pos) = self.lru.iter().position(|&i| i == index) {
            self.lru.remove(pos);
        }
        self.lru.push_back(index);
    }

    /// First frame in LRU order with no outstanding pins. Running out of
    /// victims means every frame is pinned at once, which callers are
    /// never allowed to do.
    fn find_victim(&self) -> Result<usize, SmallError> {
        for &index in self.lru.iter() {
            if self.frames[index].pin_count.load(Ordering::SeqCst) == 0 {
                return Ok(index);
            }
        }
        Err(SmallError::invariant("all buffer frames are pinned"))
    }
}

/// Fixed-capacity page cache. All page access goes through `get_page`; the
/// returned `PinnedPage` keeps the frame resident until dropped.
pub struct BufferPool {
    log_manager: Arc<LogManager>,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    pub fn new(num_buf: usize, log_manager: Arc<LogManager>) -> Result<Self, SmallError> {
        if num_buf == 0 {
            return Err(SmallError::invariant("buffer pool capacity must be > 0"));
        }

        let frames: Vec<_> = (0..num_buf).map(|_| Arc::new(Frame::new())).collect();
        let lru = (0..num_buf).collect();

        Ok(Self {
            log_manager,
            inner: Mutex::new(PoolInner {
                frames,
                lru,
                map: HashMap::new(),
                files: HashMap::new(),
            }),
        })
    }

    pub fn open_table<P: AsRef<Path>>(&self, table_id: TableId, path: P) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();
        if inner.files.contains_key(&table_id) {
            return Ok(());
        }

        let file = TableFile::open(path)?;
        inner.files.insert(table_id, Arc::new(file));
        Ok(())
    }

    /// Pin the page, loading it from disk on a miss. Re-entrant pinning of
    /// a page this caller already holds is allowed and counts.
    pub fn get_page(&self, table_id: TableId, pagenum: PageNum) -> Result<PinnedPage, SmallError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(&index) = inner.map.get(&(table_id, pagenum)) {
            let frame = Arc::clone(&inner.frames[index]);
            frame.pin_count.fetch_add(1, Ordering::SeqCst);
            inner.touch(index);
            return Ok(PinnedPage { frame });
        }

        let index = inner.find_victim()?;
        let frame = Arc::clone(&inner.frames[index]);

        {
            // pin count is 0, so nobody holds this frame's lock
            let mut buf = frame.buf.wl();

            if buf.table_id != NO_TABLE {
                debug!(
                    "evicting page ({}, {}) for ({}, {})",
                    buf.table_id, buf.pagenum, table_id, pagenum
                );
                inner.map.remove(&(buf.table_id, buf.pagenum));
                self.write_back(&inner, &mut buf)?;
            }

            let file = inner
                .files
                .get(&table_id)
                .cloned()
                .ok_or(SmallError::NoSuchTable(table_id))?;
            file.read_page(pagenum, &mut buf.page)?;

            buf.table_id = table_id;
            buf.pagenum = pagenum;
            buf.dirty = false;
        }

        frame.pin_count.fetch_add(1, Ordering::SeqCst);
        inner.map.insert((table_id, pagenum), index);
        inner.touch(index);

        Ok(PinnedPage { frame })
    }

    /// Allocate a page for the table: pop the free list when possible,
    /// otherwise take a fresh page at the end of the file. The frame comes
    /// back zeroed with `is_leaf` set.
    pub fn create_page(&self, table_id: TableId, is_leaf: bool) -> Result<PageNum, SmallError> {
        let header = self.get_page(table_id, 0)?;

        let pagenum;
        {
            let mut h = header.write();
            let free_head = h.page.free_page_number();

            if free_head != NULL_PAGE_NUM {
                // pop through the cache so a dirty cached free page is
                // honored over its stale disk image
                let free_page = self.get_page(table_id, free_head)?;
                let next = free_page.read().page.next_free_page();
                h.page.set_free_page_number(next);
                pagenum = free_head;
            } else {
                let file = self.file(table_id)?;
                pagenum = file.alloc_page(&mut h.page)?;
            }
            h.mark_dirty();
        }

        let page = self.get_page(table_id, pagenum)?;
        {
            let mut p = page.write();
            p.page.clear();
            p.page.set_is_leaf(is_leaf);
            p.mark_dirty();
        }

        Ok(pagenum)
    }

    /// Return a page to the table's free list, prepending it.
    pub fn free_page(&self, table_id: TableId, pagenum: PageNum) -> SmallResult {
        let header = self.get_page(table_id, 0)?;
        let target = self.get_page(table_id, pagenum)?;

        let mut h = header.write();
        let mut t = target.write();

        t.page.clear();
        t.page.set_next_free_page(h.page.free_page_number());
        t.mark_dirty();

        h.page.set_free_page_number(pagenum);
        h.mark_dirty();

        Ok(())
    }

    /// Flush this table's dirty frames and drop its cache entries and
    /// file handle. Every frame of the table must be unpinned.
    pub fn close_table(&self, table_id: TableId) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();

        if !inner.files.contains_key(&table_id) {
            return Err(SmallError::NoSuchTable(table_id));
        }

        let frames = inner.frames.clone();
        for frame in frames.iter() {
            let mut buf = match frame.buf.try_write() {
                Ok(buf) => buf,
                Err(_) => {
                    return Err(SmallError::invariant("closing a table with a held page"))
                }
            };
            if buf.table_id != table_id {
                continue;
            }
            if frame.pin_count.load(Ordering::SeqCst) != 0 {
                return Err(SmallError::invariant("closing a table with a pinned page"));
            }

            inner.map.remove(&(buf.table_id, buf.pagenum));
            self.write_back(&inner, &mut buf)?;
            buf.table_id = NO_TABLE;
            buf.pagenum = NULL_PAGE_NUM;
        }

        inner.files.remove(&table_id);
        Ok(())
    }

    /// Write every dirty frame to disk without evicting anything. Used at
    /// the end of recovery and on shutdown.
    pub fn flush_all(&self) -> SmallResult {
        let inner = self.inner.lock().unwrap();

        for frame in inner.frames.iter() {
            let mut buf = frame.buf.wl();
            if buf.table_id == NO_TABLE {
                continue;
            }
            self.write_back(&inner, &mut buf)?;
        }

        Ok(())
    }

    fn file(&self, table_id: TableId) -> Result<Arc<TableFile>, SmallError> {
        self.inner
            .lock()
            .unwrap()
            .files
            .get(&table_id)
            .cloned()
            .ok_or(SmallError::NoSuchTable(table_id))
    }

    /// Persist a dirty frame. The write-ahead rule holds here: the log is
    /// forced up to the frame's page lsn before the page bytes hit disk.
    fn write_back(&self, inner: &PoolInner, buf: &mut FrameBuf) -> SmallResult {
        if !buf.dirty {
            return Ok(());
        }

        let page_lsn = if buf.pagenum == 0 {
            0
        } else {
            buf.page.page_lsn()
        };
        if page_lsn >= self.log_manager.flushed_lsn() {
            self.log_manager.force()?;
        }

        let file = inner
            .files
            .get(&buf.table_id)
            .cloned()
            .ok_or(SmallError::NoSuchTable(buf.table_id))?;
        file.write_page(buf.pagenum, &buf.page)?;
        buf.dirty = false;

        Ok(())
    }
}
