use std::{
    collections::HashMap,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::debug;

use crate::{
    btree::page::PageBuf,
    error::SmallError,
    io::SmallFile,
    transaction::Xact,
    tx_log::record::{LogBody, LogRecord, UpdateImage, IMAGE_SIZE, IMAGE_USED},
    types::{HierarchyId, Lsn, SmallResult, XactId},
};

/// On-disk log header: `{ base_lsn: u64, next_lsn: u64 }`. Records follow
/// contiguously; a record at LSN `l` lives at file offset
/// `header + (l - base_lsn)`.
///
/// LSNs never restart: truncating the log advances `base_lsn` to
/// `next_lsn` instead of zeroing it, so every page lsn ever stamped stays
/// below every future record's lsn.
pub const LOG_FILE_HEADER_SIZE: u64 = 16;

struct LogInner {
    /// Records appended but not yet forced, in LSN order.
    buffer: Vec<Arc<LogRecord>>,

    /// Per-transaction chains, oldest first. Fed to undo on abort and
    /// dropped at commit/rollback.
    per_xact: HashMap<XactId, Vec<Arc<LogRecord>>>,

    base_lsn: Lsn,
    next_lsn: Lsn,
}

/// Appends are a short critical section under one mutex: allocate the LSN,
/// push into the buffer, chain to the transaction. No page I/O ever
/// happens under it; `force` does its file writes while holding the same
/// mutex to keep the on-disk tail consistent with `next_lsn`.
pub struct LogManager {
    file: SmallFile,
    inner: Mutex<LogInner>,
    flushed_lsn: AtomicU64,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SmallError> {
        let (file, created) = SmallFile::open(path)?;

        let fresh = created || file.size()? < LOG_FILE_HEADER_SIZE;
        let mut base_lsn = 0;
        let mut next_lsn = 0;

        if !fresh {
            let mut raw = [0u8; LOG_FILE_HEADER_SIZE as usize];
            file.read_at(0, &mut raw)?;

            let mut word = [0u8; 8];
            word.copy_from_slice(&raw[0..8]);
            base_lsn = u64::from_le_bytes(word);
            word.copy_from_slice(&raw[8..16]);
            next_lsn = u64::from_le_bytes(word);
        }

        debug!("log opened, base_lsn {}, next_lsn {}", base_lsn, next_lsn);

        let manager = Self {
            file,
            inner: Mutex::new(LogInner {
                buffer: Vec::new(),
                per_xact: HashMap::new(),
                base_lsn,
                next_lsn,
            }),
            // everything already in the file has been forced
            flushed_lsn: AtomicU64::new(next_lsn),
        };

        if fresh {
            manager.write_header(0, 0)?;
        }

        Ok(manager)
    }

    pub fn base_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().base_lsn
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().unwrap().next_lsn
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// Whether the log holds any records; decides if recovery runs.
    pub fn has_records(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.next_lsn > inner.base_lsn
    }

    pub fn log_begin(&self, xact: &Xact) {
        self.append_chained(xact, LogBody::Begin);
    }

    /// Append COMMIT and force the log; the commit is durable when this
    /// returns.
    pub fn log_commit(&self, xact: &Xact) -> SmallResult {
        self.append_chained(xact, LogBody::Commit);
        self.force()
    }

    pub fn log_rollback(&self, xact: &Xact) {
        self.append_chained(xact, LogBody::Rollback);
    }

    /// Append an UPDATE for the slot named by `hid`, returning its LSN for
    /// the caller to stamp into the page.
    pub fn log_update(
        &self,
        xact: &Xact,
        hid: HierarchyId,
        old_value: &[u8],
        new_value: &[u8],
    ) -> Lsn {
        let image = build_image(hid, old_value, new_value);
        let record = self.append_chained(xact, LogBody::Update(image));
        record.lsn
    }

    /// Append a CLR for a live abort. Old/new are already swapped by the
    /// caller: redoing a CLR reinstates the pre-update value.
    pub fn log_compensate(
        &self,
        xact: &Xact,
        hid: HierarchyId,
        old_value: &[u8],
        new_value: &[u8],
        next_undo_lsn: Lsn,
    ) -> Lsn {
        let image = build_image(hid, old_value, new_value);
        let record = self.append_chained(
            xact,
            LogBody::Compensate {
                image,
                next_undo_lsn,
            },
        );
        record.lsn
    }

    fn append_chained(&self, xact: &Xact, body: LogBody) -> Arc<LogRecord> {
        let mut inner = self.inner.lock().unwrap();

        let record = Arc::new(LogRecord::new(
            xact.id(),
            inner.next_lsn,
            xact.last_lsn(),
            body,
        ));

        inner.next_lsn += record.size as u64;
        inner.buffer.push(Arc::clone(&record));
        inner
            .per_xact
            .entry(xact.id())
            .or_insert_with(Vec::new)
            .push(Arc::clone(&record));

        xact.set_last_lsn(record.lsn);
        debug!("append {:?}", record);
        record
    }

    /// Append a record on behalf of a transaction that no longer has a
    /// live handle (the undo pass of recovery).
    pub(crate) fn append_raw(&self, xid: XactId, prev_lsn: Lsn, body: LogBody) -> Arc<LogRecord> {
        let mut inner = self.inner.lock().unwrap();

        let record = Arc::new(LogRecord::new(xid, inner.next_lsn, prev_lsn, body));
        inner.next_lsn += record.size as u64;
        inner.buffer.push(Arc::clone(&record));

        debug!("append (recovery) {:?}", record);
        record
    }

    /// This transaction's chain, oldest record first.
    pub fn get(&self, xid: XactId) -> Vec<Arc<LogRecord>> {
        self.inner
            .lock()
            .unwrap()
            .per_xact
            .get(&xid)
            .cloned()
            .unwrap_or_default()
    }

    pub fn remove(&self, xid: XactId) {
        self.inner.lock().unwrap().per_xact.remove(&xid);
    }

    /// Write all buffered records at their byte offsets, advance the
    /// header, fsync, and clear the buffer.
    pub fn force(&self) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();

        if inner.buffer.is_empty() {
            return Ok(());
        }

        for record in inner.buffer.iter() {
            let offset = LOG_FILE_HEADER_SIZE + (record.lsn - inner.base_lsn);
            self.file.write_at(offset, &record.encode())?;
        }

        let mut header = [0u8; LOG_FILE_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&inner.base_lsn.to_le_bytes());
        header[8..16].copy_from_slice(&inner.next_lsn.to_le_bytes());
        self.file.write_at(0, &header)?;
        self.file.sync()?;

        debug!(
            "forced {} records, flushed_lsn {} -> {}",
            inner.buffer.len(),
            self.flushed_lsn(),
            inner.next_lsn
        );

        self.flushed_lsn.store(inner.next_lsn, Ordering::SeqCst);
        inner.buffer.clear();

        Ok(())
    }

    /// Random-access read of one record from disk; recovery's only way in.
    pub fn read_record(&self, lsn: Lsn) -> Result<LogRecord, SmallError> {
        let offset = {
            let inner = self.inner.lock().unwrap();
            LOG_FILE_HEADER_SIZE + (lsn - inner.base_lsn)
        };

        let mut size_raw = [0u8; 4];
        self.file.read_at(offset, &mut size_raw)?;
        let size = u32::from_le_bytes(size_raw);

        if size < 28 {
            return Err(SmallError::Invariant(format!(
                "log record at lsn {} has size {}",
                lsn, size
            )));
        }

        let mut raw = vec![0u8; size as usize];
        self.file.read_at(offset, &mut raw)?;
        LogRecord::decode(&raw)
    }

    /// Cut the log back to its header after a completed recovery. The lsn
    /// space stays monotonic: the base moves up to the next lsn.
    pub fn truncate(&self) -> SmallResult {
        let mut inner = self.inner.lock().unwrap();

        self.file.set_len(LOG_FILE_HEADER_SIZE)?;
        inner.base_lsn = inner.next_lsn;
        inner.buffer.clear();
        inner.per_xact.clear();

        let base_lsn = inner.base_lsn;
        let next_lsn = inner.next_lsn;
        drop(inner);

        self.write_header(base_lsn, next_lsn)?;
        self.flushed_lsn.store(next_lsn, Ordering::SeqCst);
        Ok(())
    }

    fn write_header(&self, base_lsn: Lsn, next_lsn: Lsn) -> SmallResult {
        let mut header = [0u8; LOG_FILE_HEADER_SIZE as usize];
        header[0..8].copy_from_slice(&base_lsn.to_le_bytes());
        header[8..16].copy_from_slice(&next_lsn.to_le_bytes());
        self.file.write_at(0, &header)?;
        self.file.sync()
    }
}

fn build_image(hid: HierarchyId, old_value: &[u8], new_value: &[u8]) -> UpdateImage {
    let mut old_image = [0u8; IMAGE_SIZE];
    old_image[..IMAGE_USED as usize].copy_from_slice(&old_value[..IMAGE_USED as usize]);
    let mut new_image = [0u8; IMAGE_SIZE];
    new_image[..IMAGE_USED as usize].copy_from_slice(&new_value[..IMAGE_USED as usize]);

    UpdateImage {
        table_id: hid.table_id,
        pagenum: hid.pagenum,
        offset: PageBuf::value_offset(hid.slot) as u32,
        length: IMAGE_USED,
        old_image,
        new_image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, LogManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::open(dir.path().join("logfile.data")).unwrap();
        (dir, manager)
    }

    #[test]
    fn test_lsn_allocation_is_contiguous() {
        let (_dir, manager) = open_temp();
        let xact = Xact::new(1);

        manager.log_begin(&xact);
        let lsn = manager.log_update(&xact, HierarchyId::new(1, 2, 0), &[1u8; 120], &[2u8; 120]);
        assert_eq!(lsn, 28);
        assert_eq!(manager.next_lsn(), 28 + 288);
        assert_eq!(xact.last_lsn(), 28);

        // chained: the update's prev points at the begin
        let chain = manager.get(1);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].prev_lsn, 0);
        assert_eq!(chain[1].lsn, 28);
    }

    #[test]
    fn test_force_then_read_back() {
        let (_dir, manager) = open_temp();
        let xact = Xact::new(7);

        manager.log_begin(&xact);
        let lsn = manager.log_update(&xact, HierarchyId::new(1, 3, 2), &[9u8; 120], &[8u8; 120]);
        assert_eq!(manager.flushed_lsn(), 0);

        manager.force().unwrap();
        assert_eq!(manager.flushed_lsn(), manager.next_lsn());

        let record = manager.read_record(lsn).unwrap();
        assert_eq!(record.xid, 7);
        match record.body {
            LogBody::Update(image) => {
                assert_eq!(image.pagenum, 3);
                assert_eq!(image.offset, PageBuf::value_offset(2) as u32);
                assert_eq!(image.old_data(), &[9u8; 112][..]);
            }
            other => panic!("wrong body: {:?}", other),
        }
    }

    #[test]
    fn test_reopen_sees_forced_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logfile.data");

        {
            let manager = LogManager::open(&path).unwrap();
            let xact = Xact::new(1);
            manager.log_begin(&xact);
            manager.log_commit(&xact).unwrap();
        }

        let manager = LogManager::open(&path).unwrap();
        assert!(manager.has_records());
        assert_eq!(manager.next_lsn(), 56);
        assert_eq!(manager.flushed_lsn(), 56);

        manager.truncate().unwrap();
        assert!(!manager.has_records());
    }
}
