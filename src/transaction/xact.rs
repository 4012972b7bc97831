use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use log::debug;

use crate::{
    btree::buffer_pool::BufferPool,
    btree::page::{PAGE_HEADER_SIZE, RECORD_SIZE},
    error::SmallError,
    transaction::lock_manager::{Lock, LockAcquireResult, LockManager, LockType},
    tx_log::{LogBody, LogManager},
    types::{HierarchyId, Lsn, SmallResult, XactId},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum XactStatus {
    Active,
    Committed,
    Aborted,
}

/// A running transaction: its id, the tail of its log chain, and the locks
/// it holds. A transaction is driven by a single thread; the lock list
/// mutex only guards against a concurrent `trx_abort` from elsewhere.
pub struct Xact {
    id: XactId,
    last_lsn: AtomicU64,
    locks: Mutex<Vec<Arc<Lock>>>,
}

impl Xact {
    pub(crate) fn new(id: XactId) -> Self {
        Self {
            id,
            last_lsn: AtomicU64::new(0),
            locks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> XactId {
        self.id
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::SeqCst)
    }

    pub(crate) fn set_last_lsn(&self, lsn: Lsn) {
        self.last_lsn.store(lsn, Ordering::SeqCst);
    }

    /// Take a lock on a record slot, reusing one this transaction already
    /// holds when it is at least as strong.
    pub(crate) fn add_lock(
        &self,
        lock_manager: &LockManager,
        hid: HierarchyId,
        lock_type: LockType,
    ) -> (Option<Arc<Lock>>, LockAcquireResult) {
        {
            let locks = self.locks.lock().unwrap();
            if let Some(held) = locks
                .iter()
                .find(|l| l.hid() == hid && l.lock_type().covers(lock_type))
            {
                return (Some(Arc::clone(held)), LockAcquireResult::Acquired);
            }
        }

        let (lock, result) = lock_manager.acquire(hid, self.id, lock_type);
        match result {
            LockAcquireResult::Acquired | LockAcquireResult::NeedsWait => {
                self.locks.lock().unwrap().push(Arc::clone(lock.as_ref().unwrap()));
            }
            _ => {}
        }

        (lock, result)
    }

    pub(crate) fn release_all_locks(&self, lock_manager: &LockManager) -> SmallResult {
        let mut locks = self.locks.lock().unwrap();
        for lock in locks.iter() {
            lock_manager.release(lock)?;
        }
        locks.clear();
        Ok(())
    }
}

struct XactTable {
    counter: XactId,
    xacts: HashMap<XactId, Arc<Xact>>,
    status: HashMap<XactId, XactStatus>,
}

/// Transaction lifecycle: hands out ids, logs BEGIN/COMMIT/ROLLBACK, and
/// drives undo on abort.
pub struct XactManager {
    lock_manager: Arc<LockManager>,
    log_manager: Arc<LogManager>,
    inner: Mutex<XactTable>,
}

impl XactManager {
    pub fn new(lock_manager: Arc<LockManager>, log_manager: Arc<LogManager>) -> Self {
        Self {
            lock_manager,
            log_manager,
            inner: Mutex::new(XactTable {
                counter: 0,
                xacts: HashMap::new(),
                status: HashMap::new(),
            }),
        }
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock_manager
    }

    pub fn begin(&self) -> Arc<Xact> {
        let xact = {
            let mut inner = self.inner.lock().unwrap();
            inner.counter += 1;
            let xact = Arc::new(Xact::new(inner.counter));
            inner.xacts.insert(xact.id(), Arc::clone(&xact));
            inner.status.insert(xact.id(), XactStatus::Active);
            xact
        };

        self.log_manager.log_begin(&xact);
        debug!("xact {} begins", xact.id());
        xact
    }

    /// Look up a live transaction. Calls against an aborted transaction
    /// keep failing with `TransactionAborted`.
    pub fn get(&self, xid: XactId) -> Result<Arc<Xact>, SmallError> {
        let inner = self.inner.lock().unwrap();
        if let Some(xact) = inner.xacts.get(&xid) {
            return Ok(Arc::clone(xact));
        }
        match inner.status.get(&xid) {
            Some(XactStatus::Aborted) => Err(SmallError::TransactionAborted(xid)),
            _ => Err(SmallError::NoSuchTransaction(xid)),
        }
    }

    pub fn status(&self, xid: XactId) -> Option<XactStatus> {
        self.inner.lock().unwrap().status.get(&xid).cloned()
    }

    /// Release locks, then make the COMMIT record durable.
    pub fn commit(&self, xact: &Arc<Xact>) -> SmallResult {
        xact.release_all_locks(&self.lock_manager)?;

        self.log_manager.log_commit(xact)?;
        self.log_manager.remove(xact.id());

        let mut inner = self.inner.lock().unwrap();
        inner.xacts.remove(&xact.id());
        inner.status.insert(xact.id(), XactStatus::Committed);

        debug!("xact {} committed", xact.id());
        Ok(())
    }

    /// Undo every update of the transaction in reverse order, emitting a
    /// CLR per undone record, then release locks and log ROLLBACK.
    pub fn abort(&self, xact: &Arc<Xact>, pool: &BufferPool) -> SmallResult {
        self.undo(xact, pool)?;
        xact.release_all_locks(&self.lock_manager)?;

        self.log_manager.log_rollback(xact);
        self.log_manager.force()?;
        self.log_manager.remove(xact.id());

        let mut inner = self.inner.lock().unwrap();
        inner.xacts.remove(&xact.id());
        inner.status.insert(xact.id(), XactStatus::Aborted);

        debug!("xact {} aborted", xact.id());
        Ok(())
    }

    fn undo(&self, xact: &Arc<Xact>, pool: &BufferPool) -> SmallResult {
        let chain = self.log_manager.get(xact.id());

        for record in chain.iter().rev() {
            let image = match &record.body {
                LogBody::Update(image) => image,
                _ => continue,
            };

            let slot = (image.offset as usize - PAGE_HEADER_SIZE - 8) / RECORD_SIZE;
            let hid = HierarchyId::new(image.table_id, image.pagenum, slot);

            // the CLR gets its lsn before the page is touched; its images
            // are the update's, swapped
            let clr_lsn = self.log_manager.log_compensate(
                xact,
                hid,
                image.new_data(),
                image.old_data(),
                record.prev_lsn,
            );

            let page = pool.get_page(image.table_id, image.pagenum)?;
            let mut buf = page.write();
            buf.page
                .write_bytes(image.offset as usize, image.old_data());
            buf.page.set_page_lsn(clr_lsn);
            buf.mark_dirty();

            debug!(
                "xact {} undid update on {} (clr lsn {})",
                xact.id(),
                hid,
                clr_lsn
            );
        }

        Ok(())
    }
}
