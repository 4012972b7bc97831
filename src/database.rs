use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};

use crate::{
    btree::{
        page::{Record, VALUE_SIZE},
        table::TableManager,
    },
    error::SmallError,
    transaction::{LockManager, XactManager},
    tx_log::{LogManager, Recovery, RecoveryMode, RecoveryOutcome},
    types::{SmallResult, TableId, XactId},
};

pub struct DatabaseOptions {
    pub num_buf: usize,
    pub mode: RecoveryMode,
    pub log_num: usize,
    pub log_path: PathBuf,
    pub logmsg_path: PathBuf,
    pub data_dir: PathBuf,
}

impl DatabaseOptions {
    /// Defaults rooted in `dir`: 1000 frames, no crash injection, log
    /// files named as the original tooling expects.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            num_buf: 1000,
            mode: RecoveryMode::Normal,
            log_num: 0,
            log_path: dir.join("logfile.data"),
            logmsg_path: dir.join("logmsg.txt"),
            data_dir: dir,
        }
    }

    pub fn num_buf(mut self, num_buf: usize) -> Self {
        self.num_buf = num_buf;
        self
    }

    pub fn crash(mut self, mode: RecoveryMode, log_num: usize) -> Self {
        self.mode = mode;
        self.log_num = log_num;
        self
    }
}

/// The database handle. Owns the four managers; everything the public API
/// does flows through it, so two handles never share state implicitly.
pub struct Database {
    lock_manager: Arc<LockManager>,
    log_manager: Arc<LogManager>,
    xact_manager: Arc<XactManager>,
    table_manager: Arc<TableManager>,
}

impl Database {
    /// Bring the system up: lock manager, log manager, transaction
    /// manager, then table manager with its buffer pool. When the log
    /// holds records, recovery runs before the handle is returned; an
    /// injected crash surfaces as `RecoveryCrash` with the log intact.
    pub fn open(options: DatabaseOptions) -> Result<Self, SmallError> {
        let lock_manager = Arc::new(LockManager::new());
        let log_manager = Arc::new(LogManager::open(&options.log_path)?);
        let xact_manager = Arc::new(XactManager::new(
            Arc::clone(&lock_manager),
            Arc::clone(&log_manager),
        ));
        let table_manager = Arc::new(TableManager::new(
            options.num_buf,
            options.data_dir.clone(),
            Arc::clone(&lock_manager),
            Arc::clone(&log_manager),
            Arc::clone(&xact_manager),
        )?);

        let db = Self {
            lock_manager,
            log_manager,
            xact_manager,
            table_manager,
        };

        if db.log_manager.has_records() {
            let outcome = {
                let mut recovery = Recovery::new(
                    &db.log_manager,
                    db.table_manager.pool(),
                    &db.table_manager,
                    &options.logmsg_path,
                    options.mode,
                    options.log_num,
                )?;
                recovery.run()?
            };

            if outcome == RecoveryOutcome::Crashed {
                warn!("recovery crashed by injection; closing tables");
                db.table_manager.close_all()?;
                return Err(SmallError::RecoveryCrash);
            }
        } else {
            // the trace file exists after every open, recovered or not
            File::create(&options.logmsg_path).map_err(SmallError::io)?;
        }

        info!("database open at {:?}", options.data_dir);
        Ok(db)
    }

    /// Close all tables (flushing their dirty pages) and force the log.
    pub fn shutdown(&self) -> SmallResult {
        self.table_manager.close_all()?;
        self.log_manager.force()?;
        info!("database shut down");
        Ok(())
    }

    pub fn open_table(&self, name: &str) -> Result<TableId, SmallError> {
        self.table_manager.open_table(name)
    }

    pub fn close_table(&self, table_id: TableId) -> SmallResult {
        self.table_manager.close_table(table_id)
    }

    /// Bulk insert; not logged, so it belongs before the transactional
    /// workload on a table (a clean close makes it durable).
    pub fn insert(&self, table_id: TableId, key: i64, value: &[u8]) -> SmallResult {
        self.table_manager.get_table(table_id)?;
        self.table_manager
            .tree()
            .insert(table_id, &Record::new(key, value))
    }

    /// Bulk delete; see `insert`.
    pub fn delete(&self, table_id: TableId, key: i64) -> SmallResult {
        self.table_manager.get_table(table_id)?;
        self.table_manager.tree().remove(table_id, key)
    }

    /// Shared-locked read under the given transaction.
    pub fn find(
        &self,
        table_id: TableId,
        key: i64,
        trx_id: XactId,
    ) -> Result<[u8; VALUE_SIZE], SmallError> {
        self.table_manager.get_table(table_id)?;
        let xact = self.xact_manager.get(trx_id)?;
        let record = self
            .table_manager
            .tree()
            .find(table_id, key, Some(&xact))?;
        Ok(record.value)
    }

    /// Exclusive-locked write under the given transaction.
    pub fn update(
        &self,
        table_id: TableId,
        key: i64,
        value: &[u8],
        trx_id: XactId,
    ) -> SmallResult {
        self.table_manager.get_table(table_id)?;
        let xact = self.xact_manager.get(trx_id)?;
        self.table_manager.tree().update(table_id, key, value, &xact)
    }

    /// Inclusive ascending range scan.
    pub fn find_range(
        &self,
        table_id: TableId,
        key_start: i64,
        key_end: i64,
    ) -> Result<Vec<Record>, SmallError> {
        self.table_manager.get_table(table_id)?;
        self.table_manager
            .tree()
            .find_range(table_id, key_start, key_end)
    }

    pub fn trx_begin(&self) -> XactId {
        self.xact_manager.begin().id()
    }

    pub fn trx_commit(&self, trx_id: XactId) -> Result<XactId, SmallError> {
        let xact = self.xact_manager.get(trx_id)?;
        self.xact_manager.commit(&xact)?;
        Ok(trx_id)
    }

    pub fn trx_abort(&self, trx_id: XactId) -> Result<XactId, SmallError> {
        let xact = self.xact_manager.get(trx_id)?;
        self.xact_manager
            .abort(&xact, self.table_manager.pool())?;
        Ok(trx_id)
    }

    /// Structural self-check of one table; see `BPTree::check_integrity`.
    pub fn check_integrity(&self, table_id: TableId) -> SmallResult {
        self.table_manager.get_table(table_id)?;
        self.table_manager.tree().check_integrity(table_id)
    }

    pub fn draw_tree(&self, table_id: TableId) -> Result<String, SmallError> {
        self.table_manager.get_table(table_id)?;
        self.table_manager.tree().draw_tree(table_id)
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("shutdown on drop failed: {}", e);
        }
    }
}
