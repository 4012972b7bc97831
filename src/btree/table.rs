use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use log::debug;

use crate::{
    btree::{buffer_pool::BufferPool, tree::BPTree},
    error::SmallError,
    transaction::{LockManager, XactManager},
    tx_log::LogManager,
    types::{SmallResult, TableId},
};

pub const MAX_TABLE_COUNT: TableId = 10;

/// Table files are named `DATA<n>`; `n` (1-based) doubles as the table id.
pub fn parse_table_name(name: &str) -> Result<TableId, SmallError> {
    let digits = match name.strip_prefix("DATA") {
        Some(digits) if !digits.is_empty() => digits,
        _ => return Err(SmallError::InvalidTableName(name.to_string())),
    };

    let id: TableId = digits
        .parse()
        .map_err(|_| SmallError::InvalidTableName(name.to_string()))?;

    if id < 1 || id > MAX_TABLE_COUNT {
        return Err(SmallError::InvalidTableName(name.to_string()));
    }

    Ok(id)
}

pub struct Table {
    id: TableId,
    name: String,
}

impl Table {
    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Owns the buffer pool and the tree, and maps table names to open
/// tables. Files live under `data_dir`.
pub struct TableManager {
    pool: Arc<BufferPool>,
    tree: BPTree,
    data_dir: PathBuf,
    tables: Mutex<HashMap<TableId, Table>>,
}

impl TableManager {
    pub fn new(
        num_buf: usize,
        data_dir: PathBuf,
        lock_manager: Arc<LockManager>,
        log_manager: Arc<LogManager>,
        xact_manager: Arc<XactManager>,
    ) -> Result<Self, SmallError> {
        let pool = Arc::new(BufferPool::new(num_buf, Arc::clone(&log_manager))?);
        let tree = BPTree::new(
            Arc::clone(&pool),
            lock_manager,
            log_manager,
            xact_manager,
        );

        Ok(Self {
            pool,
            tree,
            data_dir,
            tables: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn tree(&self) -> &BPTree {
        &self.tree
    }

    /// Open (creating if needed) the table file. Re-opening a table that
    /// is already open returns its existing id.
    pub fn open_table(&self, name: &str) -> Result<TableId, SmallError> {
        let id = parse_table_name(name)?;

        let mut tables = self.tables.lock().unwrap();
        if tables.contains_key(&id) {
            return Ok(id);
        }

        self.pool.open_table(id, self.data_dir.join(name))?;
        tables.insert(
            id,
            Table {
                id,
                name: name.to_string(),
            },
        );

        debug!("opened table {} (id {})", name, id);
        Ok(id)
    }

    pub fn close_table(&self, id: TableId) -> SmallResult {
        let mut tables = self.tables.lock().unwrap();
        if tables.remove(&id).is_none() {
            return Err(SmallError::NoSuchTable(id));
        }

        self.pool.close_table(id)?;
        debug!("closed table {}", id);
        Ok(())
    }

    pub fn is_open(&self, id: TableId) -> bool {
        self.tables.lock().unwrap().contains_key(&id)
    }

    pub fn get_table(&self, id: TableId) -> Result<TableId, SmallError> {
        if self.is_open(id) {
            Ok(id)
        } else {
            Err(SmallError::NoSuchTable(id))
        }
    }

    /// Close every open table, flushing its dirty frames.
    pub fn close_all(&self) -> SmallResult {
        let ids: Vec<TableId> = self.tables.lock().unwrap().keys().cloned().collect();
        for id in ids {
            self.close_table(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_table_name() {
        assert_eq!(parse_table_name("DATA1").unwrap(), 1);
        assert_eq!(parse_table_name("DATA10").unwrap(), 10);

        assert!(parse_table_name("DATA0").is_err());
        assert!(parse_table_name("DATA11").is_err());
        assert!(parse_table_name("DATA").is_err());
        assert!(parse_table_name("DATAx").is_err());
        assert!(parse_table_name("data1").is_err());
        assert!(parse_table_name("TBL1").is_err());
    }
}
