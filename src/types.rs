use crate::error::SmallError;

pub type SmallResult<T = ()> = Result<T, SmallError>;

/// Table id, 1-based. Derived from the table file name ("DATA3" -> 3).
pub type TableId = i32;

/// On-disk page number. Page 0 of every table file is the header page.
pub type PageNum = u64;

/// Transaction id, allocated by the transaction manager starting from 1.
pub type XactId = u32;

/// Log sequence number: the byte offset of a log record, counted from the
/// end of the log file header.
pub type Lsn = u64;

pub const NULL_PAGE_NUM: PageNum = 0;

/// Sentinel for "no log record". The first record after a truncation sits
/// at LSN 0 as well, which is harmless: chain walks terminate on the BEGIN
/// record type, not on a null compare.
pub const NULL_LSN: Lsn = 0;

/// Identifies a single record slot for locking purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HierarchyId {
    pub table_id: TableId,
    pub pagenum: PageNum,
    pub slot: usize,
}

impl HierarchyId {
    pub fn new(table_id: TableId, pagenum: PageNum, slot: usize) -> Self {
        Self {
            table_id,
            pagenum,
            slot,
        }
    }
}

impl std::fmt::Display for HierarchyId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.table_id, self.pagenum, self.slot)
    }
}
