use std::{error::Error, fmt};

use crate::types::{TableId, XactId};

#[derive(Debug, Clone, PartialEq)]
pub enum SmallError {
    /// Underlying read/write or fsync failure. Fatal for the operation.
    Io(String),

    /// Detected corruption or a broken internal contract (e.g. no
    /// evictable frame). Not recoverable.
    Invariant(String),

    DuplicateKey(i64),
    NotFound(i64),

    /// The requested lock would close a cycle in the wait-for graph. The
    /// transaction has already been aborted when this is returned.
    Deadlock(XactId),

    /// The transaction was aborted earlier; no further calls on it succeed.
    TransactionAborted(XactId),

    NoSuchTransaction(XactId),
    NoSuchTable(TableId),
    InvalidTableName(String),

    /// An injected crash stopped recovery; the log is left intact and the
    /// next open resumes it.
    RecoveryCrash,
}

impl SmallError {
    pub fn io<E: fmt::Display>(e: E) -> Self {
        SmallError::Io(e.to_string())
    }

    pub fn invariant(msg: &str) -> Self {
        SmallError::Invariant(msg.to_string())
    }

    pub fn show_backtrace(&self) {
        let bt = backtrace::Backtrace::new();
        log::error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SmallError::Io(msg) => write!(f, "io error: {}", msg),
            SmallError::Invariant(msg) => write!(f, "invariant violated: {}", msg),
            SmallError::DuplicateKey(key) => write!(f, "duplicate key: {}", key),
            SmallError::NotFound(key) => write!(f, "key not found: {}", key),
            SmallError::Deadlock(xid) => write!(f, "deadlock detected, transaction {} aborted", xid),
            SmallError::TransactionAborted(xid) => {
                write!(f, "transaction {} has been aborted", xid)
            }
            SmallError::NoSuchTransaction(xid) => write!(f, "no such transaction: {}", xid),
            SmallError::NoSuchTable(tid) => write!(f, "no such table: {}", tid),
            SmallError::InvalidTableName(name) => write!(f, "invalid table name: {}", name),
            SmallError::RecoveryCrash => write!(f, "recovery stopped by crash injection"),
        }
    }
}

impl Error for SmallError {}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::Io(e.to_string())
    }
}
