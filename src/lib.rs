pub mod btree;
pub mod transaction;
pub mod tx_log;

mod database;
mod error;
mod io;
mod types;
mod utils;

pub use btree::page::{Record, VALUE_SIZE};
pub use database::{Database, DatabaseOptions};
pub use error::SmallError;
pub use tx_log::RecoveryMode;
pub use types::{HierarchyId, Lsn, PageNum, SmallResult, TableId, XactId};
