mod lock_manager;
mod wait_for_graph;
mod xact;

pub use lock_manager::{Lock, LockAcquireResult, LockManager, LockType};
pub use xact::{Xact, XactManager, XactStatus};
