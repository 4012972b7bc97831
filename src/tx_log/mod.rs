mod log_manager;
mod record;
mod recovery;

pub use log_manager::{LogManager, LOG_FILE_HEADER_SIZE};
pub use record::{LogBody, LogRecord, UpdateImage, IMAGE_SIZE, IMAGE_USED};
pub use recovery::{Recovery, RecoveryMode, RecoveryOutcome};
