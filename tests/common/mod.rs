use std::sync::Once;

use small_kv::{Database, DatabaseOptions, RecoveryMode, SmallError, VALUE_SIZE};
use tempfile::TempDir;

static INIT: Once = Once::new();

pub fn setup() {
    INIT.call_once(|| {
        env_logger::Builder::from_default_env()
            .format_timestamp_secs()
            .is_test(true)
            .init();
    });
}

/// A database rooted in its own temp dir, so tests never share state.
pub fn new_db(num_buf: usize) -> (TempDir, Database) {
    setup();
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(DatabaseOptions::new(dir.path()).num_buf(num_buf)).unwrap();
    (dir, db)
}

pub fn reopen(dir: &TempDir, num_buf: usize) -> Database {
    Database::open(DatabaseOptions::new(dir.path()).num_buf(num_buf)).unwrap()
}

pub fn reopen_with_crash(
    dir: &TempDir,
    num_buf: usize,
    mode: RecoveryMode,
    log_num: usize,
) -> Result<Database, SmallError> {
    Database::open(
        DatabaseOptions::new(dir.path())
            .num_buf(num_buf)
            .crash(mode, log_num),
    )
}

pub fn read_trace(dir: &TempDir) -> String {
    std::fs::read_to_string(dir.path().join("logmsg.txt")).unwrap()
}

/// Render a stored value up to its first NUL, the way the C-string
/// harnesses compared them.
pub fn value_str(value: &[u8; VALUE_SIZE]) -> String {
    let end = value.iter().position(|&b| b == 0).unwrap_or(VALUE_SIZE);
    String::from_utf8_lossy(&value[..end]).to_string()
}
