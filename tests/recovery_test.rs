mod common;

use std::convert::TryInto;

use small_kv::{RecoveryMode, SmallError};

use crate::common::{new_db, read_trace, reopen, reopen_with_crash, value_str};

/// Commit a value, "crash" before the dirty page reaches disk, and let
/// redo reinstate it.
#[test]
fn test_committed_update_survives_crash() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 1, b"INIT").unwrap();
    drop(db); // clean close makes the seed durable

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    db.update(tid, 1, b"V1", trx).unwrap();
    assert_eq!(db.trx_commit(trx).unwrap(), trx);

    // crash: no flush, no clean shutdown
    std::mem::forget(db);

    let db = reopen(&dir, 32);
    let trace = read_trace(&dir);
    assert!(trace.contains("[ANALYSIS] Analysis pass start"));
    assert!(trace.contains("Winner: 1, Loser:"));
    assert!(trace.contains("[REDO] Redo pass start"));
    assert!(trace.contains("[UPDATE] Transaction id 1 redo apply"));
    assert!(trace.contains("[REDO] Redo pass end"));

    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 1, trx).unwrap();
    assert_eq!(value_str(&value), "V1");
    db.trx_commit(trx).unwrap();
}

/// An uncommitted update whose log reached disk is first redone, then
/// undone with a CLR, ending at the original value.
#[test]
fn test_loser_is_rolled_back() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 3, b"THIS_IS_ORIGIN").unwrap();
    drop(db);

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();

    let loser = db.trx_begin();
    db.update(tid, 3, b"WILL_BE_ROLLBACKED", loser).unwrap();

    // an unrelated commit forces the whole log buffer, loser included
    let bystander = db.trx_begin();
    assert_eq!(db.trx_commit(bystander).unwrap(), bystander);

    std::mem::forget(db);

    let db = reopen(&dir, 32);
    let trace = read_trace(&dir);
    assert!(trace.contains("[UNDO] Undo pass start"));
    assert!(trace.contains("undo apply"));
    assert!(trace.contains("[ROLLBACK] Transaction id 1"));
    assert!(trace.contains("[UNDO] Undo pass end"));

    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 3, trx).unwrap();
    assert_eq!(value_str(&value), "THIS_IS_ORIGIN");
    db.trx_commit(trx).unwrap();
}

#[test]
fn test_redo_crash_injection_then_resume() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 1, b"INIT").unwrap();
    drop(db);

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    db.update(tid, 1, b"V1", trx).unwrap();
    db.trx_commit(trx).unwrap();
    std::mem::forget(db);

    // stop redo after a single record; the log must stay usable
    match reopen_with_crash(&dir, 32, RecoveryMode::RedoCrash, 1) {
        Err(SmallError::RecoveryCrash) => {}
        other => panic!("expected RecoveryCrash, got {:?}", other.map(|_| ())),
    }

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 1, trx).unwrap();
    assert_eq!(value_str(&value), "V1");
    db.trx_commit(trx).unwrap();
}

#[test]
fn test_undo_crash_injection_then_resume() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 3, b"THIS_IS_ORIGIN").unwrap();
    drop(db);

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let loser = db.trx_begin();
    db.update(tid, 3, b"WILL_BE_ROLLBACKED", loser).unwrap();
    let bystander = db.trx_begin();
    db.trx_commit(bystander).unwrap();
    std::mem::forget(db);

    match reopen_with_crash(&dir, 32, RecoveryMode::UndoCrash, 0) {
        Err(SmallError::RecoveryCrash) => {}
        other => panic!("expected RecoveryCrash, got {:?}", other.map(|_| ())),
    }

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 3, trx).unwrap();
    assert_eq!(value_str(&value), "THIS_IS_ORIGIN");
    db.trx_commit(trx).unwrap();
}

/// A clean recovery truncates the log, so the next open has nothing to
/// replay and the state stands.
#[test]
fn test_recovery_is_idempotent() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 1, b"INIT").unwrap();
    drop(db);

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    db.update(tid, 1, b"V1", trx).unwrap();
    db.trx_commit(trx).unwrap();
    std::mem::forget(db);

    // first reopen recovers
    let db = reopen(&dir, 32);
    drop(db);

    // second reopen has an empty log: no recovery lines at all
    let db = reopen(&dir, 32);
    let trace = read_trace(&dir);
    assert!(trace.is_empty());

    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 1, trx).unwrap();
    assert_eq!(value_str(&value), "V1");
    db.trx_commit(trx).unwrap();
}

/// Work committed after one recovery must survive the next crash: the lsn
/// space keeps growing across log truncations, so redo never mistakes a
/// new record for an already-applied one.
#[test]
fn test_update_after_recovery_survives_next_crash() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 1, b"INIT").unwrap();
    drop(db);

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    db.update(tid, 1, b"V1", trx).unwrap();
    db.trx_commit(trx).unwrap();
    std::mem::forget(db);

    // recovery number one reinstates V1 and truncates the log
    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    db.update(tid, 1, b"V2", trx).unwrap();
    db.trx_commit(trx).unwrap();
    std::mem::forget(db);

    // recovery number two must redo the second generation's update
    let db = reopen(&dir, 32);
    let trace = read_trace(&dir);
    assert!(trace.contains("redo apply"));

    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 1, trx).unwrap();
    assert_eq!(value_str(&value), "V2");
    db.trx_commit(trx).unwrap();
}

/// Every page on disk carries a page lsn no newer than the forced log.
#[test]
fn test_flushed_pages_respect_the_log() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    for key in 0..100i64 {
        db.insert(tid, key, b"w").unwrap();
    }

    for key in (0..100i64).step_by(7) {
        let trx = db.trx_begin();
        db.update(tid, key, b"w2", trx).unwrap();
        db.trx_commit(trx).unwrap();
    }
    drop(db);

    let log = std::fs::read(dir.path().join("logfile.data")).unwrap();
    let next_lsn = u64::from_le_bytes(log[8..16].try_into().unwrap());

    let data = std::fs::read(dir.path().join("DATA1")).unwrap();
    assert_eq!(data.len() % 4096, 0);
    for page in data.chunks(4096).skip(1) {
        let page_lsn = u64::from_le_bytes(page[16..24].try_into().unwrap());
        assert!(
            page_lsn <= next_lsn,
            "page lsn {} beyond forced log end {}",
            page_lsn,
            next_lsn
        );
    }
}

/// A shutdown with no crash leaves committed work in place: recovery on
/// the next open only emits CONSIDER-REDO for already-flushed pages.
#[test]
fn test_clean_shutdown_then_consider_redo() {
    let (dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();
    db.insert(tid, 1, b"INIT").unwrap();
    drop(db);

    let db = reopen(&dir, 32);
    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    db.update(tid, 1, b"V1", trx).unwrap();
    db.trx_commit(trx).unwrap();
    drop(db); // clean: pages flushed, log intact

    let db = reopen(&dir, 32);
    let trace = read_trace(&dir);
    assert!(trace.contains("[CONSIDER-REDO] Transaction id 1"));
    assert!(!trace.contains("redo apply"));

    let tid = db.open_table("DATA1").unwrap();
    let trx = db.trx_begin();
    let value = db.find(tid, 1, trx).unwrap();
    assert_eq!(value_str(&value), "V1");
    db.trx_commit(trx).unwrap();
}
