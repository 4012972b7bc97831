mod common;

use rand::prelude::*;
use small_kv::{Database, SmallError, TableId};

use crate::common::{new_db, value_str};

fn check_tree(db: &Database, tid: TableId) {
    if let Err(e) = db.check_integrity(tid) {
        panic!("{}\n{}", e, db.draw_tree(tid).unwrap());
    }
}

#[test]
fn test_insert_then_find() {
    let (_dir, db) = new_db(64);
    let tid = db.open_table("DATA1").unwrap();

    for key in 0..500i64 {
        db.insert(tid, key, format!("value_{}", key).as_bytes())
            .unwrap();
    }
    check_tree(&db, tid);

    let trx = db.trx_begin();
    for key in (0..500i64).step_by(97) {
        let value = db.find(tid, key, trx).unwrap();
        assert_eq!(value_str(&value), format!("value_{}", key));
    }
    assert_eq!(db.trx_commit(trx).unwrap(), trx);

    let trx = db.trx_begin();
    assert!(matches!(
        db.find(tid, 500, trx),
        Err(SmallError::NotFound(500))
    ));
    db.trx_commit(trx).unwrap();
}

#[test]
fn test_duplicate_key_refused() {
    let (_dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();

    db.insert(tid, 7, b"first").unwrap();
    assert!(matches!(
        db.insert(tid, 7, b"second"),
        Err(SmallError::DuplicateKey(7))
    ));
}

#[test]
fn test_shuffled_insert_keeps_order() {
    let (_dir, db) = new_db(64);
    let tid = db.open_table("DATA1").unwrap();

    let mut keys: Vec<i64> = (0..2000).collect();
    let mut rng = rand::thread_rng();
    keys.shuffle(&mut rng);

    for &key in keys.iter() {
        db.insert(tid, key, b"x").unwrap();
    }
    check_tree(&db, tid);

    let all = db.find_range(tid, i64::min_value(), i64::max_value()).unwrap();
    assert_eq!(all.len(), 2000);
    for (index, record) in all.iter().enumerate() {
        assert_eq!(record.key, index as i64);
    }
}

#[test]
fn test_find_range_is_inclusive_and_sorted() {
    let (_dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();

    for key in (0..100i64).filter(|k| k % 3 == 0) {
        db.insert(tid, key, b"r").unwrap();
    }

    let hits = db.find_range(tid, 9, 30).unwrap();
    let keys: Vec<i64> = hits.iter().map(|r| r.key).collect();
    assert_eq!(keys, vec![9, 12, 15, 18, 21, 24, 27, 30]);

    assert!(db.find_range(tid, 200, 300).unwrap().is_empty());
    assert!(db.find_range(tid, 31, 32).unwrap().is_empty());
}

#[test]
fn test_delete_down_to_empty_tree() {
    let (_dir, db) = new_db(64);
    let tid = db.open_table("DATA1").unwrap();

    let mut keys: Vec<i64> = (0..1500).collect();
    let mut rng = rand::thread_rng();
    keys.shuffle(&mut rng);

    for &key in keys.iter() {
        db.insert(tid, key, b"d").unwrap();
    }

    keys.shuffle(&mut rng);
    for (count, &key) in keys.iter().enumerate() {
        db.delete(tid, key).unwrap();
        if count % 250 == 0 {
            check_tree(&db, tid);
        }
    }
    check_tree(&db, tid);

    assert!(db
        .find_range(tid, i64::min_value(), i64::max_value())
        .unwrap()
        .is_empty());

    // the tree still works after collapsing to nothing
    db.insert(tid, 42, b"again").unwrap();
    let hits = db.find_range(tid, 0, 100).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, 42);
}

#[test]
fn test_delete_missing_key_fails() {
    let (_dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();

    db.insert(tid, 1, b"one").unwrap();
    assert!(matches!(db.delete(tid, 2), Err(SmallError::NotFound(2))));
}

#[test]
fn test_data_survives_close_and_reopen_of_table() {
    let (_dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();

    for key in 0..300i64 {
        db.insert(tid, key, format!("{}", key).as_bytes()).unwrap();
    }

    db.close_table(tid).unwrap();
    let tid = db.open_table("DATA1").unwrap();

    check_tree(&db, tid);
    let all = db.find_range(tid, 0, 299).unwrap();
    assert_eq!(all.len(), 300);
}

#[test]
fn test_table_name_rules() {
    let (_dir, db) = new_db(32);

    assert_eq!(db.open_table("DATA3").unwrap(), 3);
    // re-opening hands back the same id
    assert_eq!(db.open_table("DATA3").unwrap(), 3);

    assert!(db.open_table("DATA11").is_err());
    assert!(db.open_table("snake").is_err());

    assert!(matches!(
        db.close_table(9),
        Err(SmallError::NoSuchTable(9))
    ));
}

#[test]
fn test_two_tables_are_independent() {
    let (_dir, db) = new_db(64);
    let t1 = db.open_table("DATA1").unwrap();
    let t2 = db.open_table("DATA2").unwrap();

    for key in 0..200i64 {
        db.insert(t1, key, b"one").unwrap();
        db.insert(t2, key * 10, b"two").unwrap();
    }
    check_tree(&db, t1);
    check_tree(&db, t2);

    // same keys, different tables, different rows
    let trx = db.trx_begin();
    assert_eq!(value_str(&db.find(t1, 50, trx).unwrap()), "one");
    assert_eq!(value_str(&db.find(t2, 50, trx).unwrap()), "two");
    db.trx_commit(trx).unwrap();

    db.delete(t1, 50).unwrap();
    assert!(db.find_range(t1, 50, 50).unwrap().is_empty());
    assert_eq!(db.find_range(t2, 50, 50).unwrap().len(), 1);

    db.close_table(t1).unwrap();
    // the other table keeps working after its sibling closed
    db.insert(t2, 5, b"late").unwrap();
    check_tree(&db, t2);
}

#[test]
fn test_values_are_padded_to_fixed_width() {
    let (_dir, db) = new_db(32);
    let tid = db.open_table("DATA1").unwrap();

    db.insert(tid, 1, b"short").unwrap();

    let trx = db.trx_begin();
    let value = db.find(tid, 1, trx).unwrap();
    db.trx_commit(trx).unwrap();

    assert_eq!(&value[..5], b"short");
    assert!(value[5..].iter().all(|&b| b == 0));
}
