//! Integration tests for the file-level replay, crash-tolerance, and
//! compaction invariants.

use std::fs;
use std::fs::OpenOptions;

use serde_json::json;
use tempfile::tempdir;

use stratadb::database::Database;
use stratadb::file::File;
use stratadb::log::Locking;
use stratadb::schema::schema_from_json;
use stratadb::txn::Transaction;
use stratadb::types::{Datum, Row};

fn sample_schema() -> stratadb::Schema {
    schema_from_json(&json!({
        "name": "inventory",
        "version": "1.0.0",
        "tables": {
            "items": {
                "columns": {
                    "name": {"type": "string"},
                    "qty": {"type": "integer"}
                }
            }
        }
    }))
    .unwrap()
}

fn insert_row(db: &mut Database, txn: &mut Transaction, name: &str, qty: i64) -> uuid::Uuid {
    let uuid = uuid::Uuid::new_v4();
    let mut row = Row::new(uuid);
    row.values.insert("name".to_string(), Datum::String(name.to_string()));
    row.values.insert("qty".to_string(), Datum::Integer(qty));
    txn.insert(db, "items", row).unwrap();
    uuid
}

#[test]
fn replay_determinism_across_many_commits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let mut expected_uuids = Vec::new();
    for i in 0..20 {
        let mut txn = Transaction::new();
        let uuid = insert_row(&mut db, &mut txn, &format!("widget-{}", i), i);
        file.commit(&txn, &db, true).unwrap();
        expected_uuids.push(uuid);
    }
    drop(file);

    let (_file2, db2) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    for (i, uuid) in expected_uuids.iter().enumerate() {
        let row = db2.table("items").unwrap().get(uuid).unwrap();
        assert_eq!(row.get("qty"), Some(&Datum::Integer(i as i64)));
    }
}

#[test]
fn tail_truncation_drops_only_the_final_record() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let mut txn = Transaction::new();
    let kept = insert_row(&mut db, &mut txn, "kept", 1);
    file.commit(&txn, &db, true).unwrap();

    let mut txn2 = Transaction::new();
    let _dropped = insert_row(&mut db, &mut txn2, "dropped", 2);
    file.commit(&txn2, &db, true).unwrap();
    drop(file);

    let len = fs::metadata(&path).unwrap().len();
    let f = OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(len - 3).unwrap();
    drop(f);

    let (_file3, db3) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    assert!(db3.table("items").unwrap().get(&kept).is_some());
    assert_eq!(db3.table("items").unwrap().iter().count(), 1);
}

#[test]
fn compaction_preserves_the_image_and_shrinks_the_log() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    for i in 0..10 {
        let mut txn = Transaction::new();
        insert_row(&mut db, &mut txn, &format!("item-{}", i), i);
        file.commit(&txn, &db, true).unwrap();
    }
    let size_before = fs::metadata(&path).unwrap().len();
    file.compact(&db).unwrap();
    let size_after = fs::metadata(&path).unwrap().len();
    assert!(size_after <= size_before);
    drop(file);

    let (_file2, db2) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    assert_eq!(db2.table("items").unwrap().iter().count(), 10);
}

#[test]
fn no_op_commit_appends_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let size_before = fs::metadata(&path).unwrap().len();
    let empty_txn = Transaction::new();
    file.commit(&empty_txn, &db, true).unwrap();
    let size_after = fs::metadata(&path).unwrap().len();
    assert_eq!(size_before, size_after);
}

#[test]
fn convert_drops_columns_outside_the_new_schema() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let mut txn = Transaction::new();
    insert_row(&mut db, &mut txn, "widget", 5);
    file.commit(&txn, &db, true).unwrap();
    drop(file);

    let narrower = schema_from_json(&json!({
        "name": "inventory",
        "version": "2.0.0",
        "tables": {
            "items": { "columns": { "qty": {"type": "integer"} } }
        }
    }))
    .unwrap();

    let (_file2, db2) = File::open(&path, Some(narrower), false, Locking::ForceLock).unwrap();
    let row = db2.table("items").unwrap().iter().next().unwrap();
    assert!(row.get("name").is_none());
    assert_eq!(row.get("qty"), Some(&Datum::Integer(5)));
}

/// A blob table with a single large string column, used to pile up enough
/// redundant history in the log to cross the compaction thresholds without
/// needing many distinct rows.
fn blob_schema() -> stratadb::Schema {
    schema_from_json(&json!({
        "name": "blobs",
        "version": "1.0.0",
        "tables": {
            "blobs": { "columns": { "data": {"type": "string"} } }
        }
    }))
    .unwrap()
}

#[test]
fn compaction_threshold_gate_fires_automatically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("blobs.db");
    File::create(&path, &blob_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let uuid = uuid::Uuid::new_v4();
    let mut txn = Transaction::new();
    let mut row = Row::new(uuid);
    row.values.insert("data".to_string(), Datum::String("seed".to_string()));
    txn.insert(&mut db, "blobs", row).unwrap();
    file.commit(&txn, &db, true).unwrap();

    // 100 modifies of a ~110KB payload comfortably cross both the
    // transaction-count and the 10MiB log-size gates; every modify touches
    // the same row, so the eventual snapshot stays tiny by comparison.
    let payload = "y".repeat(110_000);
    for _ in 0..100 {
        let mut txn = Transaction::new();
        let mut values = std::collections::BTreeMap::new();
        values.insert("data".to_string(), Datum::String(payload.clone()));
        txn.modify(&mut db, "blobs", uuid, values).unwrap();
        file.commit(&txn, &db, true).unwrap();
    }

    let size_after = fs::metadata(&path).unwrap().len();
    assert!(
        size_after < 2_000_000,
        "expected automatic compaction to shrink the log, got {} bytes",
        size_after
    );
    drop(file);

    let (_file2, db2) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let row = db2.table("blobs").unwrap().get(&uuid).unwrap();
    assert_eq!(row.get("data"), Some(&Datum::String(payload)));
}

#[test]
fn reopen_after_truncation_accepts_further_commits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let mut txn1 = Transaction::new();
    let first = insert_row(&mut db, &mut txn1, "first", 1);
    file.commit(&txn1, &db, true).unwrap();

    let mut txn2 = Transaction::new();
    let _lost = insert_row(&mut db, &mut txn2, "lost", 2);
    file.commit(&txn2, &db, true).unwrap();
    drop(file);

    let len = fs::metadata(&path).unwrap().len();
    let f = OpenOptions::new().write(true).open(&path).unwrap();
    f.set_len(len - 4).unwrap();
    drop(f);

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    assert_eq!(db.table("items").unwrap().iter().count(), 1);

    let mut txn3 = Transaction::new();
    let second = insert_row(&mut db, &mut txn3, "second", 3);
    file.commit(&txn3, &db, true).unwrap();
    drop(file);

    let (_file2, db2) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    assert_eq!(db2.table("items").unwrap().iter().count(), 2);
    assert!(db2.table("items").unwrap().get(&first).is_some());
    assert!(db2.table("items").unwrap().get(&second).is_some());
}

#[test]
fn open_stops_replay_at_a_corrupt_non_tail_record_without_failing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("inv.db");
    File::create(&path, &sample_schema()).unwrap();

    let (mut file, mut db) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let mut txn1 = Transaction::new();
    let kept = insert_row(&mut db, &mut txn1, "kept", 1);
    file.commit(&txn1, &db, true).unwrap();
    let size_after_first = fs::metadata(&path).unwrap().len();

    let mut txn2 = Transaction::new();
    let _corrupted = insert_row(&mut db, &mut txn2, "corrupted", 2);
    file.commit(&txn2, &db, true).unwrap();
    let size_after_second = fs::metadata(&path).unwrap().len();

    let mut txn3 = Transaction::new();
    let _unreachable = insert_row(&mut db, &mut txn3, "unreachable", 3);
    file.commit(&txn3, &db, true).unwrap();
    drop(file);

    // The last byte of the second record's payload sits just before the
    // third record begins; flipping it corrupts only that record's checksum.
    assert!(size_after_second > size_after_first);
    let mut bytes = fs::read(&path).unwrap();
    let flip_at = (size_after_second - 1) as usize;
    bytes[flip_at] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let (_file2, db2) = File::open(&path, None, false, Locking::ForceLock).unwrap();
    let items = db2.table("items").unwrap();
    assert_eq!(items.iter().count(), 1);
    assert!(items.get(&kept).is_some());
}
