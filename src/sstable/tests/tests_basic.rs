//! Table build / open round-trip tests.
//!
//! Coverage:
//! - build then open restores metadata exactly
//! - builder rejects out-of-order and duplicate keys
//! - builder rejects an empty table
//! - temp file disappears after publish; abandon removes it

use crate::sstable::tests::{build_and_open, del, put, seq_records};
use crate::sstable::{Table, TableBuilder};
use tempfile::TempDir;

#[test]
fn build_open_restores_metadata() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000001.sst");

    let records = vec![
        put(b"aaa", b"1", 10),
        del(b"mmm", 30),
        put(b"zzz", b"3", 20),
    ];
    let table = build_and_open(&path, &records, 16);

    let meta = table.meta();
    assert_eq!(meta.min_key, b"aaa".to_vec());
    assert_eq!(meta.max_key, b"zzz".to_vec());
    assert_eq!(meta.key_count, 3);
    assert_eq!(meta.seq_min, 10);
    assert_eq!(meta.seq_max, 30);
    assert_eq!(meta.bloom_fp_rate, 0.01);
    assert!(table.file_size() > 0);
}

#[test]
fn reopen_after_reload_matches() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000002.sst");

    let records = seq_records(100);
    let table = build_and_open(&path, &records, 8);
    drop(table);

    let reopened = Table::open(&path, 2).unwrap();
    assert_eq!(reopened.id(), 2);
    assert_eq!(reopened.meta().key_count, 100);
    assert_eq!(reopened.meta().min_key, b"key-0000".to_vec());
    assert_eq!(reopened.meta().max_key, b"key-0099".to_vec());
}

#[test]
fn builder_rejects_out_of_order_keys() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("bad.sst");

    let mut builder = TableBuilder::new(&path, 2, 16, 0.01).unwrap();
    builder.add(&put(b"bbb", b"1", 1)).unwrap();
    assert!(builder.add(&put(b"aaa", b"2", 2)).is_err());
}

#[test]
fn builder_rejects_duplicate_keys() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("dup.sst");

    let mut builder = TableBuilder::new(&path, 2, 16, 0.01).unwrap();
    builder.add(&put(b"same", b"1", 2)).unwrap();
    assert!(builder.add(&put(b"same", b"2", 1)).is_err());
}

#[test]
fn builder_rejects_empty_table() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("empty.sst");

    let builder = TableBuilder::new(&path, 0, 16, 0.01).unwrap();
    assert!(builder.finish().is_err());
    assert!(!path.exists());
}

#[test]
fn publish_is_atomic_via_rename() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000003.sst");
    let tmp_path = path.with_extension("tmp");

    let mut builder = TableBuilder::new(&path, 1, 16, 0.01).unwrap();
    assert!(tmp_path.exists());
    assert!(!path.exists());

    builder.add(&put(b"k", b"v", 1)).unwrap();
    builder.finish().unwrap();

    assert!(path.exists());
    assert!(!tmp_path.exists());
}

#[test]
fn abandon_removes_temp_file() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000004.sst");
    let tmp_path = path.with_extension("tmp");

    let mut builder = TableBuilder::new(&path, 1, 16, 0.01).unwrap();
    builder.add(&put(b"k", b"v", 1)).unwrap();
    builder.abandon();

    assert!(!tmp_path.exists());
    assert!(!path.exists());
}

#[test]
fn obsolete_table_unlinks_on_drop() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("000005.sst");

    let table = build_and_open(&path, &[put(b"k", b"v", 1)], 16);
    table.mark_obsolete();
    assert!(path.exists());

    drop(table);
    assert!(!path.exists());
}
