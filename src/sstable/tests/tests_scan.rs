//! Table range-scan and full-iteration tests.
//!
//! Coverage:
//! - full iteration yields every record in key order
//! - range scans honor half-open bounds, including bounds that fall
//!   between records and before/after the table
//! - index positioning lands at most one interval early and skips
//!   correctly to the first in-range record

use crate::sstable::tests::{build_and_open, iter_all, iter_range, seq_records};
use tempfile::TempDir;

#[test]
fn full_iteration_in_key_order() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let records = seq_records(50);
    let table = build_and_open(&path, &records, 4);

    let keys: Vec<Vec<u8>> = iter_all(&table).map(|r| r.key().to_vec()).collect();
    let expected: Vec<Vec<u8>> = records.iter().map(|r| r.key().to_vec()).collect();
    assert_eq!(keys, expected);
}

#[test]
fn range_scan_half_open_bounds() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let records = seq_records(100);
    let table = build_and_open(&path, &records, 7);

    let keys: Vec<Vec<u8>> = iter_range(&table, b"key-0010", b"key-0015")
        .map(|r| r.key().to_vec())
        .collect();
    assert_eq!(
        keys,
        (10..15)
            .map(|i| format!("key-{i:04}").into_bytes())
            .collect::<Vec<_>>()
    );
}

#[test]
fn range_bounds_between_and_outside_records() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let records = seq_records(20);
    let table = build_and_open(&path, &records, 3);

    // Start falls between records; end past the table.
    let keys: Vec<Vec<u8>> = iter_range(&table, b"key-0017x", b"zzz")
        .map(|r| r.key().to_vec())
        .collect();
    assert_eq!(keys, vec![b"key-0018".to_vec(), b"key-0019".to_vec()]);

    // Whole range before the table.
    assert_eq!(iter_range(&table, b"aaa", b"bbb").count(), 0);

    // Whole range after the table.
    assert_eq!(iter_range(&table, b"xxx", b"yyy").count(), 0);

    // Range covering everything.
    assert_eq!(iter_range(&table, b"", b"\xFF").count(), 20);
}

#[test]
fn scan_start_before_min_key_begins_at_first_record() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let records = seq_records(10);
    let table = build_and_open(&path, &records, 4);

    let first = iter_range(&table, b"a", b"zzz").next().unwrap();
    assert_eq!(first.key(), b"key-0000");
}
