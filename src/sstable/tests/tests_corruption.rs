//! Table corruption detection tests.
//!
//! A table that fails structural validation must be rejected at open so
//! the manifest loader can skip it; corruption inside the data region
//! must terminate iteration without touching other tables.
//!
//! Coverage:
//! - file shorter than the footer
//! - corrupted footer magic
//! - corrupted block checksum (meta block)
//! - truncated data region detected during iteration

use crate::sstable::tests::{build_and_open, iter_all, seq_records};
use crate::sstable::{FOOTER_SIZE, Table, TableError};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

fn stomp(path: &Path, offset_from_end: i64, bytes: &[u8]) {
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    f.seek(SeekFrom::End(offset_from_end)).unwrap();
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}

#[test]
fn rejects_file_smaller_than_footer() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("tiny.sst");
    std::fs::write(&path, b"not a table").unwrap();

    assert!(matches!(
        Table::open(&path, 1),
        Err(TableError::Malformed(_))
    ));
}

#[test]
fn rejects_corrupted_magic() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let table = build_and_open(&path, &seq_records(10), 4);
    drop(table);

    // Footer starts FOOTER_SIZE bytes from the end; magic is its first field.
    stomp(&path, -(FOOTER_SIZE as i64), &[0x00, 0x00, 0x00, 0x00]);

    assert!(matches!(
        Table::open(&path, 1),
        Err(TableError::Malformed(_))
    ));
}

#[test]
fn rejects_corrupted_block_checksum() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let table = build_and_open(&path, &seq_records(10), 4);
    drop(table);

    // The meta block and its CRC sit immediately before the footer; a
    // flip inside either fails the checksum verification.
    stomp(&path, -(FOOTER_SIZE as i64) - 2, &[0xFF, 0xFF]);

    assert!(matches!(
        Table::open(&path, 1),
        Err(TableError::ChecksumMismatch)
    ));
}

#[test]
fn iteration_stops_at_data_corruption() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("t.sst");
    let records = seq_records(50);
    let table = build_and_open(&path, &records, 4);

    // Sanity: the intact table iterates fully.
    assert_eq!(iter_all(&table).count(), 50);

    // Corrupting record framing mid-data is only detectable during the
    // decode walk; the iterator must stop rather than panic or loop.
    // (Auxiliary blocks stay intact, so the table still opens.)
    drop(table);
    let file_len = std::fs::metadata(&path).unwrap().len();
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .unwrap();
    // Blow up a length varint early in the data region: offset 9 is the
    // first record's key_len field.
    f.seek(SeekFrom::Start(9)).unwrap();
    f.write_all(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();
    f.sync_all().unwrap();
    drop(f);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), file_len);

    let table = std::sync::Arc::new(Table::open(&path, 1).unwrap());
    // The walk ends early instead of yielding garbage.
    assert!(iter_all(&table).count() < 50);
}
