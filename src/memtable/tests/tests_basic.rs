//! Memtable point-operation and accounting tests.
//!
//! Coverage:
//! - apply/get round-trip, overwrite in place, tombstone lookup
//! - byte and entry accounting through inserts, overwrites, deletes
//! - max_seq tracking
//! - flush iteration yields every record, sorted, tombstones included

use crate::memtable::tests::{del, put};
use crate::memtable::{Memtable, MemtableGet};

#[test]
fn apply_get_roundtrip() {
    let mt = Memtable::new();
    mt.apply(put(b"apple", b"1", 1)).unwrap();
    mt.apply(put(b"banana", b"2", 2)).unwrap();

    assert_eq!(mt.get(b"apple").unwrap(), MemtableGet::Put(b"1".to_vec()));
    assert_eq!(mt.get(b"banana").unwrap(), MemtableGet::Put(b"2".to_vec()));
    assert_eq!(mt.get(b"cherry").unwrap(), MemtableGet::NotFound);
}

#[test]
fn overwrite_keeps_newest() {
    let mt = Memtable::new();
    mt.apply(put(b"k", b"old", 1)).unwrap();
    mt.apply(put(b"k", b"new", 2)).unwrap();

    assert_eq!(mt.get(b"k").unwrap(), MemtableGet::Put(b"new".to_vec()));
    assert_eq!(mt.entries(), 1);
}

#[test]
fn tombstone_is_a_hit_not_a_miss() {
    let mt = Memtable::new();
    mt.apply(put(b"k", b"v", 1)).unwrap();
    mt.apply(del(b"k", 2)).unwrap();

    assert_eq!(mt.get(b"k").unwrap(), MemtableGet::Tombstone);
    // The key still occupies an entry — it must flush to mask deeper levels.
    assert_eq!(mt.entries(), 1);
}

#[test]
fn byte_accounting_tracks_key_and_value_lengths() {
    let mt = Memtable::new();
    assert_eq!(mt.bytes(), 0);

    mt.apply(put(b"abc", b"12345", 1)).unwrap(); // 3 + 5
    assert_eq!(mt.bytes(), 8);

    mt.apply(put(b"xy", b"", 2)).unwrap(); // + 2 + 0
    assert_eq!(mt.bytes(), 10);

    // Overwrite with a shorter value: key bytes cancel, value shrinks.
    mt.apply(put(b"abc", b"1", 3)).unwrap();
    assert_eq!(mt.bytes(), 6);

    // Overwrite with a longer value.
    mt.apply(put(b"abc", b"123456789", 4)).unwrap();
    assert_eq!(mt.bytes(), 14);

    // Delete keeps the key resident as a tombstone (value drops to 0).
    mt.apply(del(b"abc", 5)).unwrap();
    assert_eq!(mt.bytes(), 5);
    assert_eq!(mt.entries(), 2);
}

#[test]
fn max_seq_tracks_highest_applied() {
    let mt = Memtable::new();
    assert_eq!(mt.max_seq(), 0);
    assert!(mt.is_empty());

    mt.apply(put(b"a", b"1", 7)).unwrap();
    mt.apply(put(b"b", b"2", 3)).unwrap();
    assert_eq!(mt.max_seq(), 7);
    assert!(!mt.is_empty());
}

#[test]
fn flush_iteration_is_sorted_and_complete() {
    let mt = Memtable::new();
    mt.apply(put(b"banana", b"2", 1)).unwrap();
    mt.apply(put(b"apple", b"1", 2)).unwrap();
    mt.apply(del(b"cherry", 3)).unwrap();

    let records: Vec<_> = mt.iter_for_flush().unwrap().collect();
    let keys: Vec<&[u8]> = records.iter().map(|r| r.key()).collect();
    assert_eq!(keys, vec![&b"apple"[..], b"banana", b"cherry"]);
    assert!(records[2].is_tombstone());
}
