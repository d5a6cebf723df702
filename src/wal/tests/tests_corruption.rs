//! WAL corruption detection tests.
//!
//! Corruption is simulated by writing invalid bytes directly into the
//! WAL file on disk. In every case replay must stop at the corrupted
//! frame and return only the frames before it — corruption is never
//! fatal to recovery.
//!
//! Coverage:
//! - flipped payload byte → frame rejected, earlier frames survive
//! - corrupted stored checksum → frame rejected
//! - length field blown up past the payload bound → frame rejected
//! - corruption mid-log masks everything after it (replay is prefix-only)

use crate::wal::Wal;
use crate::wal::tests::{MAX_PAYLOAD, put};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use tempfile::TempDir;

/// Overwrites `bytes` at `offset` (from start when positive, from end
/// when negative).
fn stomp(path: &Path, offset: i64, bytes: &[u8]) {
    let mut f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    if offset >= 0 {
        f.seek(SeekFrom::Start(offset as u64)).unwrap();
    } else {
        f.seek(SeekFrom::End(offset)).unwrap();
    }
    f.write_all(bytes).unwrap();
    f.sync_all().unwrap();
}

/// # Scenario
/// The last frame's payload is corrupted; the checksum no longer
/// matches.
///
/// # Expected behavior
/// Replay yields the first two frames; the corrupted third is dropped.
#[test]
fn corrupted_last_frame_payload() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal.log");

    let wal = Wal::create(&path, true).unwrap();
    for i in 0..3u64 {
        wal.append(&put(format!("key-{i}").as_bytes(), b"value", i + 1))
            .unwrap();
    }
    drop(wal);

    stomp(&path, -3, &[0xAA, 0xBB, 0xCC]);

    let replayed = Wal::replay(&path, MAX_PAYLOAD).unwrap();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].key(), b"key-0");
    assert_eq!(replayed[1].key(), b"key-1");
}

/// # Scenario
/// The stored CRC32 of the first frame is overwritten while the payload
/// stays intact.
///
/// # Expected behavior
/// Replay stops immediately: zero records.
#[test]
fn corrupted_first_frame_checksum() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal.log");

    let wal = Wal::create(&path, true).unwrap();
    wal.append(&put(b"only", b"frame", 1)).unwrap();
    drop(wal);

    stomp(&path, 0, &[0xDE, 0xAD, 0xBE, 0xEF]);

    let replayed = Wal::replay(&path, MAX_PAYLOAD).unwrap();
    assert!(replayed.is_empty());
}

/// # Scenario
/// The length field of the first frame is overwritten with 0xFFFFFFFF,
/// far past the payload bound.
///
/// # Expected behavior
/// Replay treats the frame as corrupt and stops; no allocation bomb.
#[test]
fn corrupted_length_field() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal.log");

    let wal = Wal::create(&path, true).unwrap();
    wal.append(&put(b"k", b"v", 1)).unwrap();
    drop(wal);

    // Frame layout: [crc32 (4)][payload_len (4)][payload].
    stomp(&path, 4, &[0xFF, 0xFF, 0xFF, 0xFF]);

    let replayed = Wal::replay(&path, MAX_PAYLOAD).unwrap();
    assert!(replayed.is_empty());
}

/// # Scenario
/// A frame in the middle of the log is corrupted; two valid frames
/// follow it.
///
/// # Expected behavior
/// Replay is strictly prefix-based: only the frame before the corruption
/// survives, the valid-looking frames after it are discarded too (their
/// framing can no longer be trusted).
#[test]
fn corruption_masks_later_frames() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("wal.log");

    let wal = Wal::create(&path, true).unwrap();
    let mut frame_ends = Vec::new();
    for i in 0..3u64 {
        wal.append(&put(format!("key-{i}").as_bytes(), b"payload-bytes", i + 1))
            .unwrap();
        frame_ends.push(wal.size());
    }
    drop(wal);

    // Corrupt inside the second frame's payload.
    let second_frame_mid = frame_ends[0] as i64 + 12;
    stomp(&path, second_frame_mid, &[0x00, 0x11, 0x22]);

    let replayed = Wal::replay(&path, MAX_PAYLOAD).unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].key(), b"key-0");
}
