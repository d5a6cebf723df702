//! Write-Ahead Logging (WAL) Module
//!
//! This module implements the **durable**, **append-only** write-ahead log
//! that makes acknowledged writes survive abrupt process termination. Every
//! mutation is framed, CRC-protected, and appended to the current WAL file
//! before the memtable is touched; at startup the file is replayed to
//! rebuild the memtable and the engine's sequence high-water mark.
//!
//! # On-disk layout
//!
//! A WAL file is a plain sequence of frames with no file header:
//!
//! ```text
//! [CRC32_LE (4)][PAYLOAD_LEN_LE (4)][PAYLOAD]
//! [CRC32_LE (4)][PAYLOAD_LEN_LE (4)][PAYLOAD]
//! ...
//! payload = [op (1)][key_len varint][key][value_len varint][value][seq (8, LE)]
//! ```
//!
//! - `op` is `0` for a put, `1` for a delete; a delete's `value_len` must
//!   be zero.
//! - The CRC32 is computed over the payload bytes only.
//!
//! # Torn-write tolerance
//!
//! Replay validates frames sequentially. The first frame that fails its
//! length bound, CRC, or payload decode terminates replay at that offset;
//! [`Wal::recover`] then truncates the file back to the last good frame
//! boundary so the tail can never poison later appends.
//!
//! # Concurrency model
//!
//! The file handle is guarded by a `Mutex`; the engine's writer path is
//! the only appender. Replay happens before the engine goes live, on the
//! startup thread.
//!
//! # Guarantees
//!
//! - **Durability:** with `sync_on_write`, every `append()` issues an
//!   fdatasync-equivalent before returning.
//! - **Integrity:** every frame checksum is verified during replay.
//! - **Corruption detection:** replay stops at the first failed checksum
//!   or truncated frame; the engine never sees a partial record.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{File, OpenOptions},
    io::{self, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::encoding::{self, EncodingError};
use crate::engine::Record;
use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

const U32_SIZE: usize = std::mem::size_of::<u32>();
const U64_SIZE: usize = std::mem::size_of::<u64>();

/// Frame prefix: CRC32 plus payload length.
const FRAME_HEADER_SIZE: usize = U32_SIZE + U32_SIZE;

/// Operation tag for a put record.
const OP_PUT: u8 = 0;

/// Operation tag for a delete record (tombstone).
const OP_DELETE: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Frame payload exceeds the configured maximum size.
    #[error("Frame size exceeds limit ({0} bytes)")]
    FrameTooLarge(usize),

    /// The payload decoded to an ill-formed record.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Payload codec
// ------------------------------------------------------------------------------------------------

/// Encodes a record into the WAL payload format:
/// `[op][key_len varint][key][value_len varint][value][seq]`.
pub fn encode_payload(record: &Record) -> Vec<u8> {
    let mut buf = Vec::with_capacity(record.user_len() + 16);
    match record {
        Record::Put { key, value, seq } => {
            buf.push(OP_PUT);
            encoding::put_uvarint(&mut buf, key.len() as u64);
            buf.extend_from_slice(key);
            encoding::put_uvarint(&mut buf, value.len() as u64);
            buf.extend_from_slice(value);
            buf.extend_from_slice(&seq.to_le_bytes());
        }
        Record::Delete { key, seq } => {
            buf.push(OP_DELETE);
            encoding::put_uvarint(&mut buf, key.len() as u64);
            buf.extend_from_slice(key);
            encoding::put_uvarint(&mut buf, 0);
            buf.extend_from_slice(&seq.to_le_bytes());
        }
    }
    buf
}

/// Decodes one WAL payload back into a [`Record`].
///
/// The whole buffer must be consumed exactly; trailing bytes are treated
/// as corruption.
pub fn decode_payload(buf: &[u8]) -> Result<Record, WalError> {
    if buf.is_empty() {
        return Err(WalError::MalformedFrame("empty payload".into()));
    }
    let op = buf[0];
    let mut off = 1;

    let (key_len, n) = encoding::read_uvarint(&buf[off..])?;
    off += n;
    let key_len = usize::try_from(key_len)
        .map_err(|_| WalError::MalformedFrame("key length exceeds usize".into()))?;
    if buf.len() - off < key_len {
        return Err(WalError::MalformedFrame("truncated key".into()));
    }
    let key = buf[off..off + key_len].to_vec();
    off += key_len;

    let (value_len, n) = encoding::read_uvarint(&buf[off..])?;
    off += n;
    let value_len = usize::try_from(value_len)
        .map_err(|_| WalError::MalformedFrame("value length exceeds usize".into()))?;
    if buf.len() - off < value_len {
        return Err(WalError::MalformedFrame("truncated value".into()));
    }
    let value = buf[off..off + value_len].to_vec();
    off += value_len;

    if buf.len() - off != U64_SIZE {
        return Err(WalError::MalformedFrame("bad sequence field".into()));
    }
    let seq_bytes: [u8; U64_SIZE] = buf[off..off + U64_SIZE]
        .try_into()
        .map_err(|_| WalError::MalformedFrame("bad sequence field".into()))?;
    let seq = u64::from_le_bytes(seq_bytes);

    match op {
        OP_PUT => Ok(Record::Put { key, value, seq }),
        OP_DELETE => {
            if !value.is_empty() {
                return Err(WalError::MalformedFrame(
                    "delete frame carries a value".into(),
                ));
            }
            Ok(Record::Delete { key, seq })
        }
        other => Err(WalError::MalformedFrame(format!("unknown op {other}"))),
    }
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// An append-only, CRC-protected write-ahead log file.
///
/// One WAL exists per live memtable; the engine's writer mutex makes the
/// append path single-threaded, and the internal file mutex keeps the
/// handle safe to share with `stats()` readers.
#[derive(Debug)]
pub struct Wal {
    /// File handle for appends, guarded for interior mutability.
    file: Mutex<File>,

    /// Path to the WAL file on disk.
    path: PathBuf,

    /// Issue an fdatasync-equivalent after every append.
    sync_on_write: bool,

    /// Current on-disk size in bytes, maintained on append.
    size: AtomicU64,
}

impl Wal {
    /// Creates a fresh, empty WAL at `path` (truncating any existing file).
    pub fn create(path: impl AsRef<Path>, sync_on_write: bool) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&path)?;

        info!(path = %path.display(), "WAL created");

        Ok(Self {
            file: Mutex::new(file),
            path,
            sync_on_write,
            size: AtomicU64::new(0),
        })
    }

    /// Replays an existing WAL, truncates any torn tail, and reopens the
    /// file for appending.
    ///
    /// Returns the recovered WAL together with all valid records in append
    /// order. A missing file yields an empty, freshly-created WAL.
    ///
    /// `max_payload` bounds the accepted frame payload size; it is derived
    /// from the configured key/value maxima so that a corrupted length
    /// field cannot trigger a huge allocation.
    pub fn recover(
        path: impl AsRef<Path>,
        sync_on_write: bool,
        max_payload: usize,
    ) -> Result<(Self, Vec<Record>), WalError> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Ok((Self::create(path_ref, sync_on_write)?, Vec::new()));
        }

        let file = File::open(path_ref)?;
        let file_len = file.metadata()?.len();
        let (records, valid_len) = read_valid_frames(file, max_payload);

        if valid_len < file_len {
            warn!(
                path = %path_ref.display(),
                valid_len,
                file_len,
                discarded = file_len - valid_len,
                "WAL tail failed validation, truncating"
            );
            let truncate = OpenOptions::new().write(true).open(path_ref)?;
            truncate.set_len(valid_len)?;
            truncate.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(path_ref)?;

        debug!(
            path = %path_ref.display(),
            records = records.len(),
            bytes = valid_len,
            "WAL recovered"
        );

        Ok((
            Self {
                file: Mutex::new(file),
                path: path_ref.to_path_buf(),
                sync_on_write,
                size: AtomicU64::new(valid_len),
            },
            records,
        ))
    }

    /// Replays a WAL read-only, without truncating or keeping the file open.
    ///
    /// Used for frozen WAL files (`wal.log.<id>`) during startup: their
    /// contents are flushed straight to a level-0 table and the file is
    /// deleted afterwards.
    pub fn replay(path: impl AsRef<Path>, max_payload: usize) -> Result<Vec<Record>, WalError> {
        let file = File::open(path.as_ref())?;
        let file_len = file.metadata()?.len();
        let (records, valid_len) = read_valid_frames(file, max_payload);

        if valid_len < file_len {
            warn!(
                path = %path.as_ref().display(),
                valid_len,
                file_len,
                "frozen WAL has an invalid tail, replaying valid prefix only"
            );
        }

        Ok(records)
    }

    /// Appends a single record frame.
    ///
    /// The frame is `[crc32][payload_len][payload]`; the CRC is computed
    /// over the payload only. With `sync_on_write` the data is durable
    /// before this returns.
    pub fn append(&self, record: &Record) -> Result<(), WalError> {
        let payload = encode_payload(record);
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| WalError::FrameTooLarge(payload.len()))?;

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let checksum = hasher.finalize();

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&checksum.to_le_bytes());
        frame.extend_from_slice(&payload_len.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.write_all(&frame)?;
        if self.sync_on_write {
            guard.sync_data()?;
        }
        self.size.fetch_add(frame.len() as u64, Ordering::Relaxed);

        trace!(
            len = payload_len,
            seq = record.seq(),
            crc = format_args!("{checksum:08x}"),
            "WAL frame appended"
        );
        Ok(())
    }

    /// Forces all buffered frames to stable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.sync_data()?;
        Ok(())
    }

    /// Current on-disk size in bytes.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_data() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_data() {
                    error!(
                        path = %self.path.display(),
                        error = %e,
                        "WAL sync failed on drop (poisoned lock)"
                    );
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Frame replay
// ------------------------------------------------------------------------------------------------

/// Reads frames sequentially until the first invalid one.
///
/// Returns the decoded records and the byte offset just past the last
/// valid frame. All failure modes — truncated header, oversized length,
/// truncated payload, CRC mismatch, undecodable payload — terminate
/// replay at the current frame boundary rather than erroring out.
fn read_valid_frames(file: File, max_payload: usize) -> (Vec<Record>, u64) {
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len: u64 = 0;

    loop {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        match read_exact_or_eof(&mut reader, &mut header) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                warn!(offset = valid_len, error = %e, "WAL read error during replay");
                break;
            }
        }

        let stored_crc = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        if payload_len > max_payload {
            warn!(
                offset = valid_len,
                payload_len, max_payload, "WAL frame length out of bounds, stopping replay"
            );
            break;
        }

        let mut payload = vec![0u8; payload_len];
        match read_exact_or_eof(&mut reader, &mut payload) {
            Ok(true) => {}
            Ok(false) => {
                trace!(offset = valid_len, "WAL ends in a torn frame");
                break;
            }
            Err(e) => {
                warn!(offset = valid_len, error = %e, "WAL read error during replay");
                break;
            }
        }

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != stored_crc {
            warn!(
                offset = valid_len,
                payload_len, "WAL frame checksum mismatch, stopping replay"
            );
            break;
        }

        match decode_payload(&payload) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(offset = valid_len, error = %e, "WAL frame undecodable, stopping replay");
                break;
            }
        }

        valid_len += (FRAME_HEADER_SIZE + payload_len) as u64;
    }

    (records, valid_len)
}

/// Fills `buf` completely, or returns `Ok(false)` when EOF strikes before
/// the first or a middle byte (a torn frame).
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
