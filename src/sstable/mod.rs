//! Sorted String Table (SSTable) Module
//!
//! This module implements the **immutable**, **disk-backed** sorted table
//! files produced by memtable flushes and compactions. Each table stores
//! a strictly key-sorted run of records with a sparse index, a bloom
//! filter, a metadata block, and a fixed-size footer.
//!
//! # On-disk layout
//!
//! ```text
//! [RECORD][RECORD]...[RECORD]          — data region, key-sorted
//! [INDEX_BYTES][INDEX_CRC32_LE]        — sparse index, every Nth record
//! [BLOOM_BYTES][BLOOM_CRC32_LE]        — serialized bloom filter
//! [META_BYTES][META_CRC32_LE]          — table metadata
//! [FOOTER (60 bytes, fixed)]           — magic, version, block handles
//! ```
//!
//! Record encoding inside the data region:
//!
//! ```text
//! [op (1)][seq (8, LE)][key_len varint][key][value_len varint][value]
//! ```
//!
//! `op` is `0` for a put, `1` for a delete; a tombstone's `value_len` is
//! zero. The footer is read first to locate the other blocks:
//!
//! ```text
//! [magic u64][version u32]
//! [index_off u64][index_len u64]
//! [bloom_off u64][bloom_len u64]
//! [meta_off  u64][meta_len  u64]
//! ```
//!
//! # Sub-modules
//!
//! - [`builder`] — [`TableBuilder`] for writing tables from sorted record
//!   streams (tmp-file → fsync → rename publish).
//! - [`iterator`] — [`TableIter`] for streaming range scans and full
//!   compaction reads.
//!
//! # Concurrency model
//!
//! Tables are immutable once published, so reads are lock-free and
//! thread-safe. Readers share tables via `Arc<Table>`; when a compaction
//! obsoletes a table, the file is unlinked only after the last reference
//! drops (see [`Table::mark_obsolete`]).
//!
//! # Integrity
//!
//! Index, bloom, and meta blocks each carry a trailing CRC32 verified at
//! open. A table with a malformed footer, bad magic/version, failed block
//! checksum, or out-of-bounds handles is unusable: the manifest loader
//! logs and skips it. Corruption inside the data region surfaces during
//! iteration and terminates the affected source only.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod iterator;

#[cfg(test)]
mod tests;

pub use builder::TableBuilder;
pub use iterator::TableIter;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{atomic::AtomicBool, atomic::Ordering},
};

use crate::encoding::{self, EncodingError};
use crate::engine::Record;
use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, warn};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Footer sentinel, "LSMTAB" packed into a u64.
pub(crate) const TABLE_MAGIC: u64 = 0x4C53_4D54_4142;

/// Current table format version.
pub(crate) const TABLE_VERSION: u32 = 1;

/// Fixed footer width in bytes: magic(8) + version(4) + 3 × handle(16).
pub(crate) const FOOTER_SIZE: usize = 60;

/// Trailing CRC32 appended to each auxiliary block.
pub(crate) const BLOCK_CRC_SIZE: usize = 4;

const OP_PUT: u8 = 0;
const OP_DELETE: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (open, read, build).
#[derive(Debug, Error)]
pub enum TableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Data integrity failure — block checksum did not match.
    #[error("Checksum mismatch")]
    ChecksumMismatch,

    /// Structurally invalid table (bad magic, bounds, record framing).
    #[error("Malformed table: {0}")]
    Malformed(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Record codec — data-region framing
// ------------------------------------------------------------------------------------------------

/// Appends one record in the data-region encoding.
pub(crate) fn encode_record(buf: &mut Vec<u8>, record: &Record) {
    match record {
        Record::Put { key, value, seq } => {
            buf.push(OP_PUT);
            buf.extend_from_slice(&seq.to_le_bytes());
            encoding::put_uvarint(buf, key.len() as u64);
            buf.extend_from_slice(key);
            encoding::put_uvarint(buf, value.len() as u64);
            buf.extend_from_slice(value);
        }
        Record::Delete { key, seq } => {
            buf.push(OP_DELETE);
            buf.extend_from_slice(&seq.to_le_bytes());
            encoding::put_uvarint(buf, key.len() as u64);
            buf.extend_from_slice(key);
            encoding::put_uvarint(buf, 0);
        }
    }
}

/// Decodes the record starting at `offset` within the data region.
///
/// Returns `(record, next_offset)`.
pub(crate) fn decode_record(data: &[u8], offset: usize) -> Result<(Record, usize), TableError> {
    let buf = data
        .get(offset..)
        .ok_or_else(|| TableError::Malformed("record offset out of bounds".into()))?;
    if buf.len() < 1 + 8 {
        return Err(TableError::Malformed("truncated record header".into()));
    }

    let op = buf[0];
    let seq_bytes: [u8; 8] = buf[1..9]
        .try_into()
        .map_err(|_| TableError::Malformed("truncated record header".into()))?;
    let seq = u64::from_le_bytes(seq_bytes);
    let mut off = 9;

    let (key_len, n) = encoding::read_uvarint(&buf[off..])?;
    off += n;
    let key_len = usize::try_from(key_len)
        .map_err(|_| TableError::Malformed("key length exceeds usize".into()))?;
    if buf.len() - off < key_len {
        return Err(TableError::Malformed("truncated key".into()));
    }
    let key = buf[off..off + key_len].to_vec();
    off += key_len;

    let (value_len, n) = encoding::read_uvarint(&buf[off..])?;
    off += n;
    let value_len = usize::try_from(value_len)
        .map_err(|_| TableError::Malformed("value length exceeds usize".into()))?;
    if buf.len() - off < value_len {
        return Err(TableError::Malformed("truncated value".into()));
    }
    let value = buf[off..off + value_len].to_vec();
    off += value_len;

    let record = match op {
        OP_PUT => Record::Put { key, value, seq },
        OP_DELETE => {
            if value_len != 0 {
                return Err(TableError::Malformed("tombstone carries a value".into()));
            }
            Record::Delete { key, seq }
        }
        other => return Err(TableError::Malformed(format!("unknown op {other}"))),
    };

    Ok((record, offset + off))
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// Location and length of a block within the table file.
///
/// `len` covers the block payload only; a [`BLOCK_CRC_SIZE`] checksum
/// trails every block on disk.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockHandle {
    pub(crate) offset: u64,
    pub(crate) len: u64,
}

/// Sparse-index entry: the key of every Nth record and its absolute byte
/// offset in the data region.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexEntry {
    pub(crate) key: Vec<u8>,
    pub(crate) offset: u64,
}

impl encoding::Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.key, buf)?;
        encoding::Encode::encode_to(&self.offset, buf)?;
        Ok(())
    }
}

impl encoding::Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { key, offset }, off))
    }
}

/// Table-level metadata: key and sequence bounds, record count, and the
/// bloom sizing parameters the table was built with.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMeta {
    /// Smallest key in the table.
    pub min_key: Vec<u8>,

    /// Largest key in the table.
    pub max_key: Vec<u8>,

    /// Number of records (each key appears at most once).
    pub key_count: u64,

    /// Lowest sequence number present.
    pub seq_min: u64,

    /// Highest sequence number present.
    pub seq_max: u64,

    /// Expected record count the bloom filter was sized for.
    pub bloom_expected: u64,

    /// Target false-positive rate the bloom filter was sized for.
    pub bloom_fp_rate: f64,
}

impl encoding::Encode for TableMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.min_key, buf)?;
        encoding::Encode::encode_to(&self.max_key, buf)?;
        encoding::Encode::encode_to(&self.key_count, buf)?;
        encoding::Encode::encode_to(&self.seq_min, buf)?;
        encoding::Encode::encode_to(&self.seq_max, buf)?;
        encoding::Encode::encode_to(&self.bloom_expected, buf)?;
        encoding::Encode::encode_to(&self.bloom_fp_rate, buf)?;
        Ok(())
    }
}

impl encoding::Decode for TableMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (min_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (max_key, n) = <Vec<u8>>::decode_from(&buf[off..])?;
        off += n;
        let (key_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (seq_min, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (seq_max, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (bloom_expected, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (bloom_fp_rate, n) = f64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                min_key,
                max_key,
                key_count,
                seq_min,
                seq_max,
                bloom_expected,
                bloom_fp_rate,
            },
            off,
        ))
    }
}

/// Fixed-width footer, written last and read first.
#[derive(Debug)]
pub(crate) struct Footer {
    pub(crate) index: BlockHandle,
    pub(crate) bloom: BlockHandle,
    pub(crate) meta: BlockHandle,
}

impl Footer {
    /// Serializes the footer into its fixed 60-byte form.
    pub(crate) fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..8].copy_from_slice(&TABLE_MAGIC.to_le_bytes());
        out[8..12].copy_from_slice(&TABLE_VERSION.to_le_bytes());
        let mut off = 12;
        for handle in [&self.index, &self.bloom, &self.meta] {
            out[off..off + 8].copy_from_slice(&handle.offset.to_le_bytes());
            out[off + 8..off + 16].copy_from_slice(&handle.len.to_le_bytes());
            off += 16;
        }
        out
    }

    /// Parses and validates a footer from its fixed-size byte slice.
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TableError> {
        if buf.len() != FOOTER_SIZE {
            return Err(TableError::Malformed("short footer".into()));
        }

        let read_u64 = |at: usize| -> u64 {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[at..at + 8]);
            u64::from_le_bytes(bytes)
        };

        let magic = read_u64(0);
        if magic != TABLE_MAGIC {
            return Err(TableError::Malformed(format!("bad magic {magic:#x}")));
        }

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&buf[8..12]);
        let version = u32::from_le_bytes(version_bytes);
        if version != TABLE_VERSION {
            return Err(TableError::Malformed(format!(
                "unsupported version {version}"
            )));
        }

        let mut handles = [BlockHandle { offset: 0, len: 0 }; 3];
        let mut off = 12;
        for handle in handles.iter_mut() {
            *handle = BlockHandle {
                offset: read_u64(off),
                len: read_u64(off + 8),
            };
            off += 16;
        }

        Ok(Self {
            index: handles[0],
            bloom: handles[1],
            meta: handles[2],
        })
    }
}

// ------------------------------------------------------------------------------------------------
// TableGet
// ------------------------------------------------------------------------------------------------

/// Result of a single-table point lookup.
#[derive(Debug, PartialEq, Clone)]
pub enum TableGet {
    /// A value stored in this table.
    Put(Vec<u8>),

    /// A tombstone for this key — it masks any older version below.
    Tombstone,

    /// This table has no information about the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// Table — immutable reader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable sorted table.
///
/// Opened once per publish and shared through `Arc<Table>` by the level
/// manifest and in-flight readers. Metadata, bloom filter, and sparse
/// index are resident; record data is decoded on demand from the map.
pub struct Table {
    /// Unique monotonic file id, parsed from the file name.
    id: u64,

    /// On-disk location, retained for obsoletion unlink.
    path: PathBuf,

    /// Read-only map of the whole file.
    mmap: Mmap,

    /// Table metadata block.
    meta: TableMeta,

    /// Membership filter over all keys in the table.
    bloom: Bloom<[u8]>,

    /// Sparse index, one entry per `index_interval` records.
    index: Vec<IndexEntry>,

    /// Length of the data region (records end where the index begins).
    data_len: usize,

    /// Set when a compaction removes this table from the manifest; the
    /// file is unlinked on drop of the final reference.
    obsolete: AtomicBool,
}

impl Table {
    /// Opens a table file, verifying footer, block checksums, and bounds.
    ///
    /// # Safety
    ///
    /// Uses a read-only `Mmap` over a file that is never written after
    /// its atomic rename-into-place; all block boundaries are validated
    /// before slicing.
    pub fn open(path: impl AsRef<Path>, id: u64) -> Result<Self, TableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < FOOTER_SIZE {
            return Err(TableError::Malformed("file smaller than footer".into()));
        }

        let footer_start = mmap.len() - FOOTER_SIZE;
        let footer = Footer::decode(&mmap[footer_start..])?;

        let index_bytes = read_block(&mmap, footer.index, footer_start)?;
        let (index, _) = encoding::decode_vec::<IndexEntry>(index_bytes)?;

        let bloom_bytes = read_block(&mmap, footer.bloom, footer_start)?;
        let bloom = Bloom::from_slice(bloom_bytes)
            .map_err(|e| TableError::Malformed(format!("bloom filter: {e}")))?;

        let meta_bytes = read_block(&mmap, footer.meta, footer_start)?;
        let (meta, _) = encoding::decode_from_slice::<TableMeta>(meta_bytes)?;

        let data_len = usize::try_from(footer.index.offset)
            .map_err(|_| TableError::Malformed("data region exceeds addressable range".into()))?;
        if data_len > footer_start {
            return Err(TableError::Malformed("data region overlaps footer".into()));
        }

        debug!(
            path = %path.display(),
            id,
            keys = meta.key_count,
            index_entries = index.len(),
            "table opened"
        );

        Ok(Self {
            id,
            path,
            mmap,
            meta,
            bloom,
            index,
            data_len,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Unique monotonic file id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Table metadata (key/sequence bounds, counts, bloom parameters).
    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// On-disk file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `true` when `key` falls inside this table's `[min_key, max_key]`.
    pub fn key_in_range(&self, key: &[u8]) -> bool {
        key >= self.meta.min_key.as_slice() && key <= self.meta.max_key.as_slice()
    }

    /// `true` when `[start, end)` intersects this table's key range.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.meta.min_key.as_slice() < end && start <= self.meta.max_key.as_slice()
    }

    /// Cheap pre-check combining the key-range test and the bloom filter.
    ///
    /// `false` guarantees the key is absent; `true` means "maybe".
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.key_in_range(key) && self.bloom.check(key)
    }

    /// Point lookup for `key`.
    ///
    /// Range check → bloom check → sparse-index binary search → short
    /// linear decode from the greatest indexed key ≤ `key`.
    pub fn get(&self, key: &[u8]) -> Result<TableGet, TableError> {
        if !self.may_contain(key) {
            return Ok(TableGet::NotFound);
        }

        let mut offset = self.seek_offset(key);
        let data = &self.mmap[..self.data_len];

        while offset < self.data_len {
            let (record, next) = decode_record(data, offset)?;
            match record.key().cmp(key) {
                std::cmp::Ordering::Less => offset = next,
                std::cmp::Ordering::Equal => {
                    return Ok(match record {
                        Record::Put { value, .. } => TableGet::Put(value),
                        Record::Delete { .. } => TableGet::Tombstone,
                    });
                }
                std::cmp::Ordering::Greater => break,
            }
        }

        Ok(TableGet::NotFound)
    }

    /// Marks this table removed from the manifest; the file is unlinked
    /// when the last `Arc` reference drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    /// Data-region offset of the greatest indexed key ≤ `key`.
    ///
    /// Keys smaller than the first indexed key start at offset 0 (only
    /// reachable through range-scan positioning; point lookups are
    /// already bounded by `min_key`).
    pub(crate) fn seek_offset(&self, key: &[u8]) -> usize {
        match self
            .index
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
        {
            Ok(i) => self.index[i].offset as usize,
            Err(0) => 0,
            Err(i) => self.index[i - 1].offset as usize,
        }
    }

    /// Data region accessor for the iterator.
    pub(crate) fn data(&self) -> &[u8] {
        &self.mmap[..self.data_len]
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::Acquire) {
            match fs::remove_file(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), id = self.id, "obsolete table unlinked"),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "failed to unlink obsolete table")
                }
            }
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("keys", &self.meta.key_count)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Block I/O
// ------------------------------------------------------------------------------------------------

/// Slices a checksummed block out of the map and verifies its CRC32.
///
/// `limit` is the first byte past the block area (the footer start);
/// handles pointing outside it are rejected.
fn read_block(mmap: &Mmap, handle: BlockHandle, limit: usize) -> Result<&[u8], TableError> {
    let start = usize::try_from(handle.offset)
        .map_err(|_| TableError::Malformed("block offset exceeds addressable range".into()))?;
    let len = usize::try_from(handle.len)
        .map_err(|_| TableError::Malformed("block length exceeds addressable range".into()))?;

    let end = start
        .checked_add(len)
        .and_then(|e| e.checked_add(BLOCK_CRC_SIZE))
        .ok_or_else(|| TableError::Malformed("block bounds overflow".into()))?;
    if end > limit {
        return Err(TableError::Malformed("block out of bounds".into()));
    }

    let payload = &mmap[start..start + len];
    let crc_bytes: [u8; BLOCK_CRC_SIZE] = mmap[start + len..end]
        .try_into()
        .map_err(|_| TableError::Malformed("short block checksum".into()))?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(TableError::ChecksumMismatch);
    }

    Ok(payload)
}
