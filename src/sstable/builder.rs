//! SSTable writer — builds a complete table file from a sorted record stream.
//!
//! [`TableBuilder`] accepts records in **strictly ascending key order**
//! (each key at most once — flush and compaction both deduplicate before
//! writing) and produces the on-disk layout described in the
//! [module documentation](super): data region, sparse index, bloom
//! filter, metadata, footer.
//!
//! # Atomicity
//!
//! 1. Everything is written to `<path with .tmp extension>`.
//! 2. The file is flushed and fsynced.
//! 3. The temp file is renamed to its final path.
//!
//! A crash cannot publish a partially-written table; startup removes any
//! orphaned `*.tmp` files. Callers fsync the containing directory after
//! the rename to make the publish itself durable.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use bloomfilter::Bloom;
use crc32fast::Hasher as Crc32;
use tracing::{debug, warn};

use crate::encoding;
use crate::engine::Record;

use super::{BLOCK_CRC_SIZE, BlockHandle, Footer, IndexEntry, TableError, TableMeta, encode_record};

/// Streaming builder for a single SSTable file.
pub struct TableBuilder {
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: BufWriter<File>,

    /// Bloom filter over every key added.
    bloom: Bloom<[u8]>,

    /// Sparse index accumulated during the data pass.
    index: Vec<IndexEntry>,

    /// One index entry per this many records.
    index_interval: usize,

    /// Bytes written to the data region so far.
    data_offset: u64,

    /// Total bytes written to the file so far (data plus blocks).
    write_offset: u64,

    /// Records written so far.
    count: u64,

    /// Strict-ordering guard and max-key tracker.
    last_key: Option<Vec<u8>>,

    min_key: Option<Vec<u8>>,
    seq_min: u64,
    seq_max: u64,

    bloom_expected: u64,
    bloom_fp_rate: f64,
}

impl TableBuilder {
    /// Creates a builder targeting `path`, writing through a `.tmp` file.
    ///
    /// `expected_records` sizes the bloom filter; overestimating costs a
    /// few bits per absent record, underestimating raises the effective
    /// false-positive rate.
    pub fn new(
        path: impl AsRef<Path>,
        expected_records: usize,
        index_interval: usize,
        bloom_fp_rate: f64,
    ) -> Result<Self, TableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let bloom = Bloom::new_for_fp_rate(expected_records.max(1), bloom_fp_rate)
            .map_err(|e| TableError::Internal(format!("bloom sizing: {e}")))?;

        Ok(Self {
            tmp_path,
            final_path,
            writer: BufWriter::new(file),
            bloom,
            index: Vec::new(),
            index_interval: index_interval.max(1),
            data_offset: 0,
            write_offset: 0,
            count: 0,
            last_key: None,
            min_key: None,
            seq_min: u64::MAX,
            seq_max: 0,
            bloom_expected: expected_records.max(1) as u64,
            bloom_fp_rate,
        })
    }

    /// Appends one record.
    ///
    /// Keys must arrive strictly ascending; a violation indicates a bug
    /// in the caller's merge/dedup stage and is rejected.
    pub fn add(&mut self, record: &Record) -> Result<(), TableError> {
        let key = record.key();

        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(TableError::Internal(
                    "records must be added in strictly ascending key order".into(),
                ));
            }
        }

        if self.count % self.index_interval as u64 == 0 {
            self.index.push(IndexEntry {
                key: key.to_vec(),
                offset: self.data_offset,
            });
        }

        self.bloom.set(key);
        if self.min_key.is_none() {
            self.min_key = Some(key.to_vec());
        }
        self.last_key = Some(key.to_vec());
        self.seq_min = self.seq_min.min(record.seq());
        self.seq_max = self.seq_max.max(record.seq());

        let mut buf = Vec::with_capacity(record.user_len() + 16);
        encode_record(&mut buf, record);
        self.writer.write_all(&buf)?;
        self.data_offset += buf.len() as u64;
        self.write_offset += buf.len() as u64;
        self.count += 1;

        Ok(())
    }

    /// Bytes written to the data region so far.
    ///
    /// Compaction uses this to rotate outputs at the target file size on
    /// a key boundary.
    pub fn data_bytes(&self) -> u64 {
        self.data_offset
    }

    /// Records added so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Writes index, bloom, and meta blocks plus the footer, fsyncs, and
    /// atomically renames the table into place.
    ///
    /// Returns the final path. Building an empty table is rejected.
    pub fn finish(mut self) -> Result<PathBuf, TableError> {
        if self.count == 0 {
            self.abandon();
            return Err(TableError::Internal(
                "cannot build a table with zero records".into(),
            ));
        }

        let mut index_bytes = Vec::new();
        encoding::encode_vec(&self.index, &mut index_bytes)?;
        let index_handle = self.append_block(&index_bytes)?;

        let bloom_bytes = self.bloom.as_slice().to_vec();
        let bloom_handle = self.append_block(&bloom_bytes)?;

        let meta = TableMeta {
            min_key: self.min_key.take().unwrap_or_default(),
            max_key: self.last_key.take().unwrap_or_default(),
            key_count: self.count,
            seq_min: self.seq_min,
            seq_max: self.seq_max,
            bloom_expected: self.bloom_expected,
            bloom_fp_rate: self.bloom_fp_rate,
        };
        let meta_bytes = encoding::encode_to_vec(&meta)?;
        let meta_handle = self.append_block(&meta_bytes)?;

        let footer = Footer {
            index: index_handle,
            bloom: bloom_handle,
            meta: meta_handle,
        };
        self.writer.write_all(&footer.encode())?;
        self.writer.flush()?;

        let file = self
            .writer
            .into_inner()
            .map_err(|e| TableError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.final_path)?;

        debug!(
            path = %self.final_path.display(),
            keys = self.count,
            index_entries = self.index.len(),
            bytes = self.data_offset,
            "table published"
        );

        Ok(self.final_path)
    }

    /// Discards the partially-written temp file (compaction abort path).
    pub fn abandon(self) {
        let tmp_path = self.tmp_path.clone();
        drop(self.writer);
        if let Err(e) = fs::remove_file(&tmp_path) {
            warn!(path = %tmp_path.display(), error = %e, "failed to remove abandoned temp table");
        }
    }

    /// Appends `[payload][crc32]` at the current position and returns the
    /// payload's block handle.
    fn append_block(&mut self, payload: &[u8]) -> Result<BlockHandle, TableError> {
        let offset = self.write_offset;

        let mut hasher = Crc32::new();
        hasher.update(payload);
        let checksum = hasher.finalize();

        self.writer.write_all(payload)?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        self.write_offset += payload.len() as u64 + BLOCK_CRC_SIZE as u64;

        Ok(BlockHandle {
            offset,
            len: payload.len() as u64,
        })
    }
}
