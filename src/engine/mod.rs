//! # LSM Storage Engine
//!
//! This module implements a **synchronous**, **crash-safe**, leveled
//! LSM-tree storage engine for byte-string keys and values.
//!
//! ## Design Overview
//!
//! Data lives in four places, queried newest-first:
//!
//! 1. **Active memtable** — an in-memory sorted map; every write lands in
//!    the WAL before it lands here.
//! 2. **Frozen memtable** — at most one read-only predecessor of the
//!    active memtable, awaiting flush; its renamed WAL keeps it durable.
//! 3. **Level 0** — tables from independent flushes, possibly
//!    overlapping, consulted newest-first by file id.
//! 4. **Levels ≥ 1** — compaction output with disjoint sibling key
//!    ranges; one binary-search lookup per level.
//!
//! ## Concurrency Model
//!
//! Two locks split the engine:
//!
//! - The **writer mutex** serializes sequence assignment, the WAL
//!   append, and the memtable insert — the whole logical writer path.
//! - The **view lock** guards the snapshot bundle (active memtable,
//!   frozen memtable, level manifest). Readers hold it just long enough
//!   to clone `Arc` handles, then search without any lock; rotation and
//!   flush/compaction installs take it briefly for the swap.
//!
//! Reads never wait on WAL fsyncs and writes never wait on readers,
//! except for the instant of a memtable rotation.
//!
//! ## Background Work
//!
//! A flush worker turns frozen memtables into level-0 tables; a
//! compaction worker merges tables between levels. Both are plain OS
//! threads woken over `crossbeam` channels and stopped via a shutdown
//! flag. Writers stall when a rotation finds the frozen slot occupied
//! (bounded queue of one) or when level 0 reaches its stall threshold.
//!
//! ## Guarantees
//!
//! - **Durability:** acknowledged writes are in the WAL (fsynced per
//!   config) before the ack; recovery replays them after a crash.
//! - **Linearizable writes:** sequence order matches acknowledgement
//!   order; a `get` after a `put` of the same key sees the put.
//! - **Snapshot reads:** `get` and `scan` operate on a view captured at
//!   call time; concurrent writes are not observed mid-operation.
//! - **Degraded mode:** a WAL append failure refuses the ack and fails
//!   all further writes until the engine is reopened; reads continue.

pub mod utils;
pub use utils::{MergeIterator, Record};

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{self, CompactionError};
use crate::manifest::{LevelManifest, ManifestError};
use crate::memtable::{Memtable, MemtableError, MemtableGet};
use crate::sstable::{Table, TableBuilder, TableError, TableGet, TableIter};
use crate::wal::{Wal, WalError};

/// File name of the active WAL inside the data directory.
pub const WAL_FILE: &str = "wal.log";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Configuration failed validation at `open`.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Key exceeds the configured maximum length.
    #[error("Key too large ({len} bytes, max {max})")]
    KeyTooLarge {
        /// Offered key length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Value exceeds the configured maximum length.
    #[error("Value too large ({len} bytes, max {max})")]
    ValueTooLarge {
        /// Offered value length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A WAL append failed earlier; the engine is read-only until reopened.
    #[error("Engine degraded: write-ahead log failure, reopen to recover")]
    Degraded,

    /// The engine has been closed.
    #[error("Engine closed")]
    Closed,

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error originating from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the memtable.
    #[error("Memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Error originating from the SSTable subsystem.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Error originating from manifest reconstruction.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error originating from compaction.
    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for an [`Engine`] instance.
///
/// Passed to [`Engine::open`]; there is no global process state. All
/// thresholds are validated before the engine touches disk.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for all persistent state.
    pub data_dir: PathBuf,

    /// Memtable byte size (keys + values) that triggers rotation.
    pub memtable_max_bytes: u64,

    /// Memtable entry count that triggers rotation.
    pub memtable_max_entries: u64,

    /// Upper bound on key length; larger writes are rejected.
    pub max_key_bytes: usize,

    /// Upper bound on value length; larger writes are rejected.
    pub max_value_bytes: usize,

    /// Depth of the level hierarchy (level 0 .. max_levels - 1).
    pub max_levels: usize,

    /// Base byte size for level compaction triggers: level i compacts
    /// when it exceeds `level_base_bytes × level_size_multiplier^i`.
    pub level_base_bytes: u64,

    /// Per-level size growth factor.
    pub level_size_multiplier: u64,

    /// Issue an fdatasync-equivalent on every WAL append.
    pub wal_sync_on_write: bool,

    /// One sparse-index entry per this many table records.
    pub sstable_index_interval: usize,

    /// Target bloom-filter false-positive rate.
    pub sstable_bloom_fp_rate: f64,

    /// Compaction output files rotate at this data size.
    pub sstable_target_bytes: u64,

    /// Level-0 table count that triggers compaction into level 1.
    pub l0_compaction_threshold: usize,

    /// Level-0 table count at which writers stall briefly for
    /// compaction; 0 disables the back-pressure.
    pub l0_stall_threshold: usize,

    /// Compaction worker poll period (it is also woken after flushes).
    pub compaction_poll_interval: Duration,

    /// Flush pending data during `close()`.
    pub flush_on_close: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./stratumdb_data"),
            memtable_max_bytes: 4 * 1024 * 1024,
            memtable_max_entries: 100_000,
            max_key_bytes: 4 * 1024,
            max_value_bytes: 1024 * 1024,
            max_levels: 4,
            level_base_bytes: 10 * 1024 * 1024,
            level_size_multiplier: 10,
            wal_sync_on_write: true,
            sstable_index_interval: 16,
            sstable_bloom_fp_rate: 0.01,
            sstable_target_bytes: 4 * 1024 * 1024,
            l0_compaction_threshold: 4,
            l0_stall_threshold: 8,
            compaction_poll_interval: Duration::from_millis(250),
            flush_on_close: true,
        }
    }
}

impl EngineConfig {
    /// Checks every constraint the engine relies on.
    fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: &str| Err(EngineError::InvalidConfig(msg.into()));

        if self.memtable_max_bytes == 0 {
            return fail("memtable_max_bytes must be positive");
        }
        if self.memtable_max_entries == 0 {
            return fail("memtable_max_entries must be positive");
        }
        if self.max_key_bytes == 0 {
            return fail("max_key_bytes must be positive");
        }
        if self.max_value_bytes == 0 {
            return fail("max_value_bytes must be positive");
        }
        if self.max_levels < 2 {
            return fail("max_levels must be at least 2");
        }
        if self.level_base_bytes == 0 {
            return fail("level_base_bytes must be positive");
        }
        if self.level_size_multiplier < 2 {
            return fail("level_size_multiplier must be at least 2");
        }
        if self.sstable_index_interval == 0 {
            return fail("sstable_index_interval must be positive");
        }
        if !(self.sstable_bloom_fp_rate > 0.0 && self.sstable_bloom_fp_rate < 1.0) {
            return fail("sstable_bloom_fp_rate must be in (0, 1)");
        }
        if self.sstable_target_bytes == 0 {
            return fail("sstable_target_bytes must be positive");
        }
        if self.l0_compaction_threshold == 0 {
            return fail("l0_compaction_threshold must be positive");
        }
        if self.l0_stall_threshold != 0 && self.l0_stall_threshold < self.l0_compaction_threshold {
            return fail("l0_stall_threshold must be 0 or >= l0_compaction_threshold");
        }
        if self.compaction_poll_interval.is_zero() {
            return fail("compaction_poll_interval must be positive");
        }
        Ok(())
    }

    /// Largest WAL frame payload a well-formed write can produce; replay
    /// rejects anything bigger as corruption.
    fn max_wal_payload(&self) -> usize {
        1 + 2 * crate::encoding::MAX_VARINT_LEN + self.max_key_bytes + self.max_value_bytes + 8
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Point-in-time snapshot of engine counters, from [`Engine::stats`].
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Completed `put` operations.
    pub puts: u64,
    /// Completed `get` operations.
    pub gets: u64,
    /// Completed `delete` operations.
    pub deletes: u64,
    /// Started `scan` operations.
    pub scans: u64,
    /// Memtable flushes to level 0.
    pub flushes: u64,
    /// Completed compaction rounds.
    pub compactions: u64,
    /// Total input bytes consumed by compactions.
    pub bytes_compacted: u64,
    /// Table count per level, index = level number.
    pub level_tables: Vec<usize>,
    /// Active memtable size in key+value bytes.
    pub memtable_bytes: u64,
    /// Active memtable entry count.
    pub memtable_entries: u64,
    /// Current WAL file size in bytes.
    pub wal_bytes: u64,
}

#[derive(Default)]
struct Counters {
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    scans: AtomicU64,
    flushes: AtomicU64,
    compactions: AtomicU64,
    bytes_compacted: AtomicU64,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// A frozen memtable awaiting flush, paired with the renamed WAL file
/// that keeps it durable until its level-0 table is installed.
#[derive(Clone)]
struct FrozenMemtable {
    memtable: Arc<Memtable>,
    wal_path: PathBuf,
}

/// The reader-visible snapshot bundle. Cloning is cheap — `Arc` handles
/// plus the manifest's per-table `Arc`s.
#[derive(Clone)]
struct View {
    active: Arc<Memtable>,
    frozen: Option<FrozenMemtable>,
    manifest: LevelManifest,
}

/// Writer-path state, guarded by the writer mutex.
struct WriteState {
    wal: Wal,
    active: Arc<Memtable>,
}

struct EngineShared {
    config: EngineConfig,
    view: RwLock<View>,
    write: Mutex<WriteState>,
    next_seq: AtomicU64,
    next_file_id: AtomicU64,
    degraded: AtomicBool,
    closed: AtomicBool,
    shutdown: AtomicBool,
    counters: Counters,
    flush_tx: Sender<()>,
    compact_tx: Sender<()>,
    /// Paired with `gate_cv`: rotation stalls, L0 back-pressure, and
    /// flush waits all block here and are notified after installs.
    gate: Mutex<()>,
    gate_cv: Condvar,
    /// Serializes compaction rounds between the worker and `compact()`.
    compact_lock: Mutex<()>,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

/// The storage engine handle.
///
/// All operations take `&self`; share the engine across threads with
/// `Arc<Engine>`. Dropping the handle stops background workers without
/// flushing (the WAL preserves unflushed writes for the next open);
/// call [`Engine::close`] for a clean shutdown.
pub struct Engine {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Opens (or creates) an engine rooted at `config.data_dir`.
    ///
    /// Recovery sequence: reconstruct the level manifest from the level
    /// directories, flush any frozen WALs (`wal.log.<id>`) straight to
    /// level 0, replay the active WAL into a fresh memtable (truncating
    /// a torn tail), restore the sequence and file-id high-water marks,
    /// then start the flush and compaction workers.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let (mut manifest, max_table_id) = LevelManifest::load(&config.data_dir, config.max_levels)?;

        let mut seq_floor: u64 = 0;
        for level in 0..manifest.depth() {
            for table in manifest.level_tables(level) {
                seq_floor = seq_floor.max(table.meta().seq_max);
            }
        }

        // Frozen WALs are flushes that never completed: rebuild each one
        // and flush it to level 0 now, oldest first.
        let frozen_wals = find_frozen_wals(&config.data_dir)?;
        let mut next_file_id = max_table_id
            .max(frozen_wals.last().map(|(id, _)| *id).unwrap_or(0))
            .saturating_add(1);

        for (wal_id, wal_path) in frozen_wals {
            let records = Wal::replay(&wal_path, config.max_wal_payload())?;
            info!(
                wal_id,
                records = records.len(),
                "recovering frozen WAL into level 0"
            );

            let memtable = Memtable::new();
            for record in records {
                seq_floor = seq_floor.max(record.seq());
                memtable.apply(record)?;
            }

            if !memtable.is_empty() {
                let table_id = next_file_id;
                next_file_id += 1;
                let path = LevelManifest::table_path(&config.data_dir, 0, table_id);
                build_table(
                    &path,
                    memtable.iter_for_flush()?,
                    memtable.entries() as usize,
                    &config,
                )?;
                compaction::sync_dir(&LevelManifest::level_dir(&config.data_dir, 0));
                manifest.add_l0(Arc::new(Table::open(&path, table_id)?));
            }

            if let Err(e) = fs::remove_file(&wal_path) {
                warn!(path = %wal_path.display(), error = %e, "failed to remove recovered frozen WAL");
            }
        }

        // Active WAL: replay into the live memtable, truncating any torn
        // tail so appends resume at a clean frame boundary.
        let wal_path = config.data_dir.join(WAL_FILE);
        let (wal, records) = Wal::recover(
            &wal_path,
            config.wal_sync_on_write,
            config.max_wal_payload(),
        )?;

        let active = Arc::new(Memtable::new());
        let replayed = records.len();
        for record in records {
            seq_floor = seq_floor.max(record.seq());
            active.apply(record)?;
        }

        let (flush_tx, flush_rx) = unbounded::<()>();
        let (compact_tx, compact_rx) = unbounded::<()>();

        let shared = Arc::new(EngineShared {
            view: RwLock::new(View {
                active: Arc::clone(&active),
                frozen: None,
                manifest,
            }),
            write: Mutex::new(WriteState { wal, active }),
            next_seq: AtomicU64::new(seq_floor + 1),
            next_file_id: AtomicU64::new(next_file_id),
            degraded: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
            flush_tx,
            compact_tx,
            gate: Mutex::new(()),
            gate_cv: Condvar::new(),
            compact_lock: Mutex::new(()),
            config,
        });

        let workers = vec![
            spawn_flush_worker(Arc::clone(&shared), flush_rx)?,
            spawn_compaction_worker(Arc::clone(&shared), compact_rx)?,
        ];

        info!(
            data_dir = %shared.config.data_dir.display(),
            next_seq = seq_floor + 1,
            replayed_records = replayed,
            "engine opened"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Inserts or updates a key.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        self.shared.check_value_bounds(&value)?;
        self.shared
            .write_record(key, Some(value), &self.shared.counters.puts)
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: Vec<u8>) -> Result<(), EngineError> {
        self.shared
            .write_record(key, None, &self.shared.counters.deletes)
    }

    /// Looks up a single key.
    ///
    /// Returns `Ok(None)` for a missing or deleted key. Corruption or
    /// I/O failure on one table is logged and that table skipped; the
    /// search continues into older sources.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        self.shared.check_open()?;
        self.shared.counters.gets.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.shared.snapshot()?;

        match snapshot.active.get(key)? {
            MemtableGet::Put(value) => return Ok(Some(value)),
            MemtableGet::Tombstone => return Ok(None),
            MemtableGet::NotFound => {}
        }

        if let Some(frozen) = &snapshot.frozen {
            match frozen.memtable.get(key)? {
                MemtableGet::Put(value) => return Ok(Some(value)),
                MemtableGet::Tombstone => return Ok(None),
                MemtableGet::NotFound => {}
            }
        }

        // Level 0, newest table first.
        for table in snapshot.manifest.level_tables(0) {
            match probe_table(table, key) {
                Some(TableGet::Put(value)) => return Ok(Some(value)),
                Some(TableGet::Tombstone) => return Ok(None),
                _ => {}
            }
        }

        // Deeper levels: at most one table per level in steady state.
        for level in 1..snapshot.manifest.depth() {
            for table in snapshot.manifest.tables_for_key(level, key) {
                match probe_table(&table, key) {
                    Some(TableGet::Put(value)) => return Ok(Some(value)),
                    Some(TableGet::Tombstone) => return Ok(None),
                    _ => {}
                }
            }
        }

        Ok(None)
    }

    /// Ordered scan of all live keys with `start <= key < end`.
    ///
    /// The iterator works against a snapshot captured here; writes made
    /// during iteration are not observed. Cancel a long scan by dropping
    /// the iterator.
    pub fn scan(&self, start: &[u8], end: &[u8]) -> Result<ScanIter, EngineError> {
        self.shared.check_open()?;
        self.shared.counters.scans.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.shared.snapshot()?;
        let mut sources: Vec<Box<dyn Iterator<Item = Record>>> = Vec::new();

        sources.push(Box::new(snapshot.active.scan(start, end)?));
        if let Some(frozen) = &snapshot.frozen {
            sources.push(Box::new(frozen.memtable.scan(start, end)?));
        }

        for table in snapshot.manifest.level_tables(0) {
            if table.overlaps(start, end) {
                sources.push(Box::new(TableIter::new_range(Arc::clone(table), start, end)));
            }
        }

        for level in 1..snapshot.manifest.depth() {
            let tables = snapshot.manifest.tables_overlapping_scan(level, start, end);
            if tables.is_empty() {
                continue;
            }
            if snapshot.manifest.level_overlapped(level) {
                // Crash residue: sibling ranges overlap, so concatenation
                // would break the merge order. Feed each table separately.
                for table in tables {
                    sources.push(Box::new(TableIter::new_range(table, start, end)));
                }
            } else {
                // Disjoint and sorted by min_key: chaining the per-table
                // scans yields one globally sorted stream per level.
                let start = start.to_vec();
                let end = end.to_vec();
                sources.push(Box::new(
                    tables
                        .into_iter()
                        .flat_map(move |t| TableIter::new_range(t, &start, &end)),
                ));
            }
        }

        Ok(ScanIter {
            input: MergeIterator::new(sources),
            current_key: None,
        })
    }

    /// Snapshot of engine counters and gauges.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let snapshot = self.shared.snapshot()?;
        let wal_bytes = {
            let ws = self
                .shared
                .write
                .lock()
                .map_err(|_| EngineError::Internal("writer mutex poisoned".into()))?;
            ws.wal.size()
        };

        let c = &self.shared.counters;
        Ok(EngineStats {
            puts: c.puts.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            scans: c.scans.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            bytes_compacted: c.bytes_compacted.load(Ordering::Relaxed),
            level_tables: snapshot.manifest.table_counts(),
            memtable_bytes: snapshot.active.bytes(),
            memtable_entries: snapshot.active.entries(),
            wal_bytes,
        })
    }

    /// Force-rotates a non-empty active memtable and blocks until no
    /// frozen memtable remains.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.shared.check_open()?;
        self.shared.flush_blocking()
    }

    /// Synchronously runs compaction rounds until no level trigger fires.
    pub fn compact(&self) -> Result<(), EngineError> {
        self.shared.check_open()?;
        self.shared.run_compaction_rounds().map(|_| ())
    }

    /// Gracefully shuts the engine down.
    ///
    /// Flushes pending data when `flush_on_close` is set, stops and
    /// joins the background workers, and fsyncs the data directories.
    /// Idempotent; later data operations fail with [`EngineError::Closed`].
    pub fn close(&self) -> Result<(), EngineError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.shared.config.flush_on_close {
            self.shared.flush_blocking()?;
        }

        self.shared.stop_workers();
        self.join_workers();

        let data_dir = &self.shared.config.data_dir;
        for level in 0..self.shared.config.max_levels {
            compaction::sync_dir(&LevelManifest::level_dir(data_dir, level));
        }
        compaction::sync_dir(data_dir);

        info!(data_dir = %data_dir.display(), "engine closed");
        Ok(())
    }

    fn join_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for handle in workers.drain(..) {
                if handle.join().is_err() {
                    error!("background worker panicked");
                }
            }
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Stop workers without flushing: unflushed writes stay in the
        // WAL and replay on the next open. close() handles clean exits.
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.stop_workers();
            self.join_workers();
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared-state operations
// ------------------------------------------------------------------------------------------------

impl EngineShared {
    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn check_value_bounds(&self, value: &[u8]) -> Result<(), EngineError> {
        if value.len() > self.config.max_value_bytes {
            return Err(EngineError::ValueTooLarge {
                len: value.len(),
                max: self.config.max_value_bytes,
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<View, EngineError> {
        Ok(self
            .view
            .read()
            .map_err(|_| EngineError::Internal("view lock poisoned".into()))?
            .clone())
    }

    /// The serialized writer path: bounds checks, back-pressure, sequence
    /// assignment, WAL append, memtable insert, rotation check.
    fn write_record(
        &self,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
        counter: &AtomicU64,
    ) -> Result<(), EngineError> {
        self.check_open()?;
        if self.degraded.load(Ordering::SeqCst) {
            return Err(EngineError::Degraded);
        }
        if key.len() > self.config.max_key_bytes {
            return Err(EngineError::KeyTooLarge {
                len: key.len(),
                max: self.config.max_key_bytes,
            });
        }

        self.stall_for_l0()?;

        let mut ws = self
            .write
            .lock()
            .map_err(|_| EngineError::Internal("writer mutex poisoned".into()))?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = match value {
            Some(value) => Record::Put { key, value, seq },
            None => Record::Delete { key, seq },
        };

        // WAL first: a failed append must not acknowledge the write, and
        // leaves the engine read-only until reopened.
        if let Err(e) = ws.wal.append(&record) {
            self.degraded.store(true, Ordering::SeqCst);
            error!(error = %e, "WAL append failed, engine degraded to read-only");
            return Err(e.into());
        }

        ws.active.apply(record)?;
        counter.fetch_add(1, Ordering::Relaxed);

        if ws.active.bytes() >= self.config.memtable_max_bytes
            || ws.active.entries() >= self.config.memtable_max_entries
        {
            self.rotate(&mut ws)?;
        }

        Ok(())
    }

    /// Swaps in a fresh memtable + WAL and hands the old pair to the
    /// flush worker. Stalls while the single frozen slot is occupied.
    ///
    /// Called with the writer mutex held, so no record can sneak between
    /// the WAL rename and the view swap.
    fn rotate(&self, ws: &mut WriteState) -> Result<(), EngineError> {
        // At most one frozen memtable: wait for a slow flush to drain.
        loop {
            let occupied = self
                .view
                .read()
                .map_err(|_| EngineError::Internal("view lock poisoned".into()))?
                .frozen
                .is_some();
            if !occupied {
                break;
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(EngineError::Closed);
            }
            self.wake_flush();
            self.gate_wait(Duration::from_millis(10))?;
        }

        // The frozen WAL must hold every acknowledged frame before the
        // flush worker is allowed to rely on it.
        if !self.config.wal_sync_on_write {
            ws.wal.sync()?;
        }

        let wal_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let frozen_path = self.config.data_dir.join(format!("{WAL_FILE}.{wal_id}"));
        fs::rename(ws.wal.path(), &frozen_path)?;

        let new_wal = Wal::create(
            self.config.data_dir.join(WAL_FILE),
            self.config.wal_sync_on_write,
        )?;
        let new_active = Arc::new(Memtable::new());

        let old_wal = std::mem::replace(&mut ws.wal, new_wal);
        drop(old_wal); // syncs the renamed file on drop
        let old_active = std::mem::replace(&mut ws.active, Arc::clone(&new_active));

        {
            let mut view = self
                .view
                .write()
                .map_err(|_| EngineError::Internal("view lock poisoned".into()))?;
            view.frozen = Some(FrozenMemtable {
                memtable: old_active,
                wal_path: frozen_path,
            });
            view.active = new_active;
        }

        debug!(wal_id, "memtable rotated");
        self.wake_flush();
        Ok(())
    }

    /// Back-pressure: when level 0 piles up past the stall threshold,
    /// give compaction a bounded window to catch up before admitting
    /// the write.
    fn stall_for_l0(&self) -> Result<(), EngineError> {
        let limit = self.config.l0_stall_threshold;
        if limit == 0 {
            return Ok(());
        }

        let mut waited = Duration::ZERO;
        let step = Duration::from_millis(10);
        let cap = Duration::from_secs(1);

        loop {
            let l0_count = self
                .view
                .read()
                .map_err(|_| EngineError::Internal("view lock poisoned".into()))?
                .manifest
                .table_counts()[0];
            if l0_count < limit || self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            if waited >= cap {
                warn!(l0_count, limit, "level-0 stall window expired, admitting write");
                return Ok(());
            }
            self.wake_compaction();
            self.gate_wait(step)?;
            waited += step;
        }
    }

    /// Rotates a non-empty active memtable, then blocks until the flush
    /// worker has drained the frozen slot.
    fn flush_blocking(&self) -> Result<(), EngineError> {
        {
            let mut ws = self
                .write
                .lock()
                .map_err(|_| EngineError::Internal("writer mutex poisoned".into()))?;
            if !ws.active.is_empty() {
                self.rotate(&mut ws)?;
            }
        }

        loop {
            let drained = self
                .view
                .read()
                .map_err(|_| EngineError::Internal("view lock poisoned".into()))?
                .frozen
                .is_none();
            if drained {
                return Ok(());
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return Err(EngineError::Closed);
            }
            self.wake_flush();
            self.gate_wait(Duration::from_millis(10))?;
        }
    }

    /// Flush-worker body: drain the frozen slot, retrying with back-off
    /// on failure (writers stall behind the occupied slot meanwhile).
    fn flush_pending(&self) {
        let mut failures: u32 = 0;

        loop {
            let frozen = match self.view.read() {
                Ok(view) => view.frozen.clone(),
                Err(_) => return,
            };
            let Some(frozen) = frozen else { return };

            match self.flush_frozen(&frozen) {
                Ok(()) => {
                    failures = 0;
                    self.notify_gate();
                    self.wake_compaction();
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "flush failed, backing off");
                    if self.shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    thread::sleep(backoff_delay(failures));
                }
            }
        }
    }

    /// Builds a level-0 table from the frozen memtable, installs it,
    /// deletes the frozen WAL, and only then releases the frozen slot —
    /// so `flush()` returning implies the whole pipeline completed.
    fn flush_frozen(&self, frozen: &FrozenMemtable) -> Result<(), EngineError> {
        if !frozen.memtable.is_empty() {
            let table_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
            let path = LevelManifest::table_path(&self.config.data_dir, 0, table_id);

            build_table(
                &path,
                frozen.memtable.iter_for_flush()?,
                frozen.memtable.entries() as usize,
                &self.config,
            )?;
            compaction::sync_dir(&LevelManifest::level_dir(&self.config.data_dir, 0));

            let table = Arc::new(Table::open(&path, table_id)?);
            let keys = table.meta().key_count;

            // Publish the table while the frozen memtable is still
            // visible: readers see duplicate (identical) data for an
            // instant, never a gap.
            {
                let mut view = self
                    .view
                    .write()
                    .map_err(|_| EngineError::Internal("view lock poisoned".into()))?;
                view.manifest.add_l0(table);
            }
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
            info!(table_id, keys, "memtable flushed to level 0");
        }

        if let Err(e) = fs::remove_file(&frozen.wal_path) {
            warn!(path = %frozen.wal_path.display(), error = %e, "failed to remove flushed WAL");
        }

        {
            let mut view = self
                .view
                .write()
                .map_err(|_| EngineError::Internal("view lock poisoned".into()))?;
            view.frozen = None;
        }

        Ok(())
    }

    /// Runs compaction rounds until no trigger fires. Returns the number
    /// of rounds completed; shutdown aborts cleanly mid-merge.
    fn run_compaction_rounds(&self) -> Result<usize, EngineError> {
        let _guard = self
            .compact_lock
            .lock()
            .map_err(|_| EngineError::Internal("compaction mutex poisoned".into()))?;

        let mut rounds = 0usize;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(rounds);
            }

            let plan = {
                let view = self
                    .view
                    .read()
                    .map_err(|_| EngineError::Internal("view lock poisoned".into()))?;
                compaction::plan(&view.manifest, &self.config)
            };
            let Some(plan) = plan else {
                return Ok(rounds);
            };

            let outcome = match compaction::execute(
                &plan,
                &self.config.data_dir,
                &self.config,
                &self.next_file_id,
                &self.shutdown,
            ) {
                Ok(outcome) => outcome,
                Err(CompactionError::Canceled) => return Ok(rounds),
                Err(e) => return Err(e.into()),
            };

            {
                let mut view = self
                    .view
                    .write()
                    .map_err(|_| EngineError::Internal("view lock poisoned".into()))?;
                let removed = view.manifest.apply_compaction(
                    outcome.source_level,
                    outcome.target_level,
                    &outcome.removed_ids,
                    outcome.outputs.clone(),
                );
                for table in removed {
                    table.mark_obsolete();
                }
            }

            self.counters.compactions.fetch_add(1, Ordering::Relaxed);
            self.counters
                .bytes_compacted
                .fetch_add(outcome.bytes_in, Ordering::Relaxed);
            self.notify_gate();
            rounds += 1;
        }
    }

    fn wake_flush(&self) {
        let _ = self.flush_tx.send(());
    }

    fn wake_compaction(&self) {
        let _ = self.compact_tx.send(());
    }

    fn notify_gate(&self) {
        self.gate_cv.notify_all();
    }

    fn gate_wait(&self, timeout: Duration) -> Result<(), EngineError> {
        let guard = self
            .gate
            .lock()
            .map_err(|_| EngineError::Internal("gate mutex poisoned".into()))?;
        let _ = self
            .gate_cv
            .wait_timeout(guard, timeout)
            .map_err(|_| EngineError::Internal("gate mutex poisoned".into()))?;
        Ok(())
    }

    fn stop_workers(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_flush();
        self.wake_compaction();
        self.notify_gate();
    }
}

// ------------------------------------------------------------------------------------------------
// Background workers
// ------------------------------------------------------------------------------------------------

fn spawn_flush_worker(shared: Arc<EngineShared>, rx: Receiver<()>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stratumdb-flush".into())
        .spawn(move || {
            while rx.recv().is_ok() {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                shared.flush_pending();
            }
            debug!("flush worker stopped");
        })
}

fn spawn_compaction_worker(
    shared: Arc<EngineShared>,
    rx: Receiver<()>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("stratumdb-compact".into())
        .spawn(move || {
            let mut failures: u32 = 0;
            loop {
                match rx.recv_timeout(shared.config.compaction_poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    break;
                }

                match shared.run_compaction_rounds() {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "compaction round failed, backing off");
                        thread::sleep(backoff_delay(failures));
                    }
                }
            }
            debug!("compaction worker stopped");
        })
}

/// Exponential back-off for failing background work: 100 ms doubling up
/// to 5 s.
fn backoff_delay(failures: u32) -> Duration {
    let millis = 100u64.saturating_mul(1 << failures.min(6).saturating_sub(1));
    Duration::from_millis(millis.min(5_000))
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Builds and publishes one table from an ordered record stream.
fn build_table(
    path: &Path,
    records: impl Iterator<Item = Record>,
    expected: usize,
    config: &EngineConfig,
) -> Result<(), TableError> {
    let mut builder = TableBuilder::new(
        path,
        expected,
        config.sstable_index_interval,
        config.sstable_bloom_fp_rate,
    )?;
    for record in records {
        if let Err(e) = builder.add(&record) {
            builder.abandon();
            return Err(e);
        }
    }
    builder.finish()?;
    Ok(())
}

/// Single-table probe with the read path's skip-on-error policy.
fn probe_table(table: &Arc<Table>, key: &[u8]) -> Option<TableGet> {
    match table.get(key) {
        Ok(TableGet::NotFound) => None,
        Ok(result) => Some(result),
        Err(e) => {
            warn!(table = table.id(), error = %e, "table read failed, skipping source");
            None
        }
    }
}

/// Lists `wal.log.<id>` files in the data directory, sorted by id.
fn find_frozen_wals(data_dir: &Path) -> Result<Vec<(u64, PathBuf)>, EngineError> {
    let prefix = format!("{WAL_FILE}.");
    let mut found = Vec::new();

    for entry in fs::read_dir(data_dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(id) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u64>().ok()) {
            found.push((id, path));
        }
    }

    found.sort_by_key(|(id, _)| *id);
    Ok(found)
}

// ------------------------------------------------------------------------------------------------
// ScanIter — visibility filtering over the merged stream
// ------------------------------------------------------------------------------------------------

/// Ordered iterator of live `(key, value)` pairs from [`Engine::scan`].
///
/// The underlying merge yields records in `(key ASC, seq DESC)` order;
/// the first record per key is therefore authoritative. Tombstones
/// suppress their key, older versions are deduplicated away.
pub struct ScanIter {
    input: MergeIterator<'static>,
    current_key: Option<Vec<u8>>,
}

impl Iterator for ScanIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for record in self.input.by_ref() {
            if self.current_key.as_deref() == Some(record.key()) {
                continue;
            }
            self.current_key = Some(record.key().to_vec());

            match record {
                Record::Put { key, value, .. } => return Some((key, value)),
                Record::Delete { .. } => continue,
            }
        }
        None
    }
}
