//! # StratumDB
//!
//! An embeddable, persistent key-value storage engine built on a
//! **leveled Log-Structured Merge Tree (LSM-tree)**. Designed for fast
//! writes, ordered scans, and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Engine                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────┐  │
//! │  │  Active     │  │   Frozen     │  │   Levels     │  │
//! │  │  Memtable   │  │  Memtable    │  │  level_0/…   │  │
//! │  │  + WAL      │  │  + WAL       │  │  level_N/…   │  │
//! │  └─────┬───────┘  └──────┬───────┘  └──────┬───────┘  │
//! │        │   rotate        │   flush         │          │
//! │        └─────────►       └────────►        │          │
//! │                                            │          │
//! │  ┌─────────────────────────────────────────┘          │
//! │  │  Compaction (level 0 → 1 → … → deepest)           │
//! │  └────────────────────────────────────────────────────│
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Core storage engine — open, read, write, scan, flush, compact |
//! | [`memtable`] | In-memory ordered write buffer, one newest record per key |
//! | [`wal`] | CRC-protected append-only write-ahead log for crash recovery |
//! | [`sstable`] | Immutable sorted tables with sparse index and bloom filter |
//! | [`manifest`] | Per-level table lists, reconstructed from the directory tree |
//! | [`compaction`] | Size-tiered level compaction: triggers, merge, install |
//! | [`encoding`] | Deterministic wire primitives and varint codec |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted (fsync per
//!   config) before being acknowledged; torn tails are truncated on
//!   recovery.
//! - **Ordered byte-string keys** — point reads and half-open range
//!   scans with last-write-wins semantics via monotonic sequence
//!   numbers.
//! - **Bloom-filtered tables** — each table carries a bloom filter and
//!   a sparse index, so point lookups touch at most a handful of
//!   records per table.
//! - **Leveled compaction** — background merging keeps level 0 small
//!   and deeper levels disjoint; tombstones are dropped only at the
//!   deepest level.
//! - **Snapshot reads** — `get` and `scan` capture a consistent view
//!   and never block the writer path.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratumdb::{Engine, EngineConfig};
//!
//! let engine = Engine::open(EngineConfig {
//!     data_dir: "/tmp/my_db".into(),
//!     ..EngineConfig::default()
//! })
//! .unwrap();
//!
//! // Write
//! engine.put(b"hello".to_vec(), b"world".to_vec()).unwrap();
//!
//! // Read
//! assert_eq!(engine.get(b"hello").unwrap(), Some(b"world".to_vec()));
//!
//! // Delete
//! engine.delete(b"hello".to_vec()).unwrap();
//! assert_eq!(engine.get(b"hello").unwrap(), None);
//!
//! // Scan
//! engine.put(b"a".to_vec(), b"1".to_vec()).unwrap();
//! engine.put(b"b".to_vec(), b"2".to_vec()).unwrap();
//! let results: Vec<_> = engine.scan(b"a", b"c").unwrap().collect();
//!
//! // Graceful shutdown
//! engine.close().unwrap();
//! ```

pub mod compaction;
pub mod encoding;
pub mod engine;
pub mod manifest;
pub mod memtable;
pub mod sstable;
pub mod wal;

pub use engine::{Engine, EngineConfig, EngineError, EngineStats, Record, ScanIter};
