//! # Level Manifest
//!
//! The manifest tracks which SSTables belong to which level. It is an
//! **in-memory** structure: the durable truth is the directory layout
//! itself (`level_<i>/<id>.sst`), reconstructed on every startup by
//! listing the level directories and opening each table's metadata.
//!
//! ## Ordering invariants
//!
//! - **Level 0** tables may overlap (they come from independent memtable
//!   flushes) and are kept **newest-first by file id** — the read path
//!   consults them in that order.
//! - **Levels ≥ 1** are kept sorted by `min_key` ascending with pairwise
//!   disjoint key ranges, so a point lookup binary-searches for the at
//!   most one table containing the key.
//!
//! ## Crash tolerance
//!
//! A crash between a compaction's output renames and its input unlinks
//! leaves stale inputs on disk; the next startup loads them alongside
//! the outputs, which can transiently violate the disjointness invariant
//! of a level ≥ 1. Each level therefore tracks an `overlapped` flag:
//! while set, key lookups fall back to a metadata filter over the level
//! (newest file id first) instead of the binary search. Duplicate record
//! versions reconcile through sequence numbers, and the next compaction
//! round restores disjointness. Orphaned `*.tmp` build files are deleted
//! during loading; unreadable tables are logged and skipped.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::sstable::Table;
use thiserror::Error;
use tracing::{debug, info, warn};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by manifest reconstruction.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// ------------------------------------------------------------------------------------------------
// Level
// ------------------------------------------------------------------------------------------------

/// One level's table set plus its transient-overlap marker.
#[derive(Clone, Default)]
struct Level {
    /// L0: newest-first by id. L≥1: sorted by `min_key` ascending.
    tables: Vec<Arc<Table>>,

    /// Set when sibling key ranges overlap (crash residue on a level
    /// ≥ 1); cleared once compaction restores disjointness.
    overlapped: bool,
}

impl Level {
    /// Re-sorts and re-derives the overlap marker for a level ≥ 1.
    fn normalize(&mut self) {
        self.tables
            .sort_by(|a, b| a.meta().min_key.cmp(&b.meta().min_key));
        self.overlapped = self
            .tables
            .windows(2)
            .any(|pair| pair[0].meta().max_key >= pair[1].meta().min_key);
    }
}

// ------------------------------------------------------------------------------------------------
// LevelManifest
// ------------------------------------------------------------------------------------------------

/// Per-level lists of published table handles.
///
/// Readers clone the whole structure (cheap — `Arc` per table) under the
/// engine's view lock and then search without any lock held.
#[derive(Clone)]
pub struct LevelManifest {
    levels: Vec<Level>,
}

impl LevelManifest {
    /// Directory holding level `i`'s tables.
    pub fn level_dir(data_dir: &Path, level: usize) -> PathBuf {
        data_dir.join(format!("level_{level}"))
    }

    /// Final path of table `id` in level `level`.
    pub fn table_path(data_dir: &Path, level: usize, id: u64) -> PathBuf {
        Self::level_dir(data_dir, level).join(format!("{id:06}.sst"))
    }

    /// Reconstructs the manifest by listing `level_<i>/*.sst`.
    ///
    /// Creates missing level directories, removes orphaned `*.tmp` build
    /// files, and skips (with a warning) any table that fails to open.
    /// Returns the manifest and the highest file id observed.
    pub fn load(data_dir: &Path, max_levels: usize) -> Result<(Self, u64), ManifestError> {
        let mut levels = Vec::with_capacity(max_levels);
        let mut max_id: u64 = 0;

        for level_no in 0..max_levels {
            let dir = Self::level_dir(data_dir, level_no);
            fs::create_dir_all(&dir)?;

            let mut level = Level::default();

            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }

                match path.extension().and_then(|s| s.to_str()) {
                    Some("tmp") => {
                        warn!(path = %path.display(), "removing orphaned build file");
                        if let Err(e) = fs::remove_file(&path) {
                            warn!(path = %path.display(), error = %e, "orphan removal failed");
                        }
                        continue;
                    }
                    Some("sst") => {}
                    _ => continue,
                }

                let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
                else {
                    warn!(path = %path.display(), "unrecognized table file name, skipping");
                    continue;
                };

                match Table::open(&path, id) {
                    Ok(table) => {
                        max_id = max_id.max(id);
                        level.tables.push(Arc::new(table));
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unusable table skipped");
                    }
                }
            }

            if level_no == 0 {
                level.tables.sort_by(|a, b| b.id().cmp(&a.id()));
            } else {
                level.normalize();
                if level.overlapped {
                    warn!(
                        level = level_no,
                        "level loaded with overlapping tables (crash residue), \
                         reads will consult all candidates until compaction"
                    );
                }
            }

            levels.push(level);
        }

        let counts: Vec<usize> = levels.iter().map(|l| l.tables.len()).collect();
        info!(?counts, max_id, "level manifest reconstructed");

        Ok((Self { levels }, max_id))
    }

    /// Number of levels.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Tables of level `i`, in that level's canonical order.
    pub fn level_tables(&self, level: usize) -> &[Arc<Table>] {
        &self.levels[level].tables
    }

    /// Per-level table counts.
    pub fn table_counts(&self) -> Vec<usize> {
        self.levels.iter().map(|l| l.tables.len()).collect()
    }

    /// `true` while a level ≥ 1 carries crash-residue overlap between
    /// sibling key ranges.
    pub fn level_overlapped(&self, level: usize) -> bool {
        self.levels[level].overlapped
    }

    /// Total on-disk bytes of level `i`.
    pub fn level_bytes(&self, level: usize) -> u64 {
        self.levels[level]
            .tables
            .iter()
            .map(|t| t.file_size())
            .sum()
    }

    /// Installs a freshly-flushed table into level 0.
    ///
    /// File ids are monotonic, so the new table goes to the front of the
    /// newest-first list.
    pub fn add_l0(&mut self, table: Arc<Table>) {
        debug_assert!(
            self.levels[0]
                .tables
                .first()
                .is_none_or(|t| t.id() < table.id())
        );
        self.levels[0].tables.insert(0, table);
    }

    /// The table(s) of a level ≥ 1 that may contain `key`.
    ///
    /// In steady state the level is disjoint and this is a binary search
    /// yielding at most one table. While the level carries crash-residue
    /// overlap, every covering table is returned, newest file id first.
    pub fn tables_for_key(&self, level: usize, key: &[u8]) -> Vec<Arc<Table>> {
        let lvl = &self.levels[level];

        if !lvl.overlapped {
            let p = lvl
                .tables
                .partition_point(|t| t.meta().min_key.as_slice() <= key);
            if p == 0 {
                return Vec::new();
            }
            let table = &lvl.tables[p - 1];
            if table.key_in_range(key) {
                return vec![Arc::clone(table)];
            }
            return Vec::new();
        }

        let mut candidates: Vec<Arc<Table>> = lvl
            .tables
            .iter()
            .filter(|t| t.key_in_range(key))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| b.id().cmp(&a.id()));
        candidates
    }

    /// Tables of `level` intersecting the half-open scan range
    /// `[start, end)`, in the level's canonical order.
    pub fn tables_overlapping_scan(
        &self,
        level: usize,
        start: &[u8],
        end: &[u8],
    ) -> Vec<Arc<Table>> {
        self.levels[level]
            .tables
            .iter()
            .filter(|t| t.overlaps(start, end))
            .cloned()
            .collect()
    }

    /// Tables of `level` intersecting the **inclusive** key interval
    /// `[min, max]` — compaction input selection.
    pub fn tables_overlapping_range(
        &self,
        level: usize,
        min: &[u8],
        max: &[u8],
    ) -> Vec<Arc<Table>> {
        self.levels[level]
            .tables
            .iter()
            .filter(|t| t.meta().min_key.as_slice() <= max && min <= t.meta().max_key.as_slice())
            .cloned()
            .collect()
    }

    /// Swaps compaction inputs for outputs.
    ///
    /// Removes `removed_ids` from the source and target levels, inserts
    /// `added` into the target level, restores the target's ordering and
    /// overlap marker, and returns the removed handles so the caller can
    /// mark them obsolete.
    pub fn apply_compaction(
        &mut self,
        source_level: usize,
        target_level: usize,
        removed_ids: &[u64],
        added: Vec<Arc<Table>>,
    ) -> Vec<Arc<Table>> {
        let mut removed = Vec::new();

        for level_no in [source_level, target_level] {
            let lvl = &mut self.levels[level_no];
            let mut kept = Vec::with_capacity(lvl.tables.len());
            for table in lvl.tables.drain(..) {
                if removed_ids.contains(&table.id()) {
                    removed.push(table);
                } else {
                    kept.push(table);
                }
            }
            lvl.tables = kept;
        }

        self.levels[target_level].tables.extend(added);
        self.levels[target_level].normalize();

        // Removing tables cannot introduce overlap in the source level,
        // but it may have cleared crash residue.
        if source_level >= 1 {
            self.levels[source_level].normalize();
        }

        debug!(
            source_level,
            target_level,
            removed = removed.len(),
            "compaction applied to manifest"
        );

        removed
    }
}
