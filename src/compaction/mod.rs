//! # Compaction Module
//!
//! Implements the size-tiered level compaction that keeps read
//! amplification bounded as flushes accumulate:
//!
//! ## Level-0 compaction
//!
//! Level 0 tables arrive from independent memtable flushes and may
//! overlap. Once their count reaches `l0_compaction_threshold`, **all**
//! of them — plus every level-1 table overlapping their combined key
//! range — are merged into level 1.
//!
//! ## Level-i compaction (i ≥ 1)
//!
//! When a level's total bytes exceed `level_base_bytes ×
//! level_size_multiplier^i`, the **oldest** table of the level (smallest
//! file id) plus every overlapping table of level i+1 are merged into
//! level i+1.
//!
//! ## Merge semantics
//!
//! Inputs feed a k-way merge ordered `(key ASC, seq DESC)`; the first
//! record seen per key is the newest and survives, so every output table
//! holds each key at most once. Tombstones are dropped **only** when the
//! output level is the deepest level — anywhere shallower they must
//! survive to keep masking older versions below. Output files rotate at
//! `sstable_target_bytes`, always on a key boundary.
//!
//! ## Installation & crash safety
//!
//! Outputs are built through `*.tmp` files and renamed into the target
//! level directory, which is then fsynced; the caller updates the level
//! manifest (add outputs, remove inputs) and marks the inputs obsolete
//! so their files unlink once the last reader drops. A crash mid-install
//! leaves either orphaned `*.tmp` files (removed at startup) or stale
//! inputs alongside the outputs (tolerated by the manifest's overlap
//! handling and cleaned up by the next round).
//!
//! ## Scheduling
//!
//! The planning/execution split keeps this module lock-free: the engine
//! worker snapshots the manifest, calls [`plan`], runs [`execute`]
//! without holding any engine lock, and applies the outcome under its
//! view lock. Shutdown is checked between merge records; an aborted
//! merge discards all partial outputs.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    fs, io,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::engine::{EngineConfig, MergeIterator, Record};
use crate::manifest::LevelManifest;
use crate::sstable::{Table, TableBuilder, TableError, TableIter};
use thiserror::Error;
use tracing::{debug, info, warn};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// SSTable build or read failure.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The merge was aborted by engine shutdown; partial outputs were
    /// discarded.
    #[error("Compaction canceled")]
    Canceled,
}

// ------------------------------------------------------------------------------------------------
// Plan & outcome types
// ------------------------------------------------------------------------------------------------

/// A selected compaction: which tables to merge and where the result goes.
#[derive(Debug)]
pub struct CompactionPlan {
    /// Level the trigger fired on.
    pub source_level: usize,

    /// Level receiving the merged output (`source_level + 1`, except the
    /// L0 trigger which always targets level 1).
    pub target_level: usize,

    /// Every input table: the source selection plus the overlapping
    /// target-level tables.
    pub inputs: Vec<Arc<Table>>,

    /// File ids of all inputs (removed from the manifest on install).
    pub removed_ids: Vec<u64>,

    /// Whether tombstones may be elided — true only when the target is
    /// the deepest level.
    pub drop_tombstones: bool,
}

/// Result of an executed compaction, ready for manifest installation.
pub struct CompactionOutcome {
    /// Level the trigger fired on.
    pub source_level: usize,

    /// Level the outputs were installed into.
    pub target_level: usize,

    /// File ids of the consumed inputs.
    pub removed_ids: Vec<u64>,

    /// Freshly-opened output tables, already renamed into place.
    pub outputs: Vec<Arc<Table>>,

    /// Total on-disk bytes of the inputs (stats: bytes compacted).
    pub bytes_in: u64,
}

// ------------------------------------------------------------------------------------------------
// Planning
// ------------------------------------------------------------------------------------------------

/// Evaluates level triggers against a manifest snapshot.
///
/// Returns the highest-priority eligible compaction, or `None` when no
/// trigger fires. Level 0 takes priority — an overfull L0 hurts every
/// read.
pub fn plan(manifest: &LevelManifest, config: &EngineConfig) -> Option<CompactionPlan> {
    let depth = manifest.depth();

    // Level-0 trigger: table count.
    let l0 = manifest.level_tables(0);
    if l0.len() >= config.l0_compaction_threshold {
        let min = l0.iter().map(|t| &t.meta().min_key).min()?.clone();
        let max = l0.iter().map(|t| &t.meta().max_key).max()?.clone();

        let mut inputs = l0.to_vec();
        inputs.extend(manifest.tables_overlapping_range(1, &min, &max));
        let removed_ids = inputs.iter().map(|t| t.id()).collect();

        debug!(
            l0_count = l0.len(),
            inputs = inputs.len(),
            "level-0 compaction planned"
        );

        return Some(CompactionPlan {
            source_level: 0,
            target_level: 1,
            inputs,
            removed_ids,
            drop_tombstones: depth == 2,
        });
    }

    // Level-i trigger: total bytes against the exponential target.
    for level in 1..depth.saturating_sub(1) {
        let bytes = manifest.level_bytes(level);
        let target = config
            .level_base_bytes
            .saturating_mul(config.level_size_multiplier.saturating_pow(level as u32));
        if bytes <= target {
            continue;
        }

        // Oldest table first: smallest file id.
        let source = manifest
            .level_tables(level)
            .iter()
            .min_by_key(|t| t.id())?
            .clone();

        let mut inputs = vec![Arc::clone(&source)];
        inputs.extend(manifest.tables_overlapping_range(
            level + 1,
            &source.meta().min_key,
            &source.meta().max_key,
        ));
        let removed_ids = inputs.iter().map(|t| t.id()).collect();

        debug!(
            level,
            bytes,
            target,
            inputs = inputs.len(),
            "level compaction planned"
        );

        return Some(CompactionPlan {
            source_level: level,
            target_level: level + 1,
            inputs,
            removed_ids,
            drop_tombstones: level + 1 == depth - 1,
        });
    }

    None
}

// ------------------------------------------------------------------------------------------------
// Execution
// ------------------------------------------------------------------------------------------------

/// Runs the planned merge and publishes its output files.
///
/// Performs no engine locking: inputs are `Arc` handles into immutable
/// tables, outputs are built and renamed into the target level directory
/// (which is fsynced afterwards). The caller installs the outcome into
/// the manifest and marks the inputs obsolete.
///
/// `shutdown` is polled between records; when it trips, every finished
/// or partial output is deleted and [`CompactionError::Canceled`] is
/// returned.
pub fn execute(
    plan: &CompactionPlan,
    data_dir: &Path,
    config: &EngineConfig,
    next_file_id: &AtomicU64,
    shutdown: &AtomicBool,
) -> Result<CompactionOutcome, CompactionError> {
    let bytes_in: u64 = plan.inputs.iter().map(|t| t.file_size()).sum();
    let expected: u64 = plan.inputs.iter().map(|t| t.meta().key_count).sum();

    info!(
        source_level = plan.source_level,
        target_level = plan.target_level,
        inputs = plan.inputs.len(),
        bytes_in,
        drop_tombstones = plan.drop_tombstones,
        "compaction starting"
    );

    let iters: Vec<Box<dyn Iterator<Item = Record>>> = plan
        .inputs
        .iter()
        .map(|t| Box::new(TableIter::new_full(Arc::clone(t))) as Box<dyn Iterator<Item = Record>>)
        .collect();
    let merged = MergeIterator::new(iters);

    let mut finished: Vec<(u64, std::path::PathBuf)> = Vec::new();
    let mut builder: Option<TableBuilder> = None;
    let mut last_key: Option<Vec<u8>> = None;

    let result = (|| -> Result<(), CompactionError> {
        for record in merged {
            if shutdown.load(Ordering::Relaxed) {
                return Err(CompactionError::Canceled);
            }

            // First record per key is the newest (merge order); the rest
            // are superseded versions.
            if last_key.as_deref() == Some(record.key()) {
                continue;
            }
            last_key = Some(record.key().to_vec());

            if record.is_tombstone() && plan.drop_tombstones {
                continue;
            }

            // Rotate the output at the target size, on a key boundary.
            if builder
                .as_ref()
                .is_some_and(|b| b.data_bytes() >= config.sstable_target_bytes)
            {
                if let Some(full) = builder.take() {
                    full.finish()?;
                }
            }

            if builder.is_none() {
                let id = next_file_id.fetch_add(1, Ordering::SeqCst);
                let path = LevelManifest::table_path(data_dir, plan.target_level, id);
                finished.push((id, path.clone()));
                builder = Some(TableBuilder::new(
                    &path,
                    expected as usize,
                    config.sstable_index_interval,
                    config.sstable_bloom_fp_rate,
                )?);
            }

            if let Some(b) = builder.as_mut() {
                b.add(&record)?;
            }
        }

        match builder.take() {
            Some(b) if b.count() > 0 => {
                b.finish()?;
            }
            Some(b) => {
                // All surviving records were elided; nothing to publish.
                b.abandon();
                finished.pop();
            }
            None => {}
        }

        Ok(())
    })();

    if let Err(e) = result {
        discard_outputs(&mut builder, &finished);
        return Err(e);
    }

    // Edge case: every input record was a dropped tombstone duplicate.
    if finished.is_empty() {
        sync_dir(&LevelManifest::level_dir(data_dir, plan.target_level));
        info!(
            source_level = plan.source_level,
            "compaction eliminated every record, no output produced"
        );
        return Ok(CompactionOutcome {
            source_level: plan.source_level,
            target_level: plan.target_level,
            removed_ids: plan.removed_ids.clone(),
            outputs: Vec::new(),
            bytes_in,
        });
    }

    // Make the renames durable before the manifest swap.
    sync_dir(&LevelManifest::level_dir(data_dir, plan.target_level));

    let mut outputs = Vec::with_capacity(finished.len());
    for (id, path) in &finished {
        outputs.push(Arc::new(Table::open(path, *id)?));
    }

    info!(
        source_level = plan.source_level,
        target_level = plan.target_level,
        outputs = outputs.len(),
        keys_out = outputs.iter().map(|t| t.meta().key_count).sum::<u64>(),
        "compaction finished"
    );

    Ok(CompactionOutcome {
        source_level: plan.source_level,
        target_level: plan.target_level,
        removed_ids: plan.removed_ids.clone(),
        outputs,
        bytes_in,
    })
}

/// Deletes every output this merge produced — the abort path.
fn discard_outputs(builder: &mut Option<TableBuilder>, finished: &[(u64, std::path::PathBuf)]) {
    if let Some(b) = builder.take() {
        b.abandon();
    }
    // The last entry may belong to the abandoned in-flight builder, whose
    // final file was never renamed into place; the exists() check skips it.
    for (_, path) in finished {
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to discard compaction output");
            }
        }
    }
}

/// Fsyncs a directory so renames into it are durable.
pub(crate) fn sync_dir(dir: &Path) {
    match fs::File::open(dir) {
        Ok(handle) => {
            if let Err(e) = handle.sync_all() {
                warn!(dir = %dir.display(), error = %e, "directory fsync failed");
            }
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "directory open for fsync failed"),
    }
}
