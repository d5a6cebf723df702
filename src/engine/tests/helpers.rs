use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::engine::{Engine, EngineConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times — only the first call takes effect.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Baseline test config: everything fits in the memtable, background
/// compaction effectively disabled, no per-write fsync (tests that care
/// about durability opt back in).
pub(crate) fn base_config(dir: &Path) -> EngineConfig {
    init_tracing();
    EngineConfig {
        data_dir: dir.to_path_buf(),
        memtable_max_bytes: 64 * 1024 * 1024,
        memtable_max_entries: 1_000_000,
        wal_sync_on_write: false,
        l0_compaction_threshold: 100,
        l0_stall_threshold: 0,
        compaction_poll_interval: Duration::from_secs(60),
        ..EngineConfig::default()
    }
}

/// Rotation every 64 entries — exercises freeze/flush quickly.
pub(crate) fn small_memtable_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        memtable_max_entries: 64,
        ..base_config(dir)
    }
}

/// Small memtable plus an eager two-level compaction setup.
pub(crate) fn compacting_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        memtable_max_entries: 64,
        l0_compaction_threshold: 2,
        max_levels: 2,
        ..base_config(dir)
    }
}

/// Opens an engine and loads `count` keys `key_<i:05>` → `value_<i:05>`.
pub(crate) fn engine_with_keys(config: EngineConfig, count: usize) -> Engine {
    let engine = Engine::open(config).expect("open");
    for i in 0..count {
        engine
            .put(key(i), format!("value_{i:05}").into_bytes())
            .expect("put");
    }
    engine
}

/// The standard test key `key_<i:05>`.
pub(crate) fn key(i: usize) -> Vec<u8> {
    format!("key_{i:05}").into_bytes()
}

/// Collect scan results into a Vec.
pub(crate) fn collect_scan(engine: &Engine, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    engine.scan(start, end).expect("scan").collect()
}
