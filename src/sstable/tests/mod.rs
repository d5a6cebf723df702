mod tests_basic;
mod tests_corruption;
mod tests_properties;
mod tests_scan;

use std::path::Path;
use std::sync::Arc;

use crate::engine::Record;
use crate::sstable::{Table, TableBuilder, TableIter};

pub(crate) fn put(key: &[u8], value: &[u8], seq: u64) -> Record {
    Record::Put {
        key: key.to_vec(),
        value: value.to_vec(),
        seq,
    }
}

pub(crate) fn del(key: &[u8], seq: u64) -> Record {
    Record::Delete {
        key: key.to_vec(),
        seq,
    }
}

/// Builds a table at `path` from the given pre-sorted records and opens
/// it back up.
pub(crate) fn build_and_open(
    path: &Path,
    records: &[Record],
    index_interval: usize,
) -> Arc<Table> {
    let mut builder = TableBuilder::new(path, records.len(), index_interval, 0.01).unwrap();
    for record in records {
        builder.add(record).unwrap();
    }
    builder.finish().unwrap();
    Arc::new(Table::open(path, 1).unwrap())
}

/// Full-table iterator over a shared handle.
pub(crate) fn iter_all(table: &Arc<Table>) -> TableIter {
    TableIter::new_full(Arc::clone(table))
}

/// Bounded iterator over a shared handle.
pub(crate) fn iter_range(table: &Arc<Table>, start: &[u8], end: &[u8]) -> TableIter {
    TableIter::new_range(Arc::clone(table), start, end)
}

/// `count` sequential records `key-0000..` with per-key values.
pub(crate) fn seq_records(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            put(
                format!("key-{i:04}").as_bytes(),
                format!("value-{i}").as_bytes(),
                i as u64 + 1,
            )
        })
        .collect()
}
