//! SSTable iterators — streaming record reads over the data region.
//!
//! [`TableIter`] walks the mapped data region record by record, yielding
//! [`Record`] values in key order. It powers both compaction (full-table
//! reads) and range scans (bounded reads positioned via the sparse
//! index).
//!
//! The iterator owns an `Arc<Table>`, so it can outlive the manifest
//! entry that produced it — an obsoleted table's file stays readable
//! until every iterator over it is dropped.
//!
//! Corruption inside the data region is treated as end-of-table: the
//! error is logged and the iterator stops, leaving other read sources
//! unaffected (the engine's skip-and-continue policy for read-path
//! corruption).

use std::sync::Arc;

use tracing::warn;

use crate::engine::Record;

use super::{Table, decode_record};

/// Streaming iterator over a table's records, optionally bounded.
pub struct TableIter {
    /// Shared handle keeping the mmap alive.
    table: Arc<Table>,

    /// Cursor into the data region, always at a record boundary.
    offset: usize,

    /// Inclusive lower bound still to be applied (range scans position
    /// via the sparse index, which lands at most `index_interval - 1`
    /// records early).
    skip_below: Option<Vec<u8>>,

    /// Exclusive upper bound; `None` streams to the end of the table.
    end: Option<Vec<u8>>,
}

impl TableIter {
    /// Iterator over every record in the table.
    pub fn new_full(table: Arc<Table>) -> Self {
        Self {
            table,
            offset: 0,
            skip_below: None,
            end: None,
        }
    }

    /// Iterator over records with `start <= key < end`.
    pub fn new_range(table: Arc<Table>, start: &[u8], end: &[u8]) -> Self {
        let offset = if start <= table.meta().min_key.as_slice() {
            0
        } else {
            table.seek_offset(start)
        };

        Self {
            table,
            offset,
            skip_below: Some(start.to_vec()),
            end: Some(end.to_vec()),
        }
    }
}

impl Iterator for TableIter {
    type Item = Record;

    fn next(&mut self) -> Option<Self::Item> {
        let data = self.table.data();

        loop {
            if self.offset >= data.len() {
                return None;
            }

            let (record, next) = match decode_record(data, self.offset) {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!(
                        table = self.table.id(),
                        offset = self.offset,
                        error = %e,
                        "record decode failed mid-table, ending iteration"
                    );
                    self.offset = data.len();
                    return None;
                }
            };
            self.offset = next;

            if let Some(start) = &self.skip_below {
                if record.key() < start.as_slice() {
                    continue;
                }
                self.skip_below = None;
            }

            if let Some(end) = &self.end {
                if record.key() >= end.as_slice() {
                    self.offset = data.len();
                    return None;
                }
            }

            return Some(record);
        }
    }
}
