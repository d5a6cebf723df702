//! # Memtable Module
//!
//! ## Design Invariants
//!
//! - The memtable holds exactly **one record per key** — the one with the
//!   highest sequence number seen so far. Insertions overwrite in place.
//! - Deletes are represented via tombstones, not physical removal, so
//!   they can mask older versions living in deeper levels.
//! - Size is the sum of key+value byte lengths of resident records;
//!   entry count is the number of distinct keys. Both feed the engine's
//!   rotation thresholds.
//!
//! ## Concurrency
//!
//! A coarse `RwLock` protects the ordered map. The engine's writer mutex
//! guarantees a single writer; readers proceed concurrently and never
//! block writers for longer than a map operation. Range reads collect
//! their results under the read lock, so the returned iterators are
//! stable snapshots — required for frozen memtables, whose contents must
//! not appear to change while a flush is writing them out.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::{
    collections::BTreeMap,
    sync::{
        RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::engine::Record;
use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Memtable`] operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Memtable Core
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup in the memtable.
#[derive(Debug, PartialEq)]
pub enum MemtableGet {
    /// Value found for the key.
    Put(Vec<u8>),

    /// Key was deleted; the tombstone masks older versions below.
    Tombstone,

    /// The memtable holds no information about the key.
    NotFound,
}

/// The newest version of a key resident in the memtable.
#[derive(Debug, Clone)]
struct Slot {
    /// `None` marks a tombstone.
    value: Option<Vec<u8>>,

    /// Sequence number of this version.
    seq: u64,
}

impl Slot {
    /// Key-relative byte footprint: value bytes only (the key length is
    /// added by the caller, which still owns the key).
    fn value_len(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }

    fn to_record(&self, key: &[u8]) -> Record {
        match &self.value {
            Some(value) => Record::Put {
                key: key.to_vec(),
                value: value.clone(),
                seq: self.seq,
            },
            None => Record::Delete {
                key: key.to_vec(),
                seq: self.seq,
            },
        }
    }
}

/// The mutable, in-memory write buffer of the storage engine.
///
/// The engine applies WAL-logged records here and serves the newest data
/// from it. Once frozen (by swapping a fresh memtable into the engine
/// view), no further `apply` calls arrive and the contents are stable
/// until the flush worker persists them as a level-0 table.
pub struct Memtable {
    /// Ordered key → newest record map.
    inner: RwLock<BTreeMap<Vec<u8>, Slot>>,

    /// Sum of key+value bytes across resident records.
    bytes: AtomicU64,

    /// Number of distinct keys.
    entries: AtomicU64,

    /// Highest sequence number applied; 0 when empty.
    max_seq: AtomicU64,
}

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            bytes: AtomicU64::new(0),
            entries: AtomicU64::new(0),
            max_seq: AtomicU64::new(0),
        }
    }

    /// Applies one record, overwriting any prior entry for the same key.
    ///
    /// Called from the engine's serialized writer path (after the WAL
    /// append) and from WAL replay during recovery. WAL append order
    /// guarantees ascending sequence numbers per key in both cases.
    pub fn apply(&self, record: Record) -> Result<(), MemtableError> {
        let seq = record.seq();
        let (key, value) = match record {
            Record::Put { key, value, .. } => (key, Some(value)),
            Record::Delete { key, .. } => (key, None),
        };
        let key_len = key.len() as u64;
        let slot = Slot { value, seq };
        let new_value_len = slot.value_len() as u64;

        let mut guard = self
            .inner
            .write()
            .map_err(|_| MemtableError::Internal("RwLock poisoned".into()))?;

        match guard.insert(key, slot) {
            Some(old) => {
                // Overwrite: key bytes cancel out, only the value delta moves.
                let old_value_len = old.value_len() as u64;
                if new_value_len >= old_value_len {
                    self.bytes
                        .fetch_add(new_value_len - old_value_len, Ordering::Relaxed);
                } else {
                    self.bytes
                        .fetch_sub(old_value_len - new_value_len, Ordering::Relaxed);
                }
            }
            None => {
                self.bytes
                    .fetch_add(key_len + new_value_len, Ordering::Relaxed);
                self.entries.fetch_add(1, Ordering::Relaxed);
            }
        }
        drop(guard);

        self.max_seq.fetch_max(seq, Ordering::Relaxed);
        Ok(())
    }

    /// Retrieves the newest entry for `key`.
    pub fn get(&self, key: &[u8]) -> Result<MemtableGet, MemtableError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("RwLock poisoned".into()))?;

        Ok(match guard.get(key) {
            Some(Slot {
                value: Some(value), ..
            }) => MemtableGet::Put(value.clone()),
            Some(Slot { value: None, .. }) => MemtableGet::Tombstone,
            None => MemtableGet::NotFound,
        })
    }

    /// Ordered snapshot of all records with `start <= key < end`.
    ///
    /// Tombstones are included — the merge layer above decides visibility.
    /// The result is collected under the read lock, so later writes to a
    /// live memtable are not observed by the returned iterator.
    pub fn scan(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<impl Iterator<Item = Record> + 'static, MemtableError> {
        if start >= end {
            return Ok(Vec::new().into_iter());
        }

        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("RwLock poisoned".into()))?;

        let records: Vec<Record> = guard
            .range(start.to_vec()..end.to_vec())
            .map(|(key, slot)| slot.to_record(key))
            .collect();

        Ok(records.into_iter())
    }

    /// Ordered snapshot of **all** records, tombstones included.
    ///
    /// Consumed by the flush path to build a level-0 table; iteration
    /// order matches the table builder's strictly-ascending requirement.
    pub fn iter_for_flush(&self) -> Result<impl Iterator<Item = Record> + 'static, MemtableError> {
        let guard = self
            .inner
            .read()
            .map_err(|_| MemtableError::Internal("RwLock poisoned".into()))?;

        let records: Vec<Record> = guard
            .iter()
            .map(|(key, slot)| slot.to_record(key))
            .collect();

        Ok(records.into_iter())
    }

    /// Sum of key+value bytes across resident records.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Number of distinct keys.
    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::Relaxed)
    }

    /// `true` when no record has ever been applied.
    pub fn is_empty(&self) -> bool {
        self.entries() == 0
    }

    /// Highest sequence number applied so far; 0 when empty.
    pub fn max_seq(&self) -> u64 {
        self.max_seq.load(Ordering::Relaxed)
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
