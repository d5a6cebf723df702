mod tests_corruption;

use crate::engine::Record;

/// Payload bound used by all WAL tests — generous enough for any record
/// the tests produce.
pub(crate) const MAX_PAYLOAD: usize = 1024 * 1024;

/// Shorthand put record.
pub(crate) fn put(key: &[u8], value: &[u8], seq: u64) -> Record {
    Record::Put {
        key: key.to_vec(),
        value: value.to_vec(),
        seq,
    }
}

/// Shorthand tombstone record.
pub(crate) fn del(key: &[u8], seq: u64) -> Record {
    Record::Delete {
        key: key.to_vec(),
        seq,
    }
}

/// Field-by-field record equality (`Record`'s own `PartialEq` compares
/// only key and seq, which is what merge ordering needs).
pub(crate) fn assert_same_record(actual: &Record, expected: &Record) {
    match (actual, expected) {
        (
            Record::Put {
                key: ka,
                value: va,
                seq: sa,
            },
            Record::Put {
                key: ke,
                value: ve,
                seq: se,
            },
        ) => {
            assert_eq!(ka, ke);
            assert_eq!(va, ve);
            assert_eq!(sa, se);
        }
        (Record::Delete { key: ka, seq: sa }, Record::Delete { key: ke, seq: se }) => {
            assert_eq!(ka, ke);
            assert_eq!(sa, se);
        }
        (actual, expected) => panic!("record kind mismatch: {actual:?} vs {expected:?}"),
    }
}
