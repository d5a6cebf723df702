mod tests_basic;

use crate::engine::Record;

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
