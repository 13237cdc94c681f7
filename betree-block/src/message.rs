use std::cmp::Ordering;
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::block::{BlockReader, BlockWriter};
use crate::comparator::Comparator;

const KIND_PUT: u8 = 1;
const KIND_DEL: u8 = 2;

/// Failure decoding a message or a message table from its wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("truncated field while decoding a message")]
    Truncated,
    #[error("unrecognized message kind tag")]
    UnknownKind,
}

/// A tagged pending mutation against a single key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

impl Message {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Message::Put { key: key.into(), value: value.into() }
    }

    pub fn del(key: impl Into<Vec<u8>>) -> Self {
        Message::Del { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Message::Put { key, .. } => key,
            Message::Del { key } => key,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Message::Put { value, .. } => Some(value),
            Message::Del { .. } => None,
        }
    }

    /// Approximate in-memory footprint, used by the cache's byte accounting
    /// and by the node's `write_back_size()` estimate.
    pub fn size(&self) -> usize {
        const OVERHEAD: usize = 16;
        OVERHEAD
            + self.key().len()
            + self.value().map(|v| v.len()).unwrap_or(0)
    }

    pub fn encode(&self, w: &mut BlockWriter) {
        match self {
            Message::Put { key, value } => {
                w.write_u8(KIND_PUT);
                w.write_bytes(key);
                w.write_bytes(value);
            }
            Message::Del { key } => {
                w.write_u8(KIND_DEL);
                w.write_bytes(key);
            }
        }
    }

    /// Decode one message. Fails if the reader runs past the end of the
    /// block, or the tag byte doesn't name a known kind (corruption).
    pub fn decode(r: &mut BlockReader) -> Result<Self, CodecError> {
        let kind = r.read_u8();
        let key = r.read_bytes();
        if !r.ok() {
            return Err(CodecError::Truncated);
        }
        match kind {
            KIND_PUT => {
                let value = r.read_bytes();
                if !r.ok() {
                    return Err(CodecError::Truncated);
                }
                Ok(Message::Put { key, value })
            }
            KIND_DEL => Ok(Message::Del { key }),
            _ => Err(CodecError::UnknownKind),
        }
    }
}

/// Key wrapper that threads a comparator through `Ord` so the skiplist orders
/// entries the way the database was configured to, not necessarily plain
/// byte order.
#[derive(Clone)]
struct CmpKey {
    key: Vec<u8>,
    cmp: Arc<dyn Comparator>,
}

impl PartialEq for CmpKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for CmpKey {}

impl PartialOrd for CmpKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CmpKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.key, &other.key)
    }
}

/// An ordered set of pending messages, keyed by message key, resolving
/// duplicate keys by overwrite (last insert wins). Backed by a skiplist so
/// insert/lookup stay logarithmic under a mix of in-order and random keys.
pub struct MessageTable {
    cmp: Arc<dyn Comparator>,
    map: SkipMap<CmpKey, Message>,
}

impl MessageTable {
    pub fn new(cmp: Arc<dyn Comparator>) -> Self {
        Self { cmp, map: SkipMap::new() }
    }

    fn wrap(&self, key: &[u8]) -> CmpKey {
        CmpKey { key: key.to_vec(), cmp: self.cmp.clone() }
    }

    /// Insert a message, overwriting and dropping any existing entry for the
    /// same key.
    pub fn insert(&self, msg: Message) {
        let key = self.wrap(msg.key());
        self.map.remove(&key);
        self.map.insert(key, msg);
    }

    pub fn find(&self, key: &[u8]) -> Option<Message> {
        let key = self.wrap(key);
        self.map.get(&key).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        for entry in self.map.iter() {
            entry.remove();
        }
    }

    /// Total approximate byte footprint of all messages currently held.
    pub fn size(&self) -> usize {
        self.map.iter().map(|e| e.value().size()).sum()
    }

    /// Lazily iterate all messages in key order.
    pub fn iter(&self) -> impl Iterator<Item = Message> + '_ {
        self.map.iter().map(|e| e.value().clone())
    }

    /// Split off the upper half (by message count, ordered by key) into a
    /// freshly returned table, removing those entries from `self`. Returns
    /// the key at which the split occurred (the first key of the upper
    /// half), which becomes the new pivot's `left_most_key`.
    pub fn split_by_count(&self) -> (MessageTable, Vec<u8>) {
        let all: Vec<Message> = self.iter().collect();
        let mid = all.len() / 2;
        let split_key = all[mid].key().to_vec();
        let upper = MessageTable::new(self.cmp.clone());
        for msg in all.into_iter().skip(mid) {
            let key = self.wrap(msg.key());
            self.map.remove(&key);
            upper.insert(msg);
        }
        (upper, split_key)
    }

    pub fn serialize(&self, w: &mut BlockWriter) {
        let msgs: Vec<Message> = self.iter().collect();
        w.write_u32(msgs.len() as u32);
        for msg in &msgs {
            msg.encode(w);
        }
    }

    pub fn deserialize(r: &mut BlockReader, cmp: Arc<dyn Comparator>) -> Result<MessageTable, CodecError> {
        let count = r.read_u32();
        let table = MessageTable::new(cmp);
        for _ in 0..count {
            let msg = Message::decode(r)?;
            table.insert(msg);
        }
        if !r.ok() {
            return Err(CodecError::Truncated);
        }
        Ok(table)
    }
}

impl std::fmt::Debug for MessageTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTable").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::ByteComparator;

    fn table() -> MessageTable {
        MessageTable::new(Arc::new(ByteComparator))
    }

    #[test]
    fn overwrite_keeps_one_entry_per_key() {
        let t = table();
        t.insert(Message::put("k", "v1"));
        t.insert(Message::put("k", "v2"));
        assert_eq!(t.len(), 1);
        assert_eq!(t.find(b"k"), Some(Message::put("k", "v2")));
    }

    #[test]
    fn del_overwrites_put() {
        let t = table();
        t.insert(Message::put("k", "v1"));
        t.insert(Message::del("k"));
        assert_eq!(t.find(b"k"), Some(Message::del("k")));
    }

    #[test]
    fn iteration_is_key_ordered() {
        let t = table();
        for k in ["c", "a", "b"] {
            t.insert(Message::put(k, "x"));
        }
        let keys: Vec<Vec<u8>> = t.iter().map(|m| m.key().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn split_by_count_divides_and_removes() {
        let t = table();
        for k in ["a", "b", "c", "d"] {
            t.insert(Message::put(k, "x"));
        }
        let (upper, split_key) = t.split_by_count();
        assert_eq!(t.len() + upper.len(), 4);
        assert_eq!(split_key, upper.iter().next().unwrap().key().to_vec());
    }

    #[test]
    fn round_trip_serialize() {
        let t = table();
        t.insert(Message::put("a", "1"));
        t.insert(Message::del("b"));
        let mut buf = [0u8; 256];
        {
            let mut w = BlockWriter::new(&mut buf);
            t.serialize(&mut w);
            assert!(w.ok());
        }
        let mut r = BlockReader::new(&buf);
        let t2 = MessageTable::deserialize(&mut r, Arc::new(ByteComparator)).unwrap();
        assert_eq!(t2.len(), 2);
        assert_eq!(t2.find(b"a"), Some(Message::put("a", "1")));
        assert_eq!(t2.find(b"b"), Some(Message::del("b")));
    }
}
