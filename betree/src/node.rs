//! A single pivot-indexed node: its pivots, each with a per-child message
//! buffer, plus the bookkeeping the cache needs to decide what to evict and
//! what to flush.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use betree_block::{BlockReader, BlockWriter, Comparator, Message, MessageTable, Nid, NID_NIL};

use crate::error::{Error, Result};

/// A partition point: the half-open key range `[left_most_key, next.left_most_key)`
/// (or `(-inf, next.left_most_key)` for the first pivot), its pending message
/// buffer, and the child subtree holding it (`NID_NIL` in a leaf).
pub struct Pivot {
    pub left_most_key: Option<Vec<u8>>,
    pub table: MessageTable,
    pub child_nid: Nid,
}

impl Pivot {
    fn new_empty(left_most_key: Option<Vec<u8>>, child_nid: Nid, cmp: Arc<dyn Comparator>) -> Self {
        Self { left_most_key, table: MessageTable::new(cmp), child_nid }
    }
}

pub(crate) struct NodeInner {
    pub is_leaf: bool,
    pub pivots: Vec<Pivot>,
}

struct NodeFlags {
    refcnt: usize,
    dirty: bool,
    flushing: bool,
    first_write_ts: u64,
    last_used_ts: u64,
}

pub struct Node {
    nid: Nid,
    cmp: Arc<dyn Comparator>,
    inner: RwLock<NodeInner>,
    flags: std::sync::Mutex<NodeFlags>,
}

/// Routing logic shared between `Node::find_pivot` and callers (like
/// push-down's merge sweep) that already hold the node's lock and so must
/// not re-enter it.
pub fn find_pivot_in(pivots: &[Pivot], cmp: &dyn Comparator, key: &[u8]) -> usize {
    let mut idx = 0;
    for (i, pivot) in pivots.iter().enumerate().skip(1) {
        match &pivot.left_most_key {
            Some(k) if cmp.compare(k, key) != std::cmp::Ordering::Greater => idx = i,
            _ => break,
        }
    }
    idx
}

impl Node {
    /// A brand-new node with a single empty pivot covering every key.
    pub fn new(nid: Nid, is_leaf: bool, cmp: Arc<dyn Comparator>, now_ts: u64) -> Self {
        let pivot = Pivot::new_empty(None, NID_NIL, cmp.clone());
        Self {
            nid,
            cmp,
            inner: RwLock::new(NodeInner { is_leaf, pivots: vec![pivot] }),
            flags: std::sync::Mutex::new(NodeFlags {
                refcnt: 0,
                dirty: false,
                flushing: false,
                first_write_ts: 0,
                last_used_ts: now_ts,
            }),
        }
    }

    pub fn nid(&self) -> Nid {
        self.nid
    }

    pub fn read(&self) -> RwLockReadGuard<'_, NodeInner> {
        self.inner.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, NodeInner> {
        self.inner.write().unwrap()
    }

    pub fn is_leaf(&self) -> bool {
        self.read().is_leaf
    }

    pub fn pivot_count(&self) -> usize {
        self.read().pivots.len()
    }

    /// Linear scan over `pivots[1..]`, returning the last index whose
    /// `left_most_key <= key`.
    pub fn find_pivot(&self, key: &[u8]) -> usize {
        find_pivot_in(&self.read().pivots, self.cmp.as_ref(), key)
    }

    pub fn pivot_child(&self, idx: usize) -> Nid {
        self.read().pivots[idx].child_nid
    }

    /// First pivot index whose table exceeds `max_msg_count`, if any.
    pub fn find_overflowing_pivot(&self, max_msg_count: usize) -> Option<usize> {
        let inner = self.read();
        inner.pivots.iter().position(|p| p.table.len() > max_msg_count)
    }

    /// Insert directly into the pivot covering `key`, marking the node
    /// dirty. Used both by the root's top-level write and by push-down's
    /// merge sweep.
    pub fn insert_into_pivot(&self, key: &[u8], msg: Message, now_ts: u64) {
        let idx = self.find_pivot(key);
        {
            let inner = self.read();
            inner.pivots[idx].table.insert(msg);
        }
        self.mark_dirty(now_ts);
    }

    /// Look up `key` in this node's own pivot buffer, returning `Some` with
    /// the shadowing message's value (`None` for a `Del`) if one is pending
    /// here, regardless of what lies beneath. Newer-wins: callers must not
    /// descend into the child subtree if this returns `Some`.
    pub fn find_own(&self, key: &[u8]) -> Option<Message> {
        let idx = self.find_pivot(key);
        let inner = self.read();
        inner.pivots[idx].table.find(key)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.lock().unwrap().dirty
    }

    pub fn is_flushing(&self) -> bool {
        self.flags.lock().unwrap().flushing
    }

    pub fn refcnt(&self) -> usize {
        self.flags.lock().unwrap().refcnt
    }

    pub fn last_used_ts(&self) -> u64 {
        self.flags.lock().unwrap().last_used_ts
    }

    pub fn first_write_ts(&self) -> u64 {
        self.flags.lock().unwrap().first_write_ts
    }

    pub fn inc_ref(&self) {
        self.flags.lock().unwrap().refcnt += 1;
    }

    pub fn dec_ref(&self) {
        let mut f = self.flags.lock().unwrap();
        debug_assert!(f.refcnt > 0);
        f.refcnt -= 1;
    }

    pub fn touch(&self, now_ts: u64) {
        self.flags.lock().unwrap().last_used_ts = now_ts;
    }

    pub fn mark_dirty(&self, now_ts: u64) {
        let mut f = self.flags.lock().unwrap();
        if !f.dirty {
            f.dirty = true;
            f.first_write_ts = now_ts;
        }
    }

    pub fn clear_dirty(&self) {
        self.flags.lock().unwrap().dirty = false;
    }

    pub fn try_start_flush(&self) -> bool {
        let mut f = self.flags.lock().unwrap();
        if !f.dirty || f.flushing {
            return false;
        }
        f.flushing = true;
        true
    }

    pub fn finish_flush(&self, succeeded: bool) {
        let mut f = self.flags.lock().unwrap();
        f.flushing = false;
        if !succeeded {
            // Writeback failed: leave it dirty so the next pass retries.
            f.dirty = true;
        }
    }

    /// Evictable only once nothing references it and there is no pending or
    /// in-flight write.
    pub fn evictable(&self) -> bool {
        let f = self.flags.lock().unwrap();
        f.refcnt == 0 && !f.dirty && !f.flushing
    }

    /// Approximate in-memory footprint: sum of every pivot's message table
    /// plus a small fixed overhead per pivot for its key and child pointer.
    pub fn size(&self) -> usize {
        const PIVOT_OVERHEAD: usize = 24;
        let inner = self.read();
        inner
            .pivots
            .iter()
            .map(|p| {
                PIVOT_OVERHEAD
                    + p.left_most_key.as_ref().map(|k| k.len()).unwrap_or(0)
                    + p.table.size()
            })
            .sum()
    }

    /// Exact serialized size, computed without actually writing bytes, so
    /// the caller can allocate a correctly-sized buffer up front. Includes
    /// the trailing checksum.
    pub fn write_back_size(&self) -> usize {
        let inner = self.read();
        let mut size = 8 + 1 + 4; // self_nid, is_leaf, pivot_count
        for pivot in &inner.pivots {
            size += 8; // child_nid
            size += 4 + pivot.left_most_key.as_ref().map(|k| k.len()).unwrap_or(0);
            size += 4; // table_msg_count
            for msg in pivot.table.iter() {
                size += 1; // kind
                size += 4 + msg.key().len();
                if let Some(v) = msg.value() {
                    size += 4 + v.len();
                }
            }
        }
        size + 8 // xxh3 checksum trailer
    }

    pub fn serialize(&self) -> Vec<u8> {
        let size = self.write_back_size();
        let mut buf = vec![0u8; size];
        let content_len = size - 8;
        {
            let mut w = BlockWriter::new(&mut buf[..content_len]);
            let inner = self.read();
            w.write_u64(self.nid);
            w.write_bool(inner.is_leaf);
            w.write_u32(inner.pivots.len() as u32);
            for pivot in &inner.pivots {
                w.write_u64(pivot.child_nid);
                w.write_bytes(pivot.left_most_key.as_deref().unwrap_or(&[]));
                pivot.table.serialize(&mut w);
            }
            debug_assert!(w.ok(), "write_back_size under-estimated the node's footprint");
        }
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[..content_len]);
        buf[content_len..].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8], cmp: Arc<dyn Comparator>, now_ts: u64) -> Result<Node> {
        if data.len() < 8 {
            return Err(Error::Corruption("node block shorter than its checksum trailer"));
        }
        let content_len = data.len() - 8;
        let want = u64::from_le_bytes(data[content_len..].try_into().unwrap());
        let got = xxhash_rust::xxh3::xxh3_64(&data[..content_len]);
        if want != got {
            return Err(Error::Corruption("node checksum mismatch"));
        }

        let mut r = BlockReader::new(&data[..content_len]);
        let nid = r.read_u64();
        let is_leaf = r.read_bool();
        let pivot_count = r.read_u32();
        let mut pivots = Vec::with_capacity(pivot_count as usize);
        for i in 0..pivot_count {
            let child_nid = r.read_u64();
            let key_bytes = r.read_bytes();
            let left_most_key = if i == 0 { None } else { Some(key_bytes) };
            let table = MessageTable::deserialize(&mut r, cmp.clone())
                .map_err(|_| Error::NodeCorruption(nid))?;
            pivots.push(Pivot { left_most_key, table, child_nid });
        }
        if !r.ok() {
            return Err(Error::NodeCorruption(nid));
        }
        let node = Node {
            nid,
            cmp,
            inner: RwLock::new(NodeInner { is_leaf, pivots }),
            flags: std::sync::Mutex::new(NodeFlags {
                refcnt: 0,
                dirty: false,
                flushing: false,
                first_write_ts: 0,
                last_used_ts: now_ts,
            }),
        };
        // Loaded nodes are marked dirty so any in-place mutation made before
        // the next eviction gets flushed rather than silently discarded.
        node.mark_dirty(now_ts);
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use betree_block::ByteComparator;

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(ByteComparator)
    }

    #[test]
    fn fresh_node_has_one_pivot_no_child() {
        let n = Node::new(1, true, cmp(), 0);
        assert_eq!(n.pivot_count(), 1);
        assert_eq!(n.pivot_child(0), NID_NIL);
    }

    #[test]
    fn find_pivot_routes_to_last_covering_pivot() {
        let n = Node::new(1, true, cmp(), 0);
        {
            let mut inner = n.write();
            inner.pivots.push(Pivot { left_most_key: Some(b"m".to_vec()), table: MessageTable::new(cmp()), child_nid: NID_NIL });
            inner.pivots.push(Pivot { left_most_key: Some(b"t".to_vec()), table: MessageTable::new(cmp()), child_nid: NID_NIL });
        }
        assert_eq!(n.find_pivot(b"a"), 0);
        assert_eq!(n.find_pivot(b"m"), 1);
        assert_eq!(n.find_pivot(b"q"), 1);
        assert_eq!(n.find_pivot(b"z"), 2);
    }

    #[test]
    fn serialize_round_trips() {
        let n = Node::new(5, true, cmp(), 0);
        n.insert_into_pivot(b"a", Message::put("a", "1"), 1);
        n.insert_into_pivot(b"b", Message::del("b"), 1);
        let bytes = n.serialize();
        let n2 = Node::deserialize(&bytes, cmp(), 2).unwrap();
        assert_eq!(n2.nid(), 5);
        assert!(n2.is_leaf());
        assert_eq!(n2.find_own(b"a"), Some(Message::put("a", "1")));
        assert_eq!(n2.find_own(b"b"), Some(Message::del("b")));
    }
}
