//! An in-memory node cache with LRU-ish eviction and a background writeback
//! worker that drains dirty nodes to the table on a timer.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use betree_block::{Comparator, Nid};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::table::Table;

/// How often the writeback worker wakes up to look for expired dirty nodes
/// and to consider a checkpoint.
const WRITEBACK_TICK: Duration = Duration::from_millis(100);

/// Checkpoint interval: how long a completed header may go un-refreshed
/// before the worker forces `Table::flush_immediately`.
const CHECKPOINT_INTERVAL_SECS: u64 = 30;

/// Fraction of `cache_limited_memory` the writeback worker tries to drain in
/// one pass under normal (non-overloaded) conditions.
const WRITEBACK_BUDGET_DIVISOR: usize = 100;

/// Dirty-byte threshold (as a fraction of `cache_limited_memory`) past which
/// the writeback worker scales its per-tick budget up instead of trickling.
const DIRTY_PRESSURE_FRACTION: f64 = 0.3;

pub struct CacheOptions {
    pub cache_limited_memory: usize,
    pub cache_dirty_node_expire: u64,
}

/// A checked-out handle to a cached node. Decrements the node's logical
/// reference count on drop, mirroring the teacher's `ReadBlock`/`WriteAlloc`
/// drop-guard pattern so callers can't forget to release a node.
pub struct NodeRef {
    node: Arc<Node>,
}

impl Clone for NodeRef {
    fn clone(&self) -> Self {
        self.node.inc_ref();
        NodeRef { node: self.node.clone() }
    }
}

impl Deref for NodeRef {
    type Target = Node;
    fn deref(&self) -> &Node {
        &self.node
    }
}

impl Drop for NodeRef {
    fn drop(&mut self) {
        self.node.dec_ref();
    }
}

struct Shared {
    table: Arc<Table>,
    nodes: RwLock<HashMap<Nid, Arc<Node>>>,
    cache_size: Mutex<usize>,
    options: CacheOptions,
    clock: Arc<dyn Clock>,
    cmp: Arc<dyn Comparator>,
}

impl Shared {
    fn get(self: &Arc<Self>, nid: Nid) -> Result<NodeRef> {
        if let Some(node) = self.nodes.read().unwrap().get(&nid) {
            node.inc_ref();
            node.touch(self.clock.now_ts());
            return Ok(NodeRef { node: node.clone() });
        }

        self.maybe_evict();

        let block = self.table.read(nid).ok_or(Error::NodeCorruption(nid))?;
        let loaded = Arc::new(Node::deserialize(block.as_slice(), self.cmp.clone(), self.clock.now_ts())?);

        let mut nodes = self.nodes.write().unwrap();
        let node = nodes.entry(nid).or_insert(loaded).clone();
        node.inc_ref();
        node.touch(self.clock.now_ts());
        Ok(NodeRef { node })
    }

    fn insert_new(self: &Arc<Self>, nid: Nid, node: Arc<Node>) -> Result<NodeRef> {
        self.maybe_evict();
        let mut nodes = self.nodes.write().unwrap();
        if nodes.contains_key(&nid) {
            return Err(Error::Invariant("node id reused while still live"));
        }
        node.inc_ref();
        nodes.insert(nid, node.clone());
        Ok(NodeRef { node })
    }

    fn maybe_evict(self: &Arc<Self>) {
        let size: usize = {
            let nodes = self.nodes.read().unwrap();
            nodes.values().map(|n| n.size()).sum()
        };
        *self.cache_size.lock().unwrap() = size;
        if size <= self.options.cache_limited_memory {
            return;
        }
        self.evict_from_memory(size - self.options.cache_limited_memory);
    }

    fn evict_from_memory(self: &Arc<Self>, target_bytes: usize) {
        let mut nodes = self.nodes.write().unwrap();
        let mut candidates: Vec<(Nid, u64, usize)> = nodes
            .iter()
            .filter(|(_, n)| n.evictable())
            .map(|(nid, n)| (*nid, n.last_used_ts(), n.size()))
            .collect();
        candidates.sort_by_key(|(_, ts, _)| *ts);

        let mut freed = 0usize;
        for (nid, _, size) in candidates {
            if freed >= target_bytes {
                break;
            }
            nodes.remove(&nid);
            freed += size;
        }
    }

    /// One writeback pass: snapshot dirty-and-expired nodes, flush as many
    /// as the tick's budget allows (scaling the budget up under dirty-byte
    /// pressure), and checkpoint if the interval has elapsed.
    fn writeback_tick(self: &Arc<Self>, last_checkpoint_ts: &mut u64) {
        let now = self.clock.now_ts();
        let expire = self.options.cache_dirty_node_expire;

        let (expired, total_dirty_bytes) = {
            let nodes = self.nodes.read().unwrap();
            let mut expired: Vec<(Nid, u64, Arc<Node>)> = Vec::new();
            let mut total_dirty = 0usize;
            for (nid, node) in nodes.iter() {
                if node.is_dirty() {
                    total_dirty += node.size();
                    if !node.is_flushing() && now.saturating_sub(node.first_write_ts()) > expire * 2 {
                        expired.push((*nid, node.first_write_ts(), node.clone()));
                    }
                }
            }
            (expired, total_dirty)
        };

        let mut expired = expired;
        expired.sort_by_key(|(_, ts, _)| *ts);

        let base_budget = self.options.cache_limited_memory / WRITEBACK_BUDGET_DIVISOR;
        let pressure_threshold = (self.options.cache_limited_memory as f64 * DIRTY_PRESSURE_FRACTION) as usize;
        let budget = if total_dirty_bytes > pressure_threshold && pressure_threshold > 0 {
            ((base_budget as f64) * (total_dirty_bytes as f64 / pressure_threshold as f64)) as usize
        } else {
            base_budget
        };

        let mut spent = 0usize;
        for (nid, _, node) in expired {
            if spent >= budget.max(1) {
                break;
            }
            if !node.try_start_flush() {
                continue;
            }
            let bytes = node.serialize();
            spent += bytes.len();
            node.clear_dirty();
            let table = self.table.clone();
            let node_for_cb = node.clone();
            let padded = build_padded_block(bytes);
            table.async_write(nid, padded, move |ok| {
                node_for_cb.finish_flush(ok);
            });
        }

        if now.saturating_sub(*last_checkpoint_ts) > CHECKPOINT_INTERVAL_SECS {
            if let Err(e) = self.table.flush_immediately() {
                log::warn!("checkpoint failed: {e}");
            } else {
                *last_checkpoint_ts = now;
            }
        }
    }

    /// Synchronous full drain used at shutdown: flush every dirty node and
    /// wait for it to land before returning.
    fn flush_all(self: &Arc<Self>) -> Result<()> {
        let nodes = self.nodes.write().unwrap();
        for (nid, node) in nodes.iter() {
            if node.is_dirty() && node.try_start_flush() {
                let bytes = node.serialize();
                node.clear_dirty();
                let padded = build_padded_block(bytes);
                let result = self.table.write_now(*nid, padded);
                node.finish_flush(result.is_ok());
                result?;
            }
        }
        Ok(())
    }
}

fn build_padded_block(content: Vec<u8>) -> betree_block::Block {
    let padded_len = crate::page_round_up(content.len());
    let mut padded = vec![0u8; padded_len];
    padded[..content.len()].copy_from_slice(&content);
    betree_block::Block::new(padded.into(), 0, content.len())
}

pub struct Cache {
    shared: Arc<Shared>,
    shutdown: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    wake: Arc<(Mutex<bool>, Condvar)>,
}

impl Cache {
    pub fn new(table: Arc<Table>, options: CacheOptions, clock: Arc<dyn Clock>, cmp: Arc<dyn Comparator>) -> Arc<Cache> {
        let shared = Arc::new(Shared {
            table,
            nodes: RwLock::new(HashMap::new()),
            cache_size: Mutex::new(0),
            options,
            clock,
            cmp,
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let wake = Arc::new((Mutex::new(false), Condvar::new()));

        let worker = {
            let shared = shared.clone();
            let shutdown = shutdown.clone();
            let wake = wake.clone();
            std::thread::Builder::new()
                .name("betree-writeback".into())
                .spawn(move || {
                    let mut last_checkpoint_ts = shared.clock.now_ts();
                    let (lock, cvar) = &*wake;
                    while !shutdown.load(Ordering::Acquire) {
                        shared.writeback_tick(&mut last_checkpoint_ts);
                        let guard = lock.lock().unwrap();
                        let _ = cvar.wait_timeout(guard, WRITEBACK_TICK).unwrap();
                    }
                })
                .expect("failed to spawn writeback thread")
        };

        Arc::new(Cache { shared, shutdown, worker: Mutex::new(Some(worker)), wake })
    }

    pub fn get(&self, nid: Nid) -> Result<NodeRef> {
        self.shared.get(nid)
    }

    pub fn insert_new(&self, nid: Nid, node: Arc<Node>) -> Result<NodeRef> {
        self.shared.insert_new(nid, node)
    }

    pub fn size(&self) -> usize {
        *self.shared.cache_size.lock().unwrap()
    }

    /// Stop the writeback worker and synchronously drain every dirty node,
    /// then checkpoint and shrink the file.
    pub fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        {
            let (lock, cvar) = &*self.wake;
            let _guard = lock.lock().unwrap();
            cvar.notify_all();
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.flush_all()?;
        self.shared.table.flush()
    }
}
