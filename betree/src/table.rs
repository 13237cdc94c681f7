//! The storage backend: a free-space manager over a single direct-I/O file.
//!
//! `Table` serializes nodes into page-aligned blocks, maintains the
//! block-index header, and recycles space through the active/fly hole lists
//! described in the spec's data model.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use betree_block::{Block, BlockReader, BlockWriter, Nid, NID_NIL};

use crate::aio::{AlignedBuf, AsyncFile};
use crate::error::{Error, Result};
use crate::{page_round_up, PAGE_SIZE};

const BOOTSTRAP_SIZE: usize = PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    offset: u64,
    size: u32,
}

struct OffsetState {
    /// Next unused byte in the file - the high-water mark.
    offset: u64,
}

/// The committed superblock contents: where the block-index header lives
/// and which node is the current tree root.
#[derive(Debug, Clone, Copy)]
struct SuperBlock {
    header: Option<BlockHandle>,
    root_nid: Nid,
}

pub struct Table {
    file: AsyncFile,
    state: Mutex<OffsetState>,
    superblock: Mutex<SuperBlock>,
    block_index: Mutex<HashMap<Nid, BlockHandle>>,
    active_holes: Mutex<Vec<Hole>>,
    fly_holes: Mutex<VecDeque<Hole>>,
    inflight_writers: AtomicUsize,
}

impl Table {
    /// Open (or create) the backing file and load or initialize its
    /// superblock, block-index, and hole lists.
    pub fn open(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Arc<Table>> {
        let path = path.as_ref();
        let is_new = create_if_missing && !path.exists();
        let file = AsyncFile::open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                Error::Lock(e)
            } else {
                Error::Open(e)
            }
        })?;

        let table = if is_new {
            let table = Table {
                file,
                state: Mutex::new(OffsetState { offset: BOOTSTRAP_SIZE as u64 }),
                superblock: Mutex::new(SuperBlock { header: None, root_nid: NID_NIL }),
                block_index: Mutex::new(HashMap::new()),
                active_holes: Mutex::new(Vec::new()),
                fly_holes: Mutex::new(VecDeque::new()),
                inflight_writers: AtomicUsize::new(0),
            };
            table.write_superblock_sync()?;
            table
        } else {
            let buf = AlignedBuf::new(BOOTSTRAP_SIZE);
            let (status, buf) = table_file_read_sync(&file, 0, buf);
            if !status.succ {
                return Err(Error::MissingSuperBlock);
            }
            let superblock = decode_superblock(buf.as_slice())?;

            let mut table = Table {
                file,
                state: Mutex::new(OffsetState { offset: BOOTSTRAP_SIZE as u64 }),
                superblock: Mutex::new(superblock),
                block_index: Mutex::new(HashMap::new()),
                active_holes: Mutex::new(Vec::new()),
                fly_holes: Mutex::new(VecDeque::new()),
                inflight_writers: AtomicUsize::new(0),
            };
            table.load_index_and_holes(superblock)?;
            table
        };

        Ok(Arc::new(table))
    }

    fn write_superblock_sync(&self) -> Result<()> {
        let sb = *self.superblock.lock().unwrap();
        let mut buf = AlignedBuf::new(BOOTSTRAP_SIZE);
        encode_superblock(&sb, buf.as_mut_slice());
        let (status, _) = table_file_write_sync(&self.file, 0, buf);
        if !status.succ {
            return Err(Error::ShortWrite { requested: BOOTSTRAP_SIZE, wrote: status.bytes });
        }
        Ok(())
    }

    fn load_index_and_holes(&mut self, sb: SuperBlock) -> Result<()> {
        let mut regions: Vec<(u64, u32)> = Vec::new();

        if let Some(header) = sb.header {
            let aligned = page_round_up(header.size as usize);
            let buf = AlignedBuf::new(aligned);
            let (status, buf) = table_file_read_sync(&self.file, header.offset, buf);
            if !status.succ {
                return Err(Error::Corruption("failed to read block-index header"));
            }
            let mut r = BlockReader::new(&buf.as_slice()[..header.size as usize]);
            let count = r.read_u32();
            let mut index = self.block_index.lock().unwrap();
            for _ in 0..count {
                let nid = r.read_u64();
                let offset = r.read_u64();
                let size = r.read_u32();
                if !r.ok() {
                    return Err(Error::Corruption("truncated block-index entry"));
                }
                index.insert(nid, BlockHandle { offset, size });
                regions.push((offset, size));
            }
            if !r.ok() {
                return Err(Error::Corruption("truncated block-index header"));
            }
            regions.push((header.offset, header.size));
        }

        regions.sort_by_key(|(offset, _)| *offset);

        let mut holes = Vec::new();
        let mut cursor = BOOTSTRAP_SIZE as u64;
        for (offset, size) in &regions {
            if *offset > cursor {
                holes.push(Hole { offset: cursor, size: (*offset - cursor) as u32 });
            }
            cursor = cursor.max(*offset + page_round_up(*size as usize) as u64);
        }
        *self.active_holes.lock().unwrap() = holes;
        self.state.lock().unwrap().offset = cursor;
        Ok(())
    }

    pub fn root_nid(&self) -> Nid {
        self.superblock.lock().unwrap().root_nid
    }

    /// Highest node id present in the block-index, or 0 if the store is
    /// empty. Used to reseed the node id counter on open, since the
    /// superblock itself carries no separate counter field.
    pub fn max_nid(&self) -> Nid {
        self.block_index.lock().unwrap().keys().copied().max().unwrap_or(0)
    }

    pub fn set_root_nid(&self, nid: Nid) {
        self.superblock.lock().unwrap().root_nid = nid;
    }

    /// First-fit allocation from the active hole list, falling back to
    /// appending at the file's high-water mark.
    fn find_space(&self, size: u32) -> u64 {
        {
            let mut holes = self.active_holes.lock().unwrap();
            if let Some(pos) = holes.iter().position(|h| h.size >= size) {
                let hole = holes[pos];
                if hole.size == size {
                    holes.remove(pos);
                } else {
                    holes[pos] = Hole { offset: hole.offset + size as u64, size: hole.size - size };
                }
                return hole.offset;
            }
        }
        let mut state = self.state.lock().unwrap();
        let offset = state.offset;
        state.offset += size as u64;
        offset
    }

    fn add_hole(&self, offset: u64, size: u32) {
        let mut state = self.state.lock().unwrap();
        if offset + size as u64 == state.offset {
            state.offset = offset;
            // Shrinking the high-water mark may expose a hole that used to
            // abut it; merge with whatever is now the new tail.
            drop(state);
            let mut holes = self.active_holes.lock().unwrap();
            if let Some(last) = holes.last().copied() {
                if last.offset + last.size as u64 == offset {
                    holes.pop();
                    self.add_hole(last.offset, last.size);
                }
            }
            return;
        }
        drop(state);

        let mut holes = self.active_holes.lock().unwrap();
        let pos = holes.partition_point(|h| h.offset < offset);
        let mut new_hole = Hole { offset, size };

        if pos > 0 {
            let prev = holes[pos - 1];
            if prev.offset + prev.size as u64 == new_hole.offset {
                new_hole = Hole { offset: prev.offset, size: prev.size + new_hole.size };
                holes.remove(pos - 1);
                let pos = pos - 1;
                if pos < holes.len() {
                    let next = holes[pos];
                    if new_hole.offset + new_hole.size as u64 == next.offset {
                        new_hole = Hole { offset: new_hole.offset, size: new_hole.size + next.size };
                        holes.remove(pos);
                    }
                }
                holes.insert(pos, new_hole);
                return;
            }
        }
        if pos < holes.len() {
            let next = holes[pos];
            if new_hole.offset + new_hole.size as u64 == next.offset {
                new_hole = Hole { offset: new_hole.offset, size: new_hole.size + next.size };
                holes.remove(pos);
            }
        }
        holes.insert(pos, new_hole);
    }

    fn add_fly_hole(&self, offset: u64, size: u32) {
        self.fly_holes.lock().unwrap().push_back(Hole { offset, size });
    }

    fn flush_fly_holes(&self, n: usize) {
        let mut promoted = Vec::with_capacity(n);
        {
            let mut fly = self.fly_holes.lock().unwrap();
            for _ in 0..n.min(fly.len()) {
                if let Some(h) = fly.pop_front() {
                    promoted.push(h);
                }
            }
        }
        for h in promoted {
            self.add_hole(h.offset, h.size);
        }
    }

    /// Read a node's serialized block from disk.
    pub fn read(&self, nid: Nid) -> Option<Block> {
        let handle = *self.block_index.lock().unwrap().get(&nid)?;
        let aligned = page_round_up(handle.size as usize);
        let buf = AlignedBuf::new(aligned);
        let (status, buf) = table_file_read_sync(&self.file, handle.offset, buf);
        if !status.succ {
            log::warn!("read failed for node {nid} at offset {}", handle.offset);
            return None;
        }
        let data = buf.as_slice()[..handle.size as usize].to_vec();
        Some(Block::from_vec(data))
    }

    /// Submit an async write of a node's serialized block. `cb` fires once
    /// the write (and the resulting block-index update) completes.
    pub fn async_write(
        self: &Arc<Self>,
        nid: Nid,
        block: Block,
        cb: impl FnOnce(bool) + Send + 'static,
    ) {
        let buf_len = block.backing().len();
        debug_assert_eq!(buf_len, page_round_up(block.size()));
        let mut buf = AlignedBuf::new(buf_len);
        buf.as_mut_slice().copy_from_slice(block.backing());

        let offset = self.find_space(buf_len as u32);
        let size = block.size() as u32;
        self.inflight_writers.fetch_add(1, Ordering::SeqCst);

        let this = self.clone();
        self.file.async_write(
            offset,
            buf,
            Box::new(move |status, _buf| {
                this.inflight_writers.fetch_sub(1, Ordering::SeqCst);
                if status.succ {
                    let mut index = this.block_index.lock().unwrap();
                    let new_handle = BlockHandle { offset, size };
                    if let Some(old) = index.insert(nid, new_handle) {
                        this.add_fly_hole(old.offset, page_round_up(old.size as usize) as u32);
                    }
                    drop(index);
                    cb(true);
                } else {
                    this.add_hole(offset, buf_len as u32);
                    cb(false);
                }
            }),
        );
    }

    /// Write a node's block and block synchronously on the completion,
    /// for the shutdown-time drain where the caller needs durability before
    /// returning.
    pub fn write_now(self: &Arc<Self>, nid: Nid, block: Block) -> Result<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.async_write(nid, block, move |ok| {
            let _ = tx.send(ok);
        });
        match rx.recv() {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::ShortWrite { requested: 0, wrote: 0 }),
            Err(_) => Err(Error::Invariant("write completion channel dropped before firing")),
        }
    }

    /// Atomically rewrite the block-index header and the superblock,
    /// promoting fly-holes accumulated since the prior checkpoint.
    pub fn flush_immediately(&self) -> Result<()> {
        log::debug!("checkpoint starting");
        let n = self.fly_holes.lock().unwrap().len();

        let (serialized, old_header) = {
            let index = self.block_index.lock().unwrap();
            let mut plain = Vec::new();
            {
                let mut scratch = vec![0u8; 8 + index.len() * 20 + 64];
                let mut w = BlockWriter::new(&mut scratch);
                w.write_u32(index.len() as u32);
                for (nid, handle) in index.iter() {
                    w.write_u64(*nid);
                    w.write_u64(handle.offset);
                    w.write_u32(handle.size);
                }
                if !w.ok() {
                    return Err(Error::Invariant("block-index header encode overflow"));
                }
                let len = w.len();
                plain.extend_from_slice(&scratch[..len]);
            }
            (plain, self.superblock.lock().unwrap().header)
        };

        let aligned_len = page_round_up(serialized.len());
        let mut buf = AlignedBuf::new(aligned_len);
        buf.as_mut_slice()[..serialized.len()].copy_from_slice(&serialized);
        let new_offset = self.find_space(aligned_len as u32);

        let (status, _) = table_file_write_sync(&self.file, new_offset, buf);
        if !status.succ {
            self.add_hole(new_offset, aligned_len as u32);
            return Err(Error::ShortWrite { requested: aligned_len, wrote: status.bytes });
        }

        let new_handle = BlockHandle { offset: new_offset, size: serialized.len() as u32 };
        {
            let mut sb = self.superblock.lock().unwrap();
            sb.header = Some(new_handle);
        }
        self.write_superblock_sync()?;

        if let Some(old) = old_header {
            self.add_fly_hole(old.offset, page_round_up(old.size as usize) as u32);
        }
        self.flush_fly_holes(n);
        log::debug!("checkpoint complete, header at {new_offset}");
        Ok(())
    }

    /// Spin-wait for in-flight writers to drain, checkpoint, then shrink the
    /// file to the live high-water mark.
    pub fn flush(&self) -> Result<()> {
        while self.inflight_writers.load(Ordering::SeqCst) > 0 {
            std::thread::yield_now();
        }
        self.flush_immediately()?;
        let offset = self.state.lock().unwrap().offset;
        self.file.truncate(offset).map_err(Error::Io)?;
        Ok(())
    }
}

fn table_file_read_sync(file: &AsyncFile, offset: u64, buf: AlignedBuf) -> (crate::aio::IoStatus, AlignedBuf) {
    file.read_sync(offset, buf)
}

fn table_file_write_sync(file: &AsyncFile, offset: u64, buf: AlignedBuf) -> (crate::aio::IoStatus, AlignedBuf) {
    file.write_sync(offset, buf)
}

fn encode_superblock(sb: &SuperBlock, dst: &mut [u8]) {
    let mut w = BlockWriter::new(dst);
    w.write_bool(sb.header.is_some());
    if let Some(h) = sb.header {
        w.write_u64(h.offset);
        w.write_u32(h.size);
        w.write_u64(sb.root_nid);
    }
}

fn decode_superblock(src: &[u8]) -> Result<SuperBlock> {
    let mut r = BlockReader::new(src);
    let has_header = r.read_bool();
    if !has_header {
        return Ok(SuperBlock { header: None, root_nid: NID_NIL });
    }
    let offset = r.read_u64();
    let size = r.read_u32();
    let root_nid = r.read_u64();
    if !r.ok() {
        return Err(Error::Corruption("truncated superblock"));
    }
    Ok(SuperBlock { header: Some(BlockHandle { offset, size }), root_nid })
}
