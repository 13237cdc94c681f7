//! A thin wrapper over the kernel's io_uring ring, giving the rest of the
//! store a callback-based async read/write primitive plus a synchronous
//! wrapper built on top of it.
//!
//! Every `AsyncFile` owns exactly one ring and one reaper thread. The ring is
//! driven by the kernel; submission is safe to call from any thread, the
//! reaper is the only thread that ever dequeues completions and invokes
//! callbacks.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use fs4::fs_std::FileExt;
use io_uring::{opcode, squeue, types, IoUring};

use crate::PAGE_SIZE;

/// Minimum number of concurrent in-flight events the ring must support.
const MIN_RING_ENTRIES: u32 = 128;

/// How long the reaper blocks in one dequeue pass before re-checking the
/// shutdown flag.
const REAPER_TIMEOUT: Duration = Duration::from_millis(100);

/// A page-aligned, fixed-size owned buffer suitable for direct I/O.
pub struct AlignedBuf {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed buffer of exactly `len` bytes. `len` must already be
    /// a page multiple - callers round up before calling this (the table
    /// layer is responsible for page rounding per the on-disk format).
    pub fn new(len: usize) -> Self {
        assert_eq!(len % PAGE_SIZE, 0, "AlignedBuf length must be page-aligned");
        let layout = Layout::from_size_align(len.max(PAGE_SIZE), PAGE_SIZE).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "page-aligned allocation failed");
        Self { ptr, len, layout }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// Outcome of a single async I/O completion.
#[derive(Debug, Clone, Copy)]
pub struct IoStatus {
    pub succ: bool,
    pub bytes: usize,
}

type Callback = Box<dyn FnOnce(IoStatus, AlignedBuf) + Send>;

struct PendingOp {
    cb: Callback,
    buf: AlignedBuf,
    requested: usize,
    is_write: bool,
}

struct AioContext {
    ring: Mutex<IoUring>,
    pending: Mutex<HashMap<u64, PendingOp>>,
    next_id: AtomicU64,
}

impl AioContext {
    fn submit_op(
        self: &Arc<Self>,
        fd: RawFd,
        offset: u64,
        mut buf: AlignedBuf,
        is_write: bool,
        cb: Callback,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ptr = buf.as_mut_ptr();
        let len = buf.len() as u32;
        let requested = buf.len();

        let entry: squeue::Entry = if is_write {
            opcode::Write::new(types::Fd(fd), ptr, len)
                .offset(offset)
                .build()
                .user_data(id)
        } else {
            opcode::Read::new(types::Fd(fd), ptr, len)
                .offset(offset)
                .build()
                .user_data(id)
        };

        self.pending.lock().unwrap().insert(
            id,
            PendingOp { cb, buf, requested, is_write },
        );

        // Submission can return EAGAIN if the submission queue is full; back
        // off briefly and retry. Any other submission failure completes the
        // callback immediately with failure.
        loop {
            let mut ring = self.ring.lock().unwrap();
            let push_result = unsafe { ring.submission().push(&entry) };
            match push_result {
                Ok(()) => {
                    let submitted = ring.submit();
                    drop(ring);
                    if let Err(e) = submitted {
                        log::warn!("io_uring submit failed: {e}");
                        self.fail_pending(id);
                    }
                    return;
                }
                Err(_queue_full) => {
                    drop(ring);
                    std::thread::yield_now();
                    continue;
                }
            }
        }
    }

    /// Remove a pending op and invoke its callback with failure. Used when
    /// submission is acknowledged by the queue push but the kernel-facing
    /// `submit()` call itself fails, which otherwise would leave the op
    /// interned forever with no completion ever arriving for it.
    fn fail_pending(self: &Arc<Self>, id: u64) {
        if let Some(op) = self.pending.lock().unwrap().remove(&id) {
            (op.cb)(IoStatus { succ: false, bytes: 0 }, op.buf);
        }
    }

    fn reap_once(self: &Arc<Self>, timeout: Duration) {
        let completed: Vec<(u64, i32)> = {
            let mut ring = self.ring.lock().unwrap();
            let ts = types::Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = types::SubmitArgs::new().timespec(&ts);
            loop {
                match ring.submitter().submit_with_args(1, &args) {
                    Ok(_) => break,
                    Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                    Err(e) if e.raw_os_error() == Some(libc::ETIME) => break,
                    Err(_) => break,
                }
            }
            let cq = ring.completion();
            cq.map(|cqe| (cqe.user_data(), cqe.result())).collect()
        };

        if completed.is_empty() {
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        for (id, result) in completed {
            let Some(op) = pending.remove(&id) else { continue };
            let status = if result < 0 {
                log::warn!("async io completion failed: errno {result}");
                IoStatus { succ: false, bytes: 0 }
            } else {
                let bytes = result as usize;
                let short_write = op.is_write && bytes < op.requested;
                if short_write {
                    log::warn!(
                        "short write: requested {} wrote {}",
                        op.requested,
                        bytes
                    );
                }
                IoStatus { succ: !short_write, bytes }
            };
            (op.cb)(status, op.buf);
        }
    }
}

/// One-shot rendezvous used to turn the callback-based primitive into a
/// blocking call for `read_sync`/`write_sync`.
struct Waiter {
    lock: Mutex<Option<(IoStatus, AlignedBuf)>>,
    cond: Condvar,
}

impl Waiter {
    fn new() -> Arc<Self> {
        Arc::new(Self { lock: Mutex::new(None), cond: Condvar::new() })
    }

    fn wait(self: Arc<Self>) -> (IoStatus, AlignedBuf) {
        let mut guard = self.lock.lock().unwrap();
        while guard.is_none() {
            guard = self.cond.wait(guard).unwrap();
        }
        guard.take().unwrap()
    }
}

/// A single file opened for direct asynchronous I/O, with its own AIO ring
/// and reaper thread.
pub struct AsyncFile {
    file: File,
    ctx: Arc<AioContext>,
    shutdown: Arc<AtomicBool>,
    reaper: Option<JoinHandle<()>>,
}

impl AsyncFile {
    /// Open `path` with `O_RDWR | O_CREAT | O_DIRECT`, start the ring and
    /// spawn its reaper thread.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)?;

        // Advisory exclusive lock: two processes opening the same store file
        // for direct I/O would otherwise silently corrupt each other's
        // writes, since nothing else here serializes across processes.
        file.try_lock_exclusive().map_err(|_| {
            io::Error::new(io::ErrorKind::WouldBlock, "database file is already locked by another process")
        })?;

        let ring = IoUring::new(MIN_RING_ENTRIES)?;
        let ctx = Arc::new(AioContext {
            ring: Mutex::new(ring),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let reaper = {
            let ctx = ctx.clone();
            let shutdown = shutdown.clone();
            std::thread::Builder::new()
                .name("betree-aio-reaper".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        ctx.reap_once(REAPER_TIMEOUT);
                    }
                })?
        };

        Ok(Self { file, ctx, shutdown, reaper: Some(reaper) })
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Submit an async read. `cb` runs on the reaper thread once the I/O
    /// completes, receiving the completion status and the buffer back.
    pub fn async_read(&self, offset: u64, buf: AlignedBuf, cb: Callback) {
        self.ctx.submit_op(self.fd(), offset, buf, false, cb);
    }

    /// Submit an async write. See `async_read`.
    pub fn async_write(&self, offset: u64, buf: AlignedBuf, cb: Callback) {
        self.ctx.submit_op(self.fd(), offset, buf, true, cb);
    }

    /// Block the calling thread until a read completes.
    pub fn read_sync(&self, offset: u64, buf: AlignedBuf) -> (IoStatus, AlignedBuf) {
        let waiter = Waiter::new();
        let w = waiter.clone();
        self.async_read(
            offset,
            buf,
            Box::new(move |status, buf| {
                *w.lock.lock().unwrap() = Some((status, buf));
                w.cond.notify_one();
            }),
        );
        waiter.wait()
    }

    /// Block the calling thread until a write completes.
    pub fn write_sync(&self, offset: u64, buf: AlignedBuf) -> (IoStatus, AlignedBuf) {
        let waiter = Waiter::new();
        let w = waiter.clone();
        self.async_write(
            offset,
            buf,
            Box::new(move |status, buf| {
                *w.lock.lock().unwrap() = Some((status, buf));
                w.cond.notify_one();
            }),
        );
        waiter.wait()
    }

    /// Synchronously shrink or extend the file. Only ever used to shrink, per
    /// the table's checkpoint-time truncate.
    pub fn truncate(&self, offset: u64) -> io::Result<()> {
        self.file.set_len(offset)
    }

    /// Stop the reaper and drain the ring. Any operations still pending at
    /// this point are abandoned (the caller is expected to have already
    /// waited out its own in-flight writes, e.g. via `Table::flush`).
    pub fn close(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AsyncFile {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reaper.take() {
            let _ = handle.join();
        }
    }
}
