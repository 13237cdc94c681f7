use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Injected time source for the cache's `last_used_ts`/`first_write_ts`
/// bookkeeping and the table's checkpoint interval. Kept as a trait (rather
/// than calling `SystemTime::now()` inline) so eviction/writeback timing
/// tests can drive time deterministically instead of sleeping.
pub trait Clock: Send + Sync {
    /// Current time, in seconds, from an arbitrary but monotonic-for-this-run
    /// epoch.
    fn now_ts(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ts(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// A manually-advanced clock for tests exercising eviction/writeback
/// expiry thresholds without sleeping.
#[derive(Debug, Default)]
pub struct TestClock(AtomicU64);

impl TestClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ts(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}
