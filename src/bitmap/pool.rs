//! Bitmap reuse pool with a byte budget and LRU eviction.
//!
//! Tiles come and go constantly while the viewport moves, and most of them
//! share a handful of shapes. Released bitmaps are parked here and handed back
//! out for the next decode of a compatible shape instead of reallocating.
//!
//! The pool is shared by the decode worker and the controller thread.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Bitmap, BitmapConfig};

/// Default pooled memory in megabytes.
pub const DEFAULT_MAX_MEMORY_MB: usize = 64;

/// Maximum pooled memory in megabytes.
pub(crate) const MAX_MEMORY_MB: usize = 1024;

/// Maximum number of parked bitmaps.
const DEFAULT_LRU_CAPACITY: usize = 256;

/// A parked bitmap is only reused when its allocation is at most this many
/// times larger than the request.
const MAX_REUSE_OVERSIZE: usize = 4;

/// Allocation and release contract for bitmaps.
///
/// Every bitmap obtained from `alloc` or `try_reuse` must eventually go back
/// through `free`; dropping it directly skews the outstanding count.
pub trait BitmapPool: Send + Sync {
    /// Allocate a fresh bitmap. Never hands out a pooled one.
    fn alloc(&self, width: u32, height: u32, config: BitmapConfig) -> Bitmap;

    /// Hand out a pooled bitmap reshaped to the request, if one fits.
    fn try_reuse(&self, width: u32, height: u32, config: BitmapConfig) -> Option<Bitmap>;

    /// Return a bitmap to the pool.
    fn free(&self, bitmap: Bitmap);

    /// Bitmaps handed out and not yet freed.
    fn outstanding(&self) -> usize;
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pooled_count: usize,
    pub pooled_bytes: usize,
    pub outstanding: usize,
    pub reuse_hits: usize,
    pub reuse_misses: usize,
}

struct PoolEntries {
    /// Parked bitmaps keyed by insertion id.
    entries: LruCache<u64, Bitmap>,
    /// Sum of allocation sizes of parked bitmaps.
    bytes: usize,
    next_id: u64,
}

/// Byte-budgeted LRU bitmap pool.
pub struct LruBitmapPool {
    max_bytes: usize,
    inner: Mutex<PoolEntries>,
    outstanding: AtomicUsize,
    reuse_hits: AtomicUsize,
    reuse_misses: AtomicUsize,
}

impl LruBitmapPool {
    /// Create a pool that parks at most `max_bytes` of pixel memory.
    pub fn new(max_bytes: usize) -> Self {
        debug!(max_bytes, "Initialized bitmap pool");
        Self {
            max_bytes,
            inner: Mutex::new(PoolEntries {
                entries: LruCache::new(
                    NonZeroUsize::new(DEFAULT_LRU_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
                bytes: 0,
                next_id: 0,
            }),
            outstanding: AtomicUsize::new(0),
            reuse_hits: AtomicUsize::new(0),
            reuse_misses: AtomicUsize::new(0),
        }
    }

    /// Create a pool with a budget in megabytes, clamped to a sane range.
    pub fn with_memory_mb(max_memory_mb: usize) -> Self {
        let mb = max_memory_mb.min(MAX_MEMORY_MB);
        Self::new(mb * 1024 * 1024)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            pooled_count: inner.entries.len(),
            pooled_bytes: inner.bytes,
            outstanding: self.outstanding.load(Ordering::Relaxed),
            reuse_hits: self.reuse_hits.load(Ordering::Relaxed),
            reuse_misses: self.reuse_misses.load(Ordering::Relaxed),
        }
    }

    /// Drop every parked bitmap.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
        debug!("Cleared bitmap pool");
    }

    fn release_one(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Evict parked bitmaps until `needed_bytes` more would fit.
    fn evict_if_needed(&self, inner: &mut PoolEntries, needed_bytes: usize) {
        while inner.bytes + needed_bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.allocation_bytes());
                    trace!(
                        evicted_bytes = evicted.allocation_bytes(),
                        pooled_bytes = inner.bytes,
                        "Evicted bitmap from pool"
                    );
                }
                None => break,
            }
        }
    }
}

impl Default for LruBitmapPool {
    fn default() -> Self {
        Self::with_memory_mb(DEFAULT_MAX_MEMORY_MB)
    }
}

impl BitmapPool for LruBitmapPool {
    fn alloc(&self, width: u32, height: u32, config: BitmapConfig) -> Bitmap {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Bitmap::new(width, height, config)
    }

    fn try_reuse(&self, width: u32, height: u32, config: BitmapConfig) -> Option<Bitmap> {
        let needed = config.byte_count(width, height);
        let mut inner = self.inner.lock();

        let key = inner
            .entries
            .iter()
            .find(|(_, b)| {
                let cap = b.allocation_bytes();
                cap >= needed && cap <= needed.saturating_mul(MAX_REUSE_OVERSIZE)
            })
            .map(|(k, _)| *k);

        let Some(key) = key else {
            self.reuse_misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut bitmap = inner.entries.pop(&key)?;
        inner.bytes = inner.bytes.saturating_sub(bitmap.allocation_bytes());
        drop(inner);

        if !bitmap.reconfigure(width, height, config) {
            // Unusable allocation; drop it rather than parking it again
            self.reuse_misses.fetch_add(1, Ordering::Relaxed);
            trace!(width, height, ?config, "Discarded pooled bitmap that could not be reshaped");
            return None;
        }
        self.reuse_hits.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        trace!(width, height, ?config, "Reused pooled bitmap");
        Some(bitmap)
    }

    fn free(&self, bitmap: Bitmap) {
        self.release_one();

        let bytes = bitmap.allocation_bytes();
        if bitmap.is_recycled() || bytes == 0 || bytes > self.max_bytes {
            return;
        }

        let mut inner = self.inner.lock();
        self.evict_if_needed(&mut inner, bytes);
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        if let Some((_, old)) = inner.entries.push(id, bitmap) {
            // Capacity eviction by the LRU itself
            inner.bytes = inner.bytes.saturating_sub(old.allocation_bytes());
        }
        inner.bytes += bytes;
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_then_reuse() {
        let pool = LruBitmapPool::new(1024 * 1024);
        let b = pool.alloc(32, 32, BitmapConfig::Rgba8888);
        assert_eq!(pool.outstanding(), 1);
        pool.free(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.stats().pooled_count, 1);

        let reused = pool.try_reuse(16, 32, BitmapConfig::Rgba8888).unwrap();
        assert_eq!(reused.width(), 16);
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(pool.stats().pooled_count, 0);
        assert_eq!(pool.stats().reuse_hits, 1);
    }

    #[test]
    fn test_reuse_rejects_too_small_and_far_too_large() {
        let pool = LruBitmapPool::new(16 * 1024 * 1024);
        let small = pool.alloc(8, 8, BitmapConfig::Rgba8888);
        pool.free(small);
        assert!(pool.try_reuse(64, 64, BitmapConfig::Rgba8888).is_none());

        let big = pool.alloc(512, 512, BitmapConfig::Rgba8888);
        pool.free(big);
        assert!(pool.try_reuse(16, 16, BitmapConfig::Rgba8888).is_none());
        assert_eq!(pool.stats().reuse_misses, 2);
    }

    #[test]
    fn test_budget_evicts_oldest() {
        // Room for two 32x32 RGBA bitmaps
        let pool = LruBitmapPool::new(2 * 32 * 32 * 4);
        for _ in 0..3 {
            let b = pool.alloc(32, 32, BitmapConfig::Rgba8888);
            pool.free(b);
        }
        let stats = pool.stats();
        assert_eq!(stats.pooled_count, 2);
        assert!(stats.pooled_bytes <= pool.max_bytes());
    }

    #[test]
    fn test_recycled_bitmaps_are_not_pooled() {
        let pool = LruBitmapPool::new(1024 * 1024);
        let mut b = pool.alloc(4, 4, BitmapConfig::Gray8);
        b.recycle();
        pool.free(b);
        assert_eq!(pool.stats().pooled_count, 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_failed_reshape_counts_as_miss() {
        let pool = LruBitmapPool::new(1024 * 1024);
        let mut parked = Bitmap::new(4, 4, BitmapConfig::Gray8);
        parked.recycle();
        {
            let mut inner = pool.inner.lock();
            inner.entries.push(99, parked);
        }

        assert!(pool.try_reuse(0, 0, BitmapConfig::Gray8).is_none());
        let stats = pool.stats();
        assert_eq!(stats.reuse_misses, 1);
        assert_eq!(stats.reuse_hits, 0);
        assert_eq!(stats.pooled_count, 0);
        assert_eq!(stats.pooled_bytes, 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let pool = std::sync::Arc::new(LruBitmapPool::new(4 * 1024 * 1024));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = std::sync::Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let b = pool
                            .try_reuse(16, 16, BitmapConfig::Rgba8888)
                            .unwrap_or_else(|| pool.alloc(16, 16, BitmapConfig::Rgba8888));
                        pool.free(b);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.outstanding(), 0);
    }
}
