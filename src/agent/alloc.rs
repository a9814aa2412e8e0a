//! Allocation accounting for the process sampler.
//!
//! [`CountingAllocator`] wraps another global allocator and keeps running
//! totals in atomics. The agent binary installs it as the global allocator
//! and hands a reference to the process sampler.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time allocation totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    /// Bytes currently allocated
    pub live_bytes: u64,
    /// Bytes allocated since start, never decreasing
    pub total_bytes: u64,
    /// Allocations since start
    pub mallocs: u64,
    /// Deallocations since start
    pub frees: u64,
    /// Highest value `live_bytes` has reached
    pub peak_bytes: u64,
}

impl AllocStats {
    /// Allocations not yet freed
    pub fn live_objects(&self) -> u64 {
        self.mallocs.saturating_sub(self.frees)
    }
}

/// Anything that can report allocation totals.
pub trait AllocStatsSource: Send + Sync {
    /// Current totals
    fn alloc_stats(&self) -> AllocStats;
}

/// Source for processes that run without a counting allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAllocStats;

impl AllocStatsSource for NoAllocStats {
    fn alloc_stats(&self) -> AllocStats {
        AllocStats::default()
    }
}

/// Global allocator wrapper that counts bytes and calls.
#[derive(Debug)]
pub struct CountingAllocator<A> {
    inner: A,
    live: AtomicU64,
    total: AtomicU64,
    mallocs: AtomicU64,
    frees: AtomicU64,
    peak: AtomicU64,
}

impl<A> CountingAllocator<A> {
    /// Wrap `inner`; usable in a `static`.
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            live: AtomicU64::new(0),
            total: AtomicU64::new(0),
            mallocs: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    // Must not allocate: runs inside the allocator.
    fn record_alloc(&self, size: usize) {
        let size = size as u64;
        let live = self.live.fetch_add(size, Ordering::Relaxed) + size;
        self.total.fetch_add(size, Ordering::Relaxed);
        self.mallocs.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(live, Ordering::Relaxed);
    }

    fn record_free(&self, size: usize) {
        self.live.fetch_sub(size as u64, Ordering::Relaxed);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }
}

impl<A: Send + Sync> AllocStatsSource for CountingAllocator<A> {
    fn alloc_stats(&self) -> AllocStats {
        AllocStats {
            live_bytes: self.live.load(Ordering::Relaxed),
            total_bytes: self.total.load(Ordering::Relaxed),
            mallocs: self.mallocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            peak_bytes: self.peak.load(Ordering::Relaxed),
        }
    }
}

// SAFETY: every call is forwarded unchanged to `inner`; only counters are
// updated around it.
unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            self.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            self.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        self.record_free(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            self.record_free(layout.size());
            self.record_alloc(new_size);
        }
        new_ptr
    }
}
