//! Allocation statistics counters, gated behind the `stats` feature.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own spinlocks provide
//! the ordering guarantees for correctness; these counters are purely for
//! monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = tiermalloc::stats::snapshot();
//! println!("allocs: {}", snap.alloc_count);
//! ```

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    /// Total calls to alloc with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to dealloc with size > 0.
    pub dealloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to alloc.
    pub alloc_bytes: AtomicU64,

    /// Allocations served from the thread cache's local free list.
    pub thread_cache_hits: AtomicU64,
    /// Allocations that fell through to the central cache.
    pub thread_cache_misses: AtomicU64,
    /// Batches fetched from the central cache.
    pub central_cache_hits: AtomicU64,
    /// Huge allocations going directly to the page heap.
    pub page_heap_allocs: AtomicU64,

    /// Calls to `platform::page_alloc`.
    pub os_alloc_count: AtomicU64,
    /// Bytes requested from the OS via `platform::page_alloc`.
    pub os_alloc_bytes: AtomicU64,
    /// Times `carve_span` produced a remainder (i.e. a span was split).
    pub span_splits: AtomicU64,
    /// Times `coalesce_left` or `coalesce_right` merged two adjacent spans.
    pub span_coalesces: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            thread_cache_hits: AtomicU64::new(0),
            thread_cache_misses: AtomicU64::new(0),
            central_cache_hits: AtomicU64::new(0),
            page_heap_allocs: AtomicU64::new(0),
            os_alloc_count: AtomicU64::new(0),
            os_alloc_bytes: AtomicU64::new(0),
            span_splits: AtomicU64::new(0),
            span_coalesces: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// Increment a named counter by 1. Compiles away to nothing unless the
/// `stats` feature is on, so call sites never need their own `cfg`.
#[cfg(feature = "stats")]
macro_rules! stat_inc {
    ($field:ident) => {
        $crate::stats::STATS.$field.fetch_add(1, core::sync::atomic::Ordering::Relaxed)
    };
}
#[cfg(not(feature = "stats"))]
macro_rules! stat_inc {
    ($field:ident) => {
        ()
    };
}

/// Add `n` to a named counter. Compiles away to nothing unless the `stats`
/// feature is on.
#[cfg(feature = "stats")]
macro_rules! stat_add {
    ($field:ident, $n:expr) => {
        $crate::stats::STATS.$field.fetch_add($n, core::sync::atomic::Ordering::Relaxed)
    };
}
#[cfg(not(feature = "stats"))]
macro_rules! stat_add {
    ($field:ident, $n:expr) => {
        let _ = $n;
    };
}

pub(crate) use stat_add;
pub(crate) use stat_inc;

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between loads.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub alloc_bytes: u64,
    pub thread_cache_hits: u64,
    pub thread_cache_misses: u64,
    pub central_cache_hits: u64,
    pub page_heap_allocs: u64,
    pub os_alloc_count: u64,
    pub os_alloc_bytes: u64,
    pub span_splits: u64,
    pub span_coalesces: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        thread_cache_hits: s.thread_cache_hits.load(Ordering::Relaxed),
        thread_cache_misses: s.thread_cache_misses.load(Ordering::Relaxed),
        central_cache_hits: s.central_cache_hits.load(Ordering::Relaxed),
        page_heap_allocs: s.page_heap_allocs.load(Ordering::Relaxed),
        os_alloc_count: s.os_alloc_count.load(Ordering::Relaxed),
        os_alloc_bytes: s.os_alloc_bytes.load(Ordering::Relaxed),
        span_splits: s.span_splits.load(Ordering::Relaxed),
        span_coalesces: s.span_coalesces.load(Ordering::Relaxed),
    }
}
