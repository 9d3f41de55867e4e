//! Top-level allocator: ties all tiers together and implements `GlobalAlloc`.
//!
//! Static state lives here. `TieredAlloc` is zero-sized; all mutable state
//! sits in module-level statics guarded by spinlocks or atomics.
//!
//! Cache strategy (fastest to slowest):
//! - `std` feature: `std::thread_local!` front-end, with an on-drop guard
//!   that drains every size class back to the central cache at thread exit.
//! - neither: no thread-local state is available, so every request goes
//!   straight to the central cache (still correct, just always contends the
//!   bucket mutex).
//!
//! Per-CPU caching (rseq) and a nightly `#[thread_local]` fast path are
//! deliberately not carried over from the teacher crate: NUMA/per-core
//! awareness is an explicit Non-goal of this allocator (see DESIGN.md).

use crate::central_cache::CentralCache;
use crate::config::{MAX_BYTES, NUM_SIZE_CLASSES, PAGE_SHIFT, PAGE_SIZE};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::FreeObject;
use crate::stats::{stat_add, stat_inc};
use crate::sync::SpinMutex;
use crate::thread_cache::ThreadCache;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

pub(crate) static PAGE_MAP: PageMap = PageMap::new();
pub(crate) static PAGE_HEAP: SpinMutex<PageHeap> = SpinMutex::new(PageHeap::new(&PAGE_MAP));
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new();

/// Sentinel stored in `Span::size_class` for a span serving a huge (>256 KiB)
/// allocation, or for any span PageHeap hands out directly to a caller that
/// bypasses the size-class tiers. Real size classes occupy `0..NUM_SIZE_CLASSES`,
/// so this value can never collide with a genuine class index.
const HUGE_SENTINEL: usize = NUM_SIZE_CLASSES;

#[cfg(feature = "std")]
mod tls {
    //! Thread-local `ThreadCache` storage for the `std` feature.
    //!
    //! Wrapping the cell in a type with a `Drop` impl is what gives every
    //! thread's cached objects back to the central cache on thread exit —
    //! the spec requires that no memory leak there (see §5).
    use super::{CENTRAL_CACHE, PAGE_HEAP, PAGE_MAP};
    use crate::thread_cache::ThreadCache;
    use core::cell::UnsafeCell;

    pub(super) struct ThreadCacheCell {
        inner: UnsafeCell<ThreadCache>,
    }

    impl ThreadCacheCell {
        #[inline]
        pub(super) fn get(&self) -> *mut ThreadCache {
            self.inner.get()
        }
    }

    impl Drop for ThreadCacheCell {
        fn drop(&mut self) {
            unsafe { (*self.inner.get()).flush_and_destroy(&CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP) };
        }
    }

    std::thread_local! {
        pub(super) static TC_CELL: ThreadCacheCell = const {
            ThreadCacheCell { inner: UnsafeCell::new(ThreadCache::new()) }
        };
    }
}

/// A tcmalloc-style tiered allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tiermalloc::TieredAlloc = tiermalloc::TieredAlloc;
/// ```
pub struct TieredAlloc;

unsafe impl GlobalAlloc for TieredAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        if size == 0 {
            return layout.align() as *mut u8;
        }

        let align = layout.align();
        if align > PAGE_SIZE {
            // Over-page alignment is out of scope (Non-goal: aligned-new
            // surfaces beyond a size class's natural alignment).
            return ptr::null_mut();
        }

        if size <= MAX_BYTES {
            let effective = size.max(align);
            if effective <= MAX_BYTES {
                let cls = size_class::class_of(effective);
                let class_size = size_class::class_to_size(cls);
                if align <= size_class::alignment_of(class_size) {
                    stat_inc!(alloc_count);
                    stat_add!(alloc_bytes, size as u64);
                    return unsafe { self.alloc_small(cls) };
                }
            }
        }

        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);
        unsafe { self.alloc_huge(size) }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        unsafe { self.dealloc_ptr(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() && layout.size() > 0 {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    // `realloc` is intentionally not overridden: the default `GlobalAlloc`
    // method (allocate new, copy, free old) is used as-is. A custom
    // grow/shrink-in-place surface is out of scope (Non-goal).
}

impl TieredAlloc {
    cfg_if::cfg_if! {
        if #[cfg(feature = "std")] {
            #[inline(always)]
            unsafe fn alloc_small(&self, cls: usize) -> *mut u8 {
                match tls::TC_CELL.try_with(|cell| unsafe {
                    (*cell.get()).allocate(cls, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
                }) {
                    Ok(ptr) => ptr,
                    // TLS already torn down (late in process/thread shutdown).
                    Err(_) => unsafe { alloc_from_central(cls) },
                }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, cls: usize) {
                if tls::TC_CELL
                    .try_with(|cell| unsafe {
                        (*cell.get()).deallocate(ptr, cls, &CENTRAL_CACHE, &PAGE_HEAP, &PAGE_MAP)
                    })
                    .is_err()
                {
                    unsafe { dealloc_to_central(ptr, cls) };
                }
            }
        } else {
            #[inline(always)]
            unsafe fn alloc_small(&self, cls: usize) -> *mut u8 {
                unsafe { alloc_from_central(cls) }
            }

            #[inline(always)]
            unsafe fn dealloc_small(&self, ptr: *mut u8, cls: usize) {
                unsafe { dealloc_to_central(ptr, cls) };
            }
        }
    }

    /// Serve a request above `MAX_BYTES` directly from the page heap,
    /// bypassing the thread cache and central cache entirely.
    unsafe fn alloc_huge(&self, size: usize) -> *mut u8 {
        stat_inc!(page_heap_allocs);
        let pages = size.div_ceil(PAGE_SIZE);
        let span = unsafe { PAGE_HEAP.lock().new_span(pages) };
        if span.is_null() {
            return ptr::null_mut();
        }
        // PageHeap's own "huge" threshold (MaxSpanPages) is unrelated to the
        // size-class huge boundary: a span well under MaxSpanPages can still
        // back a >256 KiB request. Tag it so `dealloc` routes it back here
        // instead of mistaking it for a genuine small size class.
        unsafe {
            (*span).size_class = HUGE_SENTINEL;
            (*span).start_addr()
        }
    }

    /// Routes a pointer back to its owning span and, from there, to whichever
    /// tier actually owns it (huge direct-to-page-heap, or small via the
    /// thread/central cache path).
    unsafe fn dealloc_ptr(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        stat_inc!(dealloc_count);

        let page_id = (ptr as usize) >> PAGE_SHIFT;
        let span = PAGE_MAP.get(page_id);
        // Contract violation: the pointer doesn't map to any span owned by
        // this allocator (double free, or a foreign pointer). Fail fast in
        // debug builds; in release, silently ignore rather than corrupt
        // unrelated state.
        debug_assert!(!span.is_null(), "free of pointer not owned by this allocator");
        if span.is_null() {
            return;
        }

        let cls = unsafe { (*span).size_class };
        if cls == HUGE_SENTINEL {
            unsafe { PAGE_HEAP.lock().release_span(span) };
        } else {
            unsafe { self.dealloc_small(ptr, cls) };
        }
    }
}

/// Fallback when no thread-local cache is available: hand the bucket mutex
/// one object at a time.
unsafe fn alloc_from_central(cls: usize) -> *mut u8 {
    stat_inc!(thread_cache_misses);
    let (count, head) = unsafe { CENTRAL_CACHE.fetch_range(cls, 1, &PAGE_HEAP, &PAGE_MAP) };
    if count == 0 || head.is_null() {
        ptr::null_mut()
    } else {
        head as *mut u8
    }
}

unsafe fn dealloc_to_central(ptr: *mut u8, cls: usize) {
    let obj = ptr as *mut FreeObject;
    unsafe { (*obj).next = ptr::null_mut() };
    unsafe { CENTRAL_CACHE.release_list(cls, obj, 1, &PAGE_HEAP, &PAGE_MAP) };
}

/// Allocate `size` bytes. Returns null for `size == 0` or on OS allocation
/// failure. For sizes above `MAX_BYTES` this returns a fresh page-aligned
/// "huge" span straight from the page heap; otherwise the pointer is
/// aligned to at least its size class's natural alignment.
pub fn alloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    if size > MAX_BYTES {
        stat_inc!(alloc_count);
        stat_add!(alloc_bytes, size as u64);
        return unsafe { TieredAlloc.alloc_huge(size) };
    }

    let cls = size_class::class_of(size);
    stat_inc!(alloc_count);
    stat_add!(alloc_bytes, size as u64);
    unsafe { TieredAlloc.alloc_small(cls) }
}

/// Free a pointer previously returned by [`alloc`]. Tolerates null.
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by [`alloc`] (or by
/// `TieredAlloc` as a `GlobalAlloc`) that has not already been freed.
pub unsafe fn free(ptr: *mut u8) {
    unsafe { TieredAlloc.dealloc_ptr(ptr) };
}

/// Fallible wrapper around [`alloc`], for test harnesses that want to
/// distinguish "the request was malformed" from "the OS is out of memory"
/// instead of a bare null. Not part of the allocator's public failure
/// contract (`alloc`/`free` stay infallible-looking by design); this exists
/// purely so OOM-path tests can assert on a specific [`AllocError`] variant.
#[cfg(feature = "testing")]
pub fn try_alloc(size: usize) -> Result<core::ptr::NonNull<u8>, crate::error::AllocError> {
    if size == 0 {
        return Err(crate::error::AllocError::InvalidArgument);
    }
    core::ptr::NonNull::new(alloc(size)).ok_or(crate::error::AllocError::OutOfMemory)
}
