//! Page heap: the bottom tier, managing spans of contiguous pages.
//!
//! Free spans of up to `MAX_SPAN_PAGES - 1` pages are cached in per-page-count
//! free lists and coalesced with their neighbors on release. Spans at or
//! above `MAX_SPAN_PAGES` pages are "huge": they bypass the free lists
//! entirely, mapped on demand and unmapped immediately on release. Caching a
//! huge span would mean holding arbitrarily large chunks of address space
//! idle on the chance of a similarly-huge follow-up request; the original
//! this crate is modeled on unmaps them unconditionally instead, and this
//! crate does the same.

use crate::config::{MAX_SPAN_PAGES, NUM_SIZE_CLASSES, PAGE_SHIFT, PAGE_SIZE};
use crate::pagemap::PageMap;
use crate::platform;
use crate::span::{ObjectPool, Span, SpanList, SpanState};
use crate::stats::{stat_add, stat_inc};
use core::ptr;

/// Largest page count still served from the free lists.
const CACHEABLE_MAX: usize = MAX_SPAN_PAGES - 1;

pub struct PageHeap {
    /// `free_lists[k]` holds free spans of exactly `k` pages; index 0 unused.
    free_lists: [SpanList; MAX_SPAN_PAGES],
    pagemap: &'static PageMap,
    span_pool: ObjectPool,
}

// SAFETY: PageHeap is only ever accessed through a SpinMutex; the raw
// pointers it holds point into OS-allocated memory that outlives any thread.
unsafe impl Send for PageHeap {}

impl PageHeap {
    pub const fn new(pagemap: &'static PageMap) -> Self {
        Self {
            free_lists: [const { SpanList::new() }; MAX_SPAN_PAGES],
            pagemap,
            span_pool: ObjectPool::new(),
        }
    }

    /// Allocate a span of exactly `num_pages` pages. Returns null on OS
    /// allocation failure.
    ///
    /// # Safety
    ///
    /// Caller must hold exclusive access (the enclosing `SpinMutex`).
    pub unsafe fn new_span(&mut self, num_pages: usize) -> *mut Span {
        assert!(num_pages > 0);

        if num_pages > CACHEABLE_MAX {
            return unsafe { self.new_huge_span(num_pages) };
        }

        loop {
            for n in num_pages..=CACHEABLE_MAX {
                if !self.free_lists[n].is_empty() {
                    let s = unsafe { self.free_lists[n].pop() };
                    return unsafe { self.carve_span(s, num_pages) };
                }
            }

            if !unsafe { self.grow_heap() } {
                return ptr::null_mut();
            }
            // Loop back around and retry the search; the fresh span just
            // pushed into free_lists[CACHEABLE_MAX] will satisfy it.
        }
    }

    /// Release a span back to the heap. Huge spans are unmapped immediately;
    /// cacheable spans are coalesced with free neighbors and cached.
    ///
    /// # Safety
    ///
    /// `span` must be a valid, in-use span previously returned by `new_span`.
    pub unsafe fn release_span(&mut self, span: *mut Span) {
        let num_pages = unsafe { (*span).num_pages };

        if num_pages > CACHEABLE_MAX {
            unsafe {
                self.pagemap.unregister_span(span);
                platform::page_dealloc((*span).start_addr(), (*span).byte_size());
                self.span_pool.dealloc(span);
            }
            return;
        }

        unsafe {
            (*span).state = SpanState::Free;
            (*span).size_class = 0;
            (*span).freelist = ptr::null_mut();
            (*span).allocated_count = 0;
            (*span).total_count = 0;
        }

        let span = unsafe { self.coalesce_left(span) };
        let span = unsafe { self.coalesce_right(span) };

        // Coalescing may have absorbed a neighbor whose own old boundary
        // page is now interior to the merged span, and that stale entry
        // would otherwise keep pointing at span metadata `coalesce_left`/
        // `coalesce_right` already recycled back into the object pool.
        // Null the whole merged range first, then re-register only the
        // two boundaries that must stay mapped for future coalescing.
        unsafe { self.pagemap.unregister_span(span) };
        unsafe { self.pagemap.register_span_endpoints(span) };
        unsafe { self.free_lists[(*span).num_pages].push(span) };
    }

    /// Split a span: keep the first `num_pages` pages, return the remainder
    /// (if any) to the free lists.
    unsafe fn carve_span(&mut self, span: *mut Span, num_pages: usize) -> *mut Span {
        let total = unsafe { (*span).num_pages };
        assert!(total >= num_pages);

        if total > num_pages {
            stat_inc!(span_splits);
            let remainder = self.span_pool.alloc();
            if remainder.is_null() {
                // Can't allocate span metadata for the remainder; hand over
                // the whole span rather than leak the tail permanently.
                unsafe {
                    (*span).state = SpanState::InUse;
                    self.pagemap.register_span(span);
                }
                return span;
            }

            unsafe {
                (*remainder).start_page = (*span).start_page + num_pages;
                (*remainder).num_pages = total - num_pages;
                (*remainder).state = SpanState::Free;

                (*span).num_pages = num_pages;

                self.pagemap.register_span_endpoints(remainder);
                self.free_lists[(*remainder).num_pages].push(remainder);
            }
        }

        unsafe {
            (*span).state = SpanState::InUse;
            self.pagemap.register_span(span);
        }

        span
    }

    /// Map `CACHEABLE_MAX` fresh pages from the OS and push them as one free
    /// span. A loop in the caller re-searches the free lists afterward,
    /// standing in for the original's `NewSpan` self-recursion with bounded
    /// stack depth.
    unsafe fn grow_heap(&mut self) -> bool {
        let alloc_size = CACHEABLE_MAX * PAGE_SIZE;
        let ptr = unsafe { platform::page_alloc(alloc_size) };
        if ptr.is_null() {
            return false;
        }
        stat_inc!(os_alloc_count);
        stat_add!(os_alloc_bytes, alloc_size as u64);

        let s = self.span_pool.alloc();
        if s.is_null() {
            unsafe { platform::page_dealloc(ptr, alloc_size) };
            return false;
        }

        let start_page = (ptr as usize) >> PAGE_SHIFT;
        unsafe {
            (*s).start_page = start_page;
            (*s).num_pages = CACHEABLE_MAX;
            (*s).state = SpanState::Free;
            self.pagemap.register_span_endpoints(s);
            self.free_lists[CACHEABLE_MAX].push(s);
        }
        true
    }

    /// Map exactly `num_pages` pages for a huge (non-cacheable) request.
    unsafe fn new_huge_span(&mut self, num_pages: usize) -> *mut Span {
        let alloc_size = num_pages * PAGE_SIZE;
        let ptr = unsafe { platform::page_alloc(alloc_size) };
        if ptr.is_null() {
            return ptr::null_mut();
        }
        stat_inc!(os_alloc_count);
        stat_add!(os_alloc_bytes, alloc_size as u64);
        stat_inc!(page_heap_allocs);

        let s = self.span_pool.alloc();
        if s.is_null() {
            unsafe { platform::page_dealloc(ptr, alloc_size) };
            return ptr::null_mut();
        }

        let start_page = (ptr as usize) >> PAGE_SHIFT;
        unsafe {
            (*s).start_page = start_page;
            (*s).num_pages = num_pages;
            (*s).state = SpanState::InUse;
            // NUM_SIZE_CLASSES is one past the last valid bucket index: a
            // sentinel marking "huge allocation, no size class" so dealloc
            // can tell it apart from a genuine class-0 (8 byte) span.
            (*s).size_class = NUM_SIZE_CLASSES;
            self.pagemap.register_span(s);
        }
        s
    }

    /// Merge with the free span immediately before `span`, if doing so would
    /// not exceed `CACHEABLE_MAX` pages.
    unsafe fn coalesce_left(&mut self, span: *mut Span) -> *mut Span {
        let start = unsafe { (*span).start_page };
        if start == 0 {
            return span;
        }

        let left = self.pagemap.get(start - 1);
        if left.is_null() {
            return span;
        }

        unsafe {
            if (*left).state != SpanState::Free {
                return span;
            }
            if (*left).start_page + (*left).num_pages != start {
                return span;
            }
            if (*left).num_pages + (*span).num_pages > CACHEABLE_MAX {
                return span;
            }

            self.free_lists[(*left).num_pages].remove(left);
            (*left).num_pages += (*span).num_pages;
            self.span_pool.dealloc(span);
            stat_inc!(span_coalesces);

            left
        }
    }

    /// Merge with the free span immediately after `span`, if doing so would
    /// not exceed `CACHEABLE_MAX` pages.
    unsafe fn coalesce_right(&mut self, span: *mut Span) -> *mut Span {
        let end_page = unsafe { (*span).end_page() };

        let right = self.pagemap.get(end_page);
        if right.is_null() {
            return span;
        }

        unsafe {
            if (*right).state != SpanState::Free {
                return span;
            }
            if (*right).start_page != end_page {
                return span;
            }
            if (*span).num_pages + (*right).num_pages > CACHEABLE_MAX {
                return span;
            }

            self.free_lists[(*right).num_pages].remove(right);
            (*span).num_pages += (*right).num_pages;
            self.span_pool.dealloc(right);
            stat_inc!(span_coalesces);

            span
        }
    }
}
