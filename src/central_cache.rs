//! Central cache: the middle tier, one free list of objects per size class.
//!
//! Each size class gets its own `SpinMutex<CentralFreeList>` (fine-grained
//! locking across classes). A thread cache fetches and returns whole batches
//! here; when a class runs dry, a fresh span is pulled from the page heap
//! and carved into objects.
//!
//! Fetching or releasing a batch can require a trip to the page heap (to
//! populate a fresh span, or to hand an emptied span back). That trip
//! releases this class's bucket lock first and reacquires it afterward —
//! `BucketMutex` and `PageHeapMutex` are never held at the same time by the
//! same thread. This keeps the two locks' acquisition order acyclic: a
//! thread blocked on `PageHeapMutex` is never also holding a `BucketMutex`
//! another thread might be waiting on.

use crate::config::{NUM_SIZE_CLASSES, PAGE_SHIFT, PAGE_SIZE};
use crate::page_heap::PageHeap;
use crate::pagemap::PageMap;
use crate::size_class;
use crate::span::{FreeObject, Span, SpanList, SpanState};
use crate::stats::stat_inc;
use crate::sync::SpinMutex;
use core::ptr;

/// Free list of objects for a single size class.
pub struct CentralFreeList {
    size_class: usize,
    /// Spans with at least one free object.
    nonempty_spans: SpanList,
    num_free: usize,
}

// SAFETY: only ever accessed through the enclosing SpinMutex.
unsafe impl Send for CentralFreeList {}

impl CentralFreeList {
    pub const fn new(size_class: usize) -> Self {
        Self {
            size_class,
            nonempty_spans: SpanList::new(),
            num_free: 0,
        }
    }

    /// Carve a span fresh out of the page heap into this class's objects
    /// and push it onto the nonempty list.
    unsafe fn inject_span(&mut self, span: *mut Span, pagemap: &PageMap) {
        let info = size_class::class_info(self.size_class);
        let obj_size = info.size;

        unsafe {
            (*span).size_class = self.size_class;
            (*span).state = SpanState::InUse;
            pagemap.register_span(span);

            let base = (*span).start_addr();
            let span_bytes = (*span).num_pages * PAGE_SIZE;
            let num_objects = span_bytes / obj_size;

            (*span).total_count = num_objects as u32;
            (*span).allocated_count = 0;

            let mut freelist: *mut FreeObject = ptr::null_mut();
            for i in (0..num_objects).rev() {
                let obj = base.add(i * obj_size) as *mut FreeObject;
                (*obj).next = freelist;
                freelist = obj;
            }

            (*span).freelist = freelist;
            self.num_free += num_objects;
            self.nonempty_spans.push(span);
        }
    }
}

/// Fetch up to `batch_size` objects for `size_class`, dropping the bucket
/// lock while a fresh span is populated from the page heap.
///
/// # Safety
///
/// `page_heap` and `pagemap` must be the singletons this cache was built
/// against.
pub unsafe fn fetch_range(
    cfl_lock: &SpinMutex<CentralFreeList>,
    size_class: usize,
    batch_size: usize,
    page_heap: &SpinMutex<PageHeap>,
    pagemap: &PageMap,
) -> (usize, *mut FreeObject) {
    let info = size_class::class_info(size_class);
    let mut head: *mut FreeObject = ptr::null_mut();
    let mut count = 0;

    loop {
        {
            let mut cfl = cfl_lock.lock();

            while count < batch_size && !cfl.nonempty_spans.is_empty() {
                let span = cfl.nonempty_spans.head;
                unsafe {
                    while count < batch_size && !(*span).freelist.is_null() {
                        let obj = (*span).freelist;
                        (*span).freelist = (*obj).next;
                        (*obj).next = head;
                        head = obj;
                        (*span).allocated_count += 1;
                        count += 1;
                        cfl.num_free -= 1;
                    }
                    if (*span).freelist.is_null() {
                        cfl.nonempty_spans.remove(span);
                    }
                }
            }

            if count >= batch_size {
                stat_inc!(central_cache_hits);
                return (count, head);
            }
            // Bucket lock drops here; nonempty_spans is empty and a fresh
            // span must come from the page heap.
        }

        let span = unsafe { page_heap.lock().new_span(info.pages) };
        if span.is_null() {
            if count > 0 {
                stat_inc!(central_cache_hits);
            }
            return (count, head); // OOM: hand back whatever we collected.
        }

        {
            let mut cfl = cfl_lock.lock();
            unsafe { cfl.inject_span(span, pagemap) };
        }
    }
}

/// Return a batch of `count` objects (linked via `FreeObject::next`,
/// starting at `head`) to their spans. Any span that becomes completely
/// free is handed back to the page heap, with the bucket lock dropped for
/// that call.
///
/// # Safety
///
/// `head` must start a valid linked list of exactly `count` `FreeObject`s
/// that were previously obtained from this size class via `fetch_range`.
pub unsafe fn release_list(
    cfl_lock: &SpinMutex<CentralFreeList>,
    mut head: *mut FreeObject,
    count: usize,
    page_heap: &SpinMutex<PageHeap>,
    pagemap: &PageMap,
) {
    let mut remaining = count;

    while !head.is_null() && remaining > 0 {
        let obj = head;
        unsafe { head = (*obj).next };
        remaining -= 1;

        let page_id = (obj as usize) >> PAGE_SHIFT;
        let span = pagemap.get(page_id);
        if span.is_null() {
            // Contract violation: freed pointer doesn't map to a span.
            debug_assert!(false, "free of unmapped object");
            continue;
        }

        let mut drained: *mut Span = ptr::null_mut();
        {
            let mut cfl = cfl_lock.lock();
            unsafe {
                let was_full = (*span).freelist.is_null();

                (*obj).next = (*span).freelist;
                (*span).freelist = obj;
                (*span).allocated_count -= 1;
                cfl.num_free += 1;

                if was_full {
                    cfl.nonempty_spans.push(span);
                }

                if (*span).allocated_count == 0 {
                    cfl.nonempty_spans.remove(span);
                    cfl.num_free -= (*span).total_count as usize;
                    (*span).freelist = ptr::null_mut();
                    drained = span;
                }
            }
        }
        // Bucket lock dropped before touching the page heap.
        if !drained.is_null() {
            unsafe { page_heap.lock().release_span(drained) };
        }
    }
}

/// One `CentralFreeList` per size class, each independently locked.
pub struct CentralCache {
    lists: [SpinMutex<CentralFreeList>; NUM_SIZE_CLASSES],
}

impl Default for CentralCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CentralCache {
    pub const fn new() -> Self {
        let mut lists = [const { SpinMutex::new(CentralFreeList::new(0)) }; NUM_SIZE_CLASSES];
        let mut i = 0;
        while i < NUM_SIZE_CLASSES {
            lists[i] = SpinMutex::new(CentralFreeList::new(i));
            i += 1;
        }
        Self { lists }
    }

    /// Fetch up to `batch_size` objects for `size_class`.
    ///
    /// # Safety
    ///
    /// `page_heap` and `pagemap` must be the singletons this cache was built
    /// against.
    pub unsafe fn fetch_range(
        &self,
        size_class: usize,
        batch_size: usize,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) -> (usize, *mut FreeObject) {
        unsafe { fetch_range(&self.lists[size_class], size_class, batch_size, page_heap, pagemap) }
    }

    /// Return a batch of `count` objects for `size_class`.
    ///
    /// # Safety
    ///
    /// Same requirements as the free function [`release_list`].
    pub unsafe fn release_list(
        &self,
        size_class: usize,
        head: *mut FreeObject,
        count: usize,
        page_heap: &SpinMutex<PageHeap>,
        pagemap: &PageMap,
    ) {
        unsafe { release_list(&self.lists[size_class], head, count, page_heap, pagemap) };
    }
}
