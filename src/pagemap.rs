//! 3-level radix tree mapping page IDs to `Span` pointers.
//!
//! Each level indexes 12 bits of the page id, fan-out 4096 per level. The
//! root is inline in the `PageMap` struct; mid and leaf nodes are lazily
//! mapped from the OS on first use. Reads are always lock-free (`Acquire`
//! loads down the tree); node *installation* uses compare-and-swap rather
//! than a plain null-check-then-store, so a second installer that loses the
//! race frees its own allocation instead of leaking it or clobbering the
//! winner. Leaf-slot writes themselves still require external
//! synchronization (the owning `PageHeap`'s mutex) — only the interior-node
//! bootstrap is safe to race.

use crate::config::PAGE_SIZE;
use crate::platform;
use crate::span::Span;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

const BITS: usize = 12;
const LEN: usize = 1 << BITS; // 4096

const LEAF_SHIFT: usize = 0;
const MID_SHIFT: usize = BITS;
const ROOT_SHIFT: usize = BITS * 2;

const INDEX_MASK: usize = LEN - 1;

#[repr(C)]
struct MidNode {
    children: [AtomicPtr<LeafNode>; LEN],
}

#[repr(C)]
struct LeafNode {
    spans: [AtomicPtr<Span>; LEN],
}

/// 3-level radix tree for page_id -> *mut Span lookup.
pub struct PageMap {
    root: [AtomicPtr<MidNode>; LEN],
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

/// Const-initialize an array of null `AtomicPtr`s. `AtomicPtr::new(null)`
/// has the same representation as a zeroed word, so a transmute from an
/// all-zero integer array is sound.
macro_rules! null_atomic_array {
    ($len:expr, $T:ty) => {{
        unsafe { core::mem::transmute::<[usize; $len], [AtomicPtr<$T>; $len]>([0usize; $len]) }
    }};
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMap {
    pub const fn new() -> Self {
        Self {
            root: null_atomic_array!(LEN, MidNode),
        }
    }

    /// Look up the span covering a page id. Lock-free. Returns null if
    /// unmapped.
    #[inline]
    pub fn get(&self, page_id: usize) -> *mut Span {
        let root_idx = (page_id >> ROOT_SHIFT) & INDEX_MASK;
        let mid_idx = (page_id >> MID_SHIFT) & INDEX_MASK;
        let leaf_idx = (page_id >> LEAF_SHIFT) & INDEX_MASK;

        let mid = self.root[root_idx].load(Ordering::Acquire);
        if mid.is_null() {
            return ptr::null_mut();
        }
        let leaf = unsafe { (*mid).children[mid_idx].load(Ordering::Acquire) };
        if leaf.is_null() {
            return ptr::null_mut();
        }
        unsafe { (*leaf).spans[leaf_idx].load(Ordering::Acquire) }
    }

    /// Install a span pointer for a page id, bootstrapping any missing
    /// interior nodes along the way.
    ///
    /// # Safety
    ///
    /// Must be called under external synchronization (the owning
    /// `PageHeap`'s mutex) with respect to other `set`/`register_*` calls.
    pub unsafe fn set(&self, page_id: usize, span: *mut Span) {
        let root_idx = (page_id >> ROOT_SHIFT) & INDEX_MASK;
        let mid_idx = (page_id >> MID_SHIFT) & INDEX_MASK;
        let leaf_idx = (page_id >> LEAF_SHIFT) & INDEX_MASK;

        let mid = unsafe { self.ensure_mid(root_idx) };
        let leaf = unsafe { self.ensure_leaf(mid, mid_idx) };

        unsafe { (*leaf).spans[leaf_idx].store(span, Ordering::Release) };
    }

    unsafe fn ensure_mid(&self, root_idx: usize) -> *mut MidNode {
        let existing = self.root[root_idx].load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let fresh = unsafe { Self::alloc_mid_node() };
        assert!(!fresh.is_null(), "failed to allocate pagemap mid node");

        match self.root[root_idx].compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => fresh,
            Err(winner) => {
                // Lost the race: free our own allocation, use theirs.
                unsafe { platform::page_dealloc(fresh.cast(), Self::mid_node_bytes()) };
                winner
            }
        }
    }

    unsafe fn ensure_leaf(&self, mid: *mut MidNode, mid_idx: usize) -> *mut LeafNode {
        let slot = unsafe { &(*mid).children[mid_idx] };
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let fresh = unsafe { Self::alloc_leaf_node() };
        assert!(!fresh.is_null(), "failed to allocate pagemap leaf node");

        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => fresh,
            Err(winner) => {
                unsafe { platform::page_dealloc(fresh.cast(), Self::leaf_node_bytes()) };
                winner
            }
        }
    }

    /// Register a span for every page it covers.
    ///
    /// # Safety
    ///
    /// Must be called under external synchronization.
    pub unsafe fn register_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, span) };
        }
    }

    /// Register only the first and last pages of a free span.
    ///
    /// Free spans only need endpoints mapped, since coalescing only ever
    /// probes `start - 1` and `end`. In-use spans must use
    /// [`register_span`](Self::register_span) instead, since a `free()` call
    /// can land on any interior page.
    ///
    /// # Safety
    ///
    /// Must be called under external synchronization.
    pub unsafe fn register_span_endpoints(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        unsafe { self.set(start, span) };
        if count > 1 {
            unsafe { self.set(start + count - 1, span) };
        }
    }

    /// Unregister a span: null out every page it covers.
    ///
    /// # Safety
    ///
    /// Must be called under external synchronization.
    pub unsafe fn unregister_span(&self, span: *mut Span) {
        let start = unsafe { (*span).start_page };
        let count = unsafe { (*span).num_pages };
        for page_id in start..start + count {
            unsafe { self.set(page_id, ptr::null_mut()) };
        }
    }

    fn mid_node_bytes() -> usize {
        let size = core::mem::size_of::<MidNode>();
        (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }

    fn leaf_node_bytes() -> usize {
        let size = core::mem::size_of::<LeafNode>();
        (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
    }

    unsafe fn alloc_mid_node() -> *mut MidNode {
        let ptr = unsafe { platform::page_alloc(Self::mid_node_bytes()) };
        // page_alloc returns zeroed memory, valid for an all-null AtomicPtr array.
        ptr.cast::<MidNode>()
    }

    unsafe fn alloc_leaf_node() -> *mut LeafNode {
        let ptr = unsafe { platform::page_alloc(Self::leaf_node_bytes()) };
        ptr.cast::<LeafNode>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{ObjectPool, SpanState};

    #[test]
    fn test_pagemap_get_empty() {
        let map = PageMap::new();
        assert!(map.get(0).is_null());
        assert!(map.get(1000).is_null());
        assert!(map.get(123456).is_null());
    }

    #[test]
    fn test_pagemap_set_get() {
        let map = PageMap::new();
        let mut pool = ObjectPool::new();
        let s = pool.alloc();
        assert!(!s.is_null());

        unsafe {
            (*s).start_page = 42;
            (*s).num_pages = 1;

            map.set(42, s);
            assert_eq!(map.get(42), s);
            assert!(map.get(41).is_null());
            assert!(map.get(43).is_null());

            map.set(42, ptr::null_mut());
            assert!(map.get(42).is_null());

            pool.dealloc(s);
        }
    }

    #[test]
    fn test_pagemap_register_span() {
        let map = PageMap::new();
        let mut pool = ObjectPool::new();
        let s = pool.alloc();
        assert!(!s.is_null());

        unsafe {
            (*s).start_page = 100;
            (*s).num_pages = 5;
            (*s).state = SpanState::InUse;

            map.register_span(s);

            for page in 100..105 {
                assert_eq!(map.get(page), s);
            }
            assert!(map.get(99).is_null());
            assert!(map.get(105).is_null());

            map.unregister_span(s);
            for page in 100..105 {
                assert!(map.get(page).is_null());
            }

            pool.dealloc(s);
        }
    }

    #[test]
    fn test_pagemap_endpoints_only() {
        let map = PageMap::new();
        let mut pool = ObjectPool::new();
        let s = pool.alloc();
        assert!(!s.is_null());

        unsafe {
            (*s).start_page = 200;
            (*s).num_pages = 4;

            map.register_span_endpoints(s);

            assert_eq!(map.get(200), s);
            assert_eq!(map.get(203), s);
            assert!(map.get(201).is_null());
            assert!(map.get(202).is_null());

            pool.dealloc(s);
        }
    }

    #[test]
    fn test_pagemap_high_address() {
        let map = PageMap::new();
        let mut pool = ObjectPool::new();
        let s = pool.alloc();
        assert!(!s.is_null());

        unsafe {
            // Exercises all three levels.
            let page_id = (1 << 20) + (1 << 15) + 42;
            (*s).start_page = page_id;
            (*s).num_pages = 1;

            map.set(page_id, s);
            assert_eq!(map.get(page_id), s);
            assert!(map.get(page_id - 1).is_null());
            assert!(map.get(page_id + 1).is_null());

            pool.dealloc(s);
        }
    }
}
