//! Bit-exact constants shared by every tier.
//!
//! Unlike the teacher crate these are not generated by a build script —
//! there is nothing to template. Page size, the size-class ceiling, the
//! bucket count and the span-list bound are all fixed by contract.

/// log2(page size). Pages are the unit PageHeap and the OS trade in.
pub const PAGE_SHIFT: usize = 12;
/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request routed through the size-class tables. Anything bigger
/// is a "huge" allocation served directly by PageHeap/the OS.
pub const MAX_BYTES: usize = 262_144;

/// Number of size-class buckets (ThreadCache/CentralCache array length).
pub const NUM_SIZE_CLASSES: usize = 208;

/// PageHeap free-list count; spans of 1..=MAX_SPAN_PAGES-1 pages are
/// cached in per-page-count free lists, index 0 unused.
pub const MAX_SPAN_PAGES: usize = 129;

/// ThreadCache congestion-window initial value.
pub const INITIAL_CWND: usize = 1;
/// ThreadCache slow-start threshold initial value.
pub const INITIAL_SSTHRESH: usize = 32;
/// Clamp bounds for `NumMoveSize`.
pub const NUM_MOVE_SIZE_MIN: usize = 2;
pub const NUM_MOVE_SIZE_MAX: usize = 512;
/// Residency budget used to bound batch size against memory already cached
/// in a thread-local free list (64 KiB, per spec).
pub const RESIDENCY_BUDGET_BYTES: usize = 64 * 1024;

/// `max(128 KiB, 64*stride)` sizing rule for the span-metadata slab pool,
/// expressed as the `64` multiplier (the `128 KiB` floor is applied where
/// it's used, since it depends on `stride` = `size_of::<Span>()`).
pub const SPAN_POOL_CHUNK_OBJECTS: usize = 64;
pub const SPAN_POOL_CHUNK_MIN_BYTES: usize = 128 * 1024;
