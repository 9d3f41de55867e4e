//! Size class table and lookup functions.
//!
//! Requests up to [`MAX_BYTES`] are rounded up piecewise and bucketed into
//! one of [`NUM_SIZE_CLASSES`] classes:
//!
//! | range (bytes)   | rounding granularity |
//! |-----------------|----------------------|
//! | 0..=128         | 8                    |
//! | 129..=1024      | 16                   |
//! | 1025..=8192     | 128                  |
//! | 8193..=65536    | 1024                 |
//! | 65537..=262144  | 8192                 |
//!
//! The bucket-index arithmetic (`index_within_range` below) comes straight
//! from the piecewise table: each range contributes a fixed number of
//! buckets — 16, 56, 56, 56, 24 — for 208 total, and a size's bucket is an
//! offset within its range plus the running total of buckets in earlier
//! ranges. Requests above `MAX_BYTES` never reach this table; they are
//! "huge" allocations served directly by the page heap.

use crate::config::{MAX_BYTES, NUM_MOVE_SIZE_MAX, NUM_MOVE_SIZE_MIN, NUM_SIZE_CLASSES, PAGE_SHIFT, PAGE_SIZE};

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Rounded object size in bytes for this class.
    pub size: usize,
    /// Pages fetched from the page heap each time this class populates a
    /// fresh span (`NumMovePage(size)`).
    pub pages: usize,
    /// Upper bound on batch transfer size for this class (`NumMoveSize(size)`).
    pub num_move_size: usize,
}

impl SizeClassInfo {
    pub const fn objects_per_span(&self) -> usize {
        (self.pages * PAGE_SIZE) / self.size
    }
}

const fn round_up_to(bytes: usize, align: usize) -> usize {
    (bytes + align - 1) & !(align - 1)
}

/// Round a request up to its class size. Callers route requests above
/// `MAX_BYTES` around this table entirely (see `allocator::alloc`).
pub const fn round_up(size: usize) -> usize {
    if size <= 128 {
        round_up_to(size, 8)
    } else if size <= 1024 {
        round_up_to(size, 16)
    } else if size <= 8192 {
        round_up_to(size, 128)
    } else if size <= 65536 {
        round_up_to(size, 1024)
    } else {
        round_up_to(size, 8192)
    }
}

/// The per-range rounding granularity a request falls into. Every pointer
/// in that class is guaranteed to satisfy this alignment: objects are
/// carved consecutively from a page-aligned base, so address `k` within a
/// span of `size`-byte objects is `base + k*size`, a multiple of this
/// granularity whenever `size` is.
pub const fn alignment_of(size: usize) -> usize {
    if size <= 128 {
        8
    } else if size <= 1024 {
        16
    } else if size <= 8192 {
        128
    } else if size <= 65536 {
        1024
    } else {
        8192
    }
}

const fn index_within_range(bytes: usize, align_shift: u32) -> usize {
    ((bytes + (1 << align_shift) - 1) >> align_shift) - 1
}

const RANGE_COUNTS: [usize; 5] = [16, 56, 56, 56, 24];

/// Map a request size (1..=MAX_BYTES) to its bucket index (0..NUM_SIZE_CLASSES).
pub const fn class_of(size: usize) -> usize {
    if size <= 128 {
        index_within_range(size, 3)
    } else if size <= 1024 {
        index_within_range(size - 128, 4) + RANGE_COUNTS[0]
    } else if size <= 8192 {
        index_within_range(size - 1024, 7) + RANGE_COUNTS[0] + RANGE_COUNTS[1]
    } else if size <= 65536 {
        index_within_range(size - 8192, 10) + RANGE_COUNTS[0] + RANGE_COUNTS[1] + RANGE_COUNTS[2]
    } else {
        index_within_range(size - 65536, 13)
            + RANGE_COUNTS[0]
            + RANGE_COUNTS[1]
            + RANGE_COUNTS[2]
            + RANGE_COUNTS[3]
    }
}

/// Batch-size cap for a given (unrounded) request size: `clamp(MAX_BYTES /
/// size, 2, 512)`.
pub const fn num_move_size(size: usize) -> usize {
    let mut n = MAX_BYTES / size;
    if n < NUM_MOVE_SIZE_MIN {
        n = NUM_MOVE_SIZE_MIN;
    }
    if n > NUM_MOVE_SIZE_MAX {
        n = NUM_MOVE_SIZE_MAX;
    }
    n
}

/// Pages to request from the page heap when populating a fresh span for
/// this size: `max(1, (NumMoveSize(size) * size) >> PAGE_SHIFT)`.
pub const fn num_move_page(size: usize) -> usize {
    let bytes = num_move_size(size) * size;
    let pages = bytes >> PAGE_SHIFT;
    if pages == 0 { 1 } else { pages }
}

const fn build_table() -> [SizeClassInfo; NUM_SIZE_CLASSES] {
    let mut table = [SizeClassInfo {
        size: 0,
        pages: 0,
        num_move_size: 0,
    }; NUM_SIZE_CLASSES];

    // `class_of` and `round_up` are both monotonic in `size`, so the class
    // boundaries fall exactly where `round_up(size)` changes value; walking
    // forward from the smallest representable size visits each boundary once.
    let mut cls = 0usize;
    let mut size = 1usize;
    while cls < NUM_SIZE_CLASSES {
        let rounded = round_up(size);
        table[cls] = SizeClassInfo {
            size: rounded,
            pages: num_move_page(rounded),
            num_move_size: num_move_size(rounded),
        };
        size = rounded + 1;
        cls += 1;
    }
    table
}

pub static SIZE_CLASSES: [SizeClassInfo; NUM_SIZE_CLASSES] = build_table();

/// Get the size class info for a given class index.
#[inline]
pub fn class_info(cls: usize) -> &'static SizeClassInfo {
    &SIZE_CLASSES[cls]
}

/// Get the allocation size for a given size class.
#[inline]
pub fn class_to_size(cls: usize) -> usize {
    SIZE_CLASSES[cls].size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_208_entries() {
        assert_eq!(SIZE_CLASSES.len(), 208);
    }

    #[test]
    fn classes_strictly_increasing() {
        for i in 1..NUM_SIZE_CLASSES {
            assert!(SIZE_CLASSES[i].size > SIZE_CLASSES[i - 1].size);
        }
    }

    #[test]
    fn first_and_last_class_match_spec() {
        assert_eq!(SIZE_CLASSES[0].size, 8);
        assert_eq!(SIZE_CLASSES[NUM_SIZE_CLASSES - 1].size, MAX_BYTES);
    }

    #[test]
    fn round_trip_class_of_and_class_to_size() {
        for cls in 0..NUM_SIZE_CLASSES {
            let size = class_to_size(cls);
            assert_eq!(class_of(size), cls, "mismatch at class {cls} size {size}");
        }
    }

    #[test]
    fn round_up_boundaries() {
        assert_eq!(round_up(1), 8);
        assert_eq!(round_up(7), 8);
        assert_eq!(round_up(8), 8);
        assert_eq!(round_up(9), 16);
        assert_eq!(round_up(128), 128);
        assert_eq!(round_up(129), 144);
        assert_eq!(round_up(1024), 1024);
        assert_eq!(round_up(1025), 1152);
        assert_eq!(round_up(8192), 8192);
        assert_eq!(round_up(8193), 9216);
        assert_eq!(round_up(65536), 65536);
        assert_eq!(round_up(65537), 73728);
        assert_eq!(round_up(262144), 262144);
    }

    #[test]
    fn alignment_matches_range() {
        assert_eq!(alignment_of(1), 8);
        assert_eq!(alignment_of(128), 8);
        assert_eq!(alignment_of(129), 16);
        assert_eq!(alignment_of(1024), 16);
        assert_eq!(alignment_of(1025), 128);
        assert_eq!(alignment_of(8192), 128);
        assert_eq!(alignment_of(8193), 1024);
        assert_eq!(alignment_of(65536), 1024);
        assert_eq!(alignment_of(65537), 8192);
        assert_eq!(alignment_of(262144), 8192);
    }

    #[test]
    fn rounded_sizes_satisfy_declared_alignment() {
        // Every class's rounded size is itself a multiple of its declared
        // alignment, so objects carved consecutively from a page-aligned
        // base always land on a multiple of that alignment.
        for cls in 0..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            let align = alignment_of(info.size);
            assert_eq!(info.size % align, 0, "class {cls} size {}", info.size);
        }
    }

    #[test]
    fn num_move_size_clamped() {
        assert_eq!(num_move_size(8), 512); // would be 32768, clamped to 512
        assert_eq!(num_move_size(MAX_BYTES), 2);
        assert!(num_move_size(4096) >= 2);
    }

    #[test]
    fn num_move_page_at_least_one() {
        for cls in 0..NUM_SIZE_CLASSES {
            assert!(SIZE_CLASSES[cls].pages >= 1);
        }
    }

    #[test]
    fn objects_per_span_fits() {
        for cls in 0..NUM_SIZE_CLASSES {
            let info = &SIZE_CLASSES[cls];
            let objs = info.objects_per_span();
            assert!(objs >= 1);
            assert!(objs * info.size <= info.pages * PAGE_SIZE);
        }
    }

    #[test]
    fn range_bucket_counts_match_spec() {
        // First range: 16 buckets (8, 16, .., 128)
        assert_eq!(class_of(8), 0);
        assert_eq!(class_of(128), 15);
        // Second range starts at bucket 16
        assert_eq!(class_of(144), 16);
        assert_eq!(class_of(1024), 71);
        // Third range
        assert_eq!(class_of(1152), 72);
        assert_eq!(class_of(8192), 127);
        // Fourth range
        assert_eq!(class_of(9216), 128);
        assert_eq!(class_of(65536), 183);
        // Fifth range
        assert_eq!(class_of(73728), 184);
        assert_eq!(class_of(262144), 207);
    }
}
