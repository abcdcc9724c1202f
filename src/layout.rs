//! Wire-format layout constants.
//!
//! Every constant here is part of the on-heap format: segment and bucket
//! headers are read and written at these offsets, and [`Heap::dump`] emits
//! the raw buffer, so changing any of them changes the dump format.
//!
//! [`Heap::dump`]: crate::heap::Heap::dump

/// Default heap size in bytes. Must be a power of two and large enough to
/// hold both sentinels plus at least one body page.
pub const INITIAL_SIZE: u32 = 1 << 16;

/// Hard upper bound on the heap size. The address space is 32-bit.
pub const MAX_SIZE: u32 = 1 << 31;

/// The page size and the minimum fragment size must be such that a page
/// stores less than 255 fragments. The page size must be 2^15 or less.
pub const PAGE_SIZE_EXPONENT: u32 = 10;

pub const PAGE_SIZE: u32 = 1 << PAGE_SIZE_EXPONENT;

pub const PAGE_SIZE_MASK: u32 = PAGE_SIZE - 1;

/// Segment header: four 32-bit fields.
/// ```text
///   [ 0.. 4]  next_free  — next free segment, or NON_FREE_SEGMENT,
///                          or BUCKET_SEGMENT_MAGIC for bucket segments
///   [ 4.. 8]  prev_free  — previous free segment, or NON_FREE_SEGMENT
///   [ 8..12]  next       — next segment by address (always valid)
///   [12..16]  prev       — previous segment by address (always valid)
/// ```
pub const SEGMENT_HEADER_SIZE: u32 = 16;

pub(crate) const SEGMENT_NEXT_FREE_OFFSET: u32 = 0;

pub(crate) const SEGMENT_PREV_FREE_OFFSET: u32 = 4;

pub(crate) const SEGMENT_NEXT_OFFSET: u32 = 8;

pub(crate) const SEGMENT_PREV_OFFSET: u32 = 12;

/// Marker stored in the free links of an allocated segment. Cannot collide
/// with a real segment address (addresses are page-aligned and below
/// [`MAX_SIZE`]).
pub const NON_FREE_SEGMENT: u32 = 0xffff_ffff;

pub const MIN_FRAGMENT_SIZE_EXPONENT: u32 = 4;

pub const MIN_FRAGMENT_SIZE: u32 = 1 << MIN_FRAGMENT_SIZE_EXPONENT;

/// Overloads the `next_free` field of a segment that holds a bucket.
/// Distinct from every valid address and from [`NON_FREE_SEGMENT`].
pub(crate) const BUCKET_SEGMENT_MAGIC: u32 = 0xffff_ceca;

/// Usable bytes of a bucket segment (one page minus the segment header).
pub const BUCKET_SIZE: u32 = PAGE_SIZE - SEGMENT_HEADER_SIZE;

/// Bucket header, placed at the start of the bucket (right after the
/// segment header of the owning segment):
/// ```text
///   [ 0.. 4]  next        — next bucket in the rank's free-bucket list, 0 = none
///   [ 4.. 8]  prev        — previous bucket in that list, 0 = none
///   [ 8..10]  free_list   — offset of the first free fragment, or FREE_LIST_NULL
///   [10..11]  free_count  — number of free fragments
///   [11..12]  exponent    — log2 of the fragment size
///   [12..  ]  alloc bitset, one bit per fragment slot
/// ```
pub(crate) const BUCKET_NEXT_OFFSET: u32 = 0;

pub(crate) const BUCKET_PREV_OFFSET: u32 = 4;

pub(crate) const BUCKET_FREE_LIST_OFFSET: u32 = 8;

pub(crate) const BUCKET_FREE_COUNT_OFFSET: u32 = 10;

pub(crate) const BUCKET_FRAGMENT_SIZE_EXPONENT_OFFSET: u32 = 11;

pub(crate) const BUCKET_ALLOC_BITSET_OFFSET: u32 = 12;

pub(crate) const BUCKET_PRE_BITSET_SIZE: u32 = 12;

pub(crate) const BUCKET_ALLOC_BITSET_MIN_SIZE: u32 = 8;

/// A bit of an overestimate, because the actual capacity is decreased by
/// the bitset's own size.
pub(crate) const BUCKET_ALLOC_BITSET_SIZE: u32 = {
    let fragments =
        (BUCKET_SIZE - BUCKET_PRE_BITSET_SIZE - BUCKET_ALLOC_BITSET_MIN_SIZE) / MIN_FRAGMENT_SIZE;
    let rounded = fragments.div_ceil(8).div_ceil(4) * 4;
    if rounded > BUCKET_ALLOC_BITSET_MIN_SIZE {
        rounded
    } else {
        BUCKET_ALLOC_BITSET_MIN_SIZE
    }
};

pub(crate) const BUCKET_HEADER_SIZE: u32 = BUCKET_PRE_BITSET_SIZE + BUCKET_ALLOC_BITSET_SIZE;

/// The minimum fragment size must be 2 bytes or more, because free
/// fragments double as free-list nodes.
pub const BUCKET_CAPACITY: u32 = BUCKET_SIZE - BUCKET_HEADER_SIZE;

/// Largest fragment size class: roughly half the bucket capacity, rounded
/// down to a power of two. Requests above this go to the segment layer.
pub const MAX_FRAGMENT_SIZE_EXPONENT: u32 = 32 - ((BUCKET_CAPACITY >> 1) - 1).leading_zeros();

pub const MAX_FRAGMENT_SIZE: u32 = 1 << MAX_FRAGMENT_SIZE_EXPONENT;

pub const MAX_BUCKET_FRAGMENTS: u32 = BUCKET_CAPACITY / MIN_FRAGMENT_SIZE;

/// Terminator of a bucket's fragment free list (16-bit offsets).
pub(crate) const FREE_LIST_NULL: u16 = 0xffff;

/// Size of the left sentinel segment for a given memory size.
pub(crate) fn left_sentinel_size(_memory_size: u32) -> u32 {
    PAGE_SIZE
}

/// Size of the right sentinel segment for a given memory size: the segment
/// header plus a 1-bit-per-page allocation bitset, rounded up to whole
/// pages.
pub(crate) fn right_sentinel_size(memory_size: u32) -> u32 {
    let bitset_size = (memory_size >> PAGE_SIZE_EXPONENT) >> 3;
    (bitset_size + SEGMENT_HEADER_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_constants() {
        // The dump format depends on these exact values.
        assert_eq!(PAGE_SIZE, 1024);
        assert_eq!(BUCKET_SIZE, 1008);
        assert_eq!(BUCKET_ALLOC_BITSET_SIZE, 8);
        assert_eq!(BUCKET_HEADER_SIZE, 20);
        assert_eq!(BUCKET_CAPACITY, 988);
        assert_eq!(MAX_FRAGMENT_SIZE_EXPONENT, 9);
        assert_eq!(MAX_FRAGMENT_SIZE, 512);
        assert_eq!(MAX_BUCKET_FRAGMENTS, 61);
    }

    #[test]
    fn test_bitset_covers_every_fragment_slot() {
        // One bit per fragment of the smallest size class must fit.
        assert!(BUCKET_ALLOC_BITSET_SIZE * 8 >= MAX_BUCKET_FRAGMENTS);
        // Fragment counts are tracked in an 8-bit field.
        assert!(MAX_BUCKET_FRAGMENTS < 255);
    }

    #[test]
    fn test_right_sentinel_size_scales_with_page_count() {
        assert_eq!(right_sentinel_size(1 << 16), PAGE_SIZE);
        // 2^23 bytes = 8192 pages = 1024 bitset bytes; with the header that
        // no longer fits in one page.
        assert_eq!(right_sentinel_size(1 << 23), 2 * PAGE_SIZE);
        assert_eq!(right_sentinel_size(MAX_SIZE), 257 * PAGE_SIZE);
    }
}
