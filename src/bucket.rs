//! Bucket layer: page-sized segments subdivided into fixed-size fragments
//! for one size class ("rank"), plus the per-rank free-bucket lists.
//!
//! A free fragment stores, in its first two bytes, the offset of the next
//! free fragment, so free fragments double as free-list nodes. The bucket
//! header additionally keeps a per-fragment allocation bitset, which is
//! what makes double frees and misaligned frees detectable.

use log::debug;

use crate::heap::Heap;
use crate::layout::{
    BUCKET_ALLOC_BITSET_OFFSET, BUCKET_ALLOC_BITSET_SIZE, BUCKET_CAPACITY,
    BUCKET_FRAGMENT_SIZE_EXPONENT_OFFSET, BUCKET_FREE_COUNT_OFFSET, BUCKET_FREE_LIST_OFFSET,
    BUCKET_HEADER_SIZE, BUCKET_NEXT_OFFSET, BUCKET_PREV_OFFSET, BUCKET_SEGMENT_MAGIC, BUCKET_SIZE,
    FREE_LIST_NULL, MIN_FRAGMENT_SIZE_EXPONENT, PAGE_SIZE_MASK, SEGMENT_HEADER_SIZE,
    SEGMENT_NEXT_FREE_OFFSET,
};
use crate::memory::Memory;
use crate::segment;

/// Exponent of the fragment size served by buckets of `rank`.
pub fn fragment_size_exponent_for_rank(rank: u32) -> u32 {
    rank + MIN_FRAGMENT_SIZE_EXPONENT
}

/// Fragment size served by buckets of `rank`.
pub fn fragment_size_for_rank(rank: u32) -> u32 {
    1 << fragment_size_exponent_for_rank(rank)
}

/// The rank whose fragment size is the smallest one that fits `size`.
pub fn rank_for_size(size: u32) -> u32 {
    let ceil_exponent = 32 - size.wrapping_sub(1).leading_zeros();
    ceil_exponent.max(MIN_FRAGMENT_SIZE_EXPONENT) - MIN_FRAGMENT_SIZE_EXPONENT
}

#[inline]
pub(crate) fn next(mem: &Memory, address: u32) -> u32 {
    mem.word(address + BUCKET_NEXT_OFFSET)
}

#[inline]
pub(crate) fn set_next(mem: &mut Memory, address: u32, value: u32) {
    mem.set_word(address + BUCKET_NEXT_OFFSET, value);
}

#[inline]
pub(crate) fn prev(mem: &Memory, address: u32) -> u32 {
    mem.word(address + BUCKET_PREV_OFFSET)
}

#[inline]
pub(crate) fn set_prev(mem: &mut Memory, address: u32, value: u32) {
    mem.set_word(address + BUCKET_PREV_OFFSET, value);
}

/// Offset of the first free fragment, or [`FREE_LIST_NULL`] when full.
#[inline]
pub(crate) fn free_list(mem: &Memory, address: u32) -> u16 {
    mem.half(address + BUCKET_FREE_LIST_OFFSET)
}

#[inline]
pub(crate) fn set_free_list(mem: &mut Memory, address: u32, offset: u16) {
    mem.set_half(address + BUCKET_FREE_LIST_OFFSET, offset);
}

#[inline]
pub(crate) fn free_count(mem: &Memory, address: u32) -> u8 {
    mem.byte(address + BUCKET_FREE_COUNT_OFFSET)
}

#[inline]
pub(crate) fn set_free_count(mem: &mut Memory, address: u32, count: u8) {
    mem.set_byte(address + BUCKET_FREE_COUNT_OFFSET, count);
}

#[inline]
pub(crate) fn fragment_size_exponent(mem: &Memory, address: u32) -> u32 {
    u32::from(mem.byte(address + BUCKET_FRAGMENT_SIZE_EXPONENT_OFFSET))
}

/// Total fragment capacity of the bucket at `address`.
pub(crate) fn fragment_count(mem: &Memory, address: u32) -> u32 {
    BUCKET_CAPACITY >> fragment_size_exponent(mem, address)
}

pub(crate) fn alloc_bit(mem: &Memory, bucket_address: u32, index: u32) -> bool {
    let address = bucket_address + BUCKET_ALLOC_BITSET_OFFSET + (index >> 3);
    (mem.byte(address) >> (index & 7)) & 1 == 1
}

pub(crate) fn set_alloc_bit(mem: &mut Memory, bucket_address: u32, index: u32, value: bool) {
    let address = bucket_address + BUCKET_ALLOC_BITSET_OFFSET + (index >> 3);
    let bit = 1u8 << (index & 7);
    let old = mem.byte(address);
    mem.set_byte(address, if value { old | bit } else { old & !bit });
}

/// Link stored in the first two bytes of the free fragment at `offset`
/// within the fragment area starting at `area`.
#[inline]
pub(crate) fn next_free_fragment(mem: &Memory, area: u32, offset: u16) -> u16 {
    mem.half(area + u32::from(offset))
}

#[inline]
pub(crate) fn set_next_free_fragment(mem: &mut Memory, area: u32, offset: u16, value: u16) {
    mem.set_half(area + u32::from(offset), value);
}

/// Writes a complete bucket header at `address`, tags the owning segment,
/// links every fragment slot into the free list, and clears the
/// allocation bitset.
pub(crate) fn init(
    mem: &mut Memory,
    address: u32,
    next: u32,
    prev: u32,
    free_list: u16,
    free_count: u8,
    exponent: u8,
) {
    mem.set_word(address + BUCKET_NEXT_OFFSET, next);
    mem.set_word(address + BUCKET_PREV_OFFSET, prev);
    mem.set_half(address + BUCKET_FREE_LIST_OFFSET, free_list);
    mem.set_byte(address + BUCKET_FREE_COUNT_OFFSET, free_count);
    mem.set_byte(address + BUCKET_FRAGMENT_SIZE_EXPONENT_OFFSET, exponent);

    // Tag the owning segment as a bucket.
    mem.set_word(
        address - SEGMENT_HEADER_SIZE + SEGMENT_NEXT_FREE_OFFSET,
        BUCKET_SEGMENT_MAGIC,
    );

    // Thread every fragment slot onto the free list.
    let fragment_size = 1u32 << exponent;
    let count = u32::from(free_count);
    let area = address + BUCKET_HEADER_SIZE;
    for i in 0..count {
        let cur = (i * fragment_size) as u16;
        let link = if i == count - 1 {
            FREE_LIST_NULL
        } else {
            ((i + 1) * fragment_size) as u16
        };
        set_next_free_fragment(mem, area, cur, link);
    }

    let bitset = address + BUCKET_ALLOC_BITSET_OFFSET;
    for a in (bitset..bitset + BUCKET_ALLOC_BITSET_SIZE).step_by(4) {
        mem.set_word(a, 0);
    }
}

impl Heap {
    /// Returns a bucket of `rank` with at least one free fragment,
    /// allocating and initializing a fresh one if the rank's free-bucket
    /// list is empty. Returns 0 if a fresh bucket cannot be allocated or
    /// the rank is out of range.
    pub(crate) fn ensure_bucket(&mut self, rank: u32) -> u32 {
        let Some(list) = self.free_buckets.get(rank as usize) else {
            return 0;
        };
        if list.head != 0 {
            return list.head;
        }
        let address = self.allocate_segment(BUCKET_SIZE);
        if address == 0 {
            return 0;
        }
        let exponent = fragment_size_exponent_for_rank(rank);
        let count = (BUCKET_CAPACITY >> exponent) as u8;
        init(&mut self.memory, address, 0, 0, 0, count, exponent as u8);
        self.free_buckets[rank as usize].head = address;
        self.free_buckets[rank as usize].tail = address;
        debug!("new rank-{rank} bucket at {address:#x} with {count} fragments");
        address
    }

    /// Pops the free-list head of the bucket at `bucket_address`. The
    /// caller must ensure the free list is non-empty.
    fn take_fragment(&mut self, bucket_address: u32, rank: u32) -> u32 {
        let count = free_count(&self.memory, bucket_address);
        set_free_count(&mut self.memory, bucket_address, count - 1);
        let area = bucket_address + BUCKET_HEADER_SIZE;
        let head = free_list(&self.memory, bucket_address);
        let tail = next_free_fragment(&self.memory, area, head);
        set_free_list(&mut self.memory, bucket_address, tail);
        let index = u32::from(head) >> (rank + MIN_FRAGMENT_SIZE_EXPONENT);
        set_alloc_bit(&mut self.memory, bucket_address, index, true);
        area + u32::from(head)
    }

    /// Serves a small request from a bucket of the matching rank.
    pub(crate) fn allocate_fragment(&mut self, size: u32) -> u32 {
        let rank = rank_for_size(size);
        let bucket_address = self.ensure_bucket(rank);
        if bucket_address == 0 {
            return 0;
        }
        let user_address = self.take_fragment(bucket_address, rank);
        if free_count(&self.memory, bucket_address) == 0 {
            self.remove_bucket_from_list(bucket_address, rank);
        }
        user_address
    }

    /// Returns the fragment at `address` to its bucket. Every
    /// inconsistency (enclosing segment not a bucket, misaligned offset,
    /// fragment not allocated) is a silent no-op.
    pub(crate) fn free_fragment(&mut self, address: u32) {
        let segment_address = address & !PAGE_SIZE_MASK;
        if !segment::is_bucket(&self.memory, segment_address) {
            return;
        }

        let bucket_address = segment_address + SEGMENT_HEADER_SIZE;
        let area = bucket_address + BUCKET_HEADER_SIZE;
        let exponent = fragment_size_exponent(&self.memory, bucket_address);
        let fragment_size = 1u32 << exponent;
        let offset = address.wrapping_sub(area);
        // Addresses below the fragment area wrap to huge offsets, so this
        // bound check also rejects pointers into the bucket header.
        if offset >= fragment_count(&self.memory, bucket_address) << exponent {
            return;
        }
        if offset & (fragment_size - 1) != 0 {
            return;
        }
        let index = offset >> exponent;
        if !alloc_bit(&self.memory, bucket_address, index) {
            // Not allocated: double free or wild pointer.
            return;
        }

        let head = free_list(&self.memory, bucket_address);
        set_next_free_fragment(&mut self.memory, area, offset as u16, head);
        set_free_list(&mut self.memory, bucket_address, offset as u16);

        let old_count = free_count(&self.memory, bucket_address);
        set_free_count(&mut self.memory, bucket_address, old_count + 1);
        set_alloc_bit(&mut self.memory, bucket_address, index, false);

        if old_count == 0 {
            // The bucket was full; it can serve requests again.
            self.append_bucket_to_list(bucket_address, exponent - MIN_FRAGMENT_SIZE_EXPONENT);
        }
    }

    /// Unlinks a bucket from its rank's free-bucket list. Called when its
    /// last free fragment gets allocated.
    pub(crate) fn remove_bucket_from_list(&mut self, address: u32, rank: u32) {
        let next_bucket = next(&self.memory, address);
        let prev_bucket = prev(&self.memory, address);
        set_next(&mut self.memory, address, 0);
        set_prev(&mut self.memory, address, 0);
        if next_bucket == 0 {
            self.free_buckets[rank as usize].tail = prev_bucket;
        } else {
            set_prev(&mut self.memory, next_bucket, prev_bucket);
        }
        if prev_bucket == 0 {
            self.free_buckets[rank as usize].head = next_bucket;
        } else {
            set_next(&mut self.memory, prev_bucket, next_bucket);
        }
    }

    /// Appends a bucket to the tail of its rank's free-bucket list. Called
    /// when a full bucket regains a free fragment.
    pub(crate) fn append_bucket_to_list(&mut self, address: u32, rank: u32) {
        let tail = self.free_buckets[rank as usize].tail;
        self.free_buckets[rank as usize].tail = address;
        set_prev(&mut self.memory, address, tail);
        set_next(&mut self.memory, address, 0);
        if tail == 0 {
            self.free_buckets[rank as usize].head = address;
        } else {
            set_next(&mut self.memory, tail, address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::layout::{MAX_BUCKET_FRAGMENTS, MAX_FRAGMENT_SIZE, PAGE_SIZE_EXPONENT};

    #[test]
    fn test_rank_is_monotone_and_sufficient() {
        let mut prev_rank = 0;
        for size in 1..=MAX_FRAGMENT_SIZE {
            let rank = rank_for_size(size);
            assert!(rank >= prev_rank, "rank must be non-decreasing in size");
            assert!(
                fragment_size_for_rank(rank) >= size,
                "fragment of rank {rank} too small for {size}"
            );
            prev_rank = rank;
        }
        assert_eq!(rank_for_size(1), 0);
        assert_eq!(rank_for_size(16), 0);
        assert_eq!(rank_for_size(17), 1);
        assert_eq!(rank_for_size(MAX_FRAGMENT_SIZE), 5);
    }

    #[test]
    fn test_fragment_reuse_is_lifo() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        assert_ne!(p, 0);
        heap.write_int(p, 0x11223344);
        assert_eq!(heap.read_int(p), 0x11223344);
        heap.free(p);
        // The freed fragment is the free-list head, so it is handed out
        // again immediately.
        assert_eq!(heap.allocate(10), p);
    }

    #[test]
    fn test_full_bucket_leaves_list_and_a_new_one_opens() {
        let mut heap = Heap::new();
        let mut fragments = Vec::new();
        for _ in 0..MAX_BUCKET_FRAGMENTS {
            let p = heap.allocate(16);
            assert_ne!(p, 0);
            fragments.push(p);
        }
        let first_page = (fragments[0] as u32) >> PAGE_SIZE_EXPONENT;
        assert!(fragments
            .iter()
            .all(|&p| (p as u32) >> PAGE_SIZE_EXPONENT == first_page));

        // The bucket is now full; the next request opens a second bucket
        // on a different page.
        let extra = heap.allocate(16);
        assert_ne!(extra, 0);
        assert_ne!((extra as u32) >> PAGE_SIZE_EXPONENT, first_page);
        heap.check_invariants().unwrap();

        // Freeing one fragment re-appends the first bucket at the tail of
        // its rank's list; the second bucket stays at the head and keeps
        // serving.
        heap.free(fragments[7]);
        let next = heap.allocate(16);
        assert_eq!((next as u32) >> PAGE_SIZE_EXPONENT, (extra as u32) >> PAGE_SIZE_EXPONENT);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_fragment_double_free_is_noop() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        heap.free(p);
        heap.free(p);
        heap.check_invariants().unwrap();
        // The fragment comes back exactly once.
        assert_eq!(heap.allocate(10), p);
        assert_ne!(heap.allocate(10), p);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_misaligned_fragment_free_is_ignored() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        heap.free(p + 3);
        heap.free(p + 8);
        heap.check_invariants().unwrap();
        // The block is still allocated and usable.
        heap.write_int(p, 77);
        assert_eq!(heap.read_int(p), 77);
    }

    #[test]
    fn test_free_into_non_bucket_page_is_ignored() {
        let mut heap = Heap::new();
        // Interior of the left sentinel page: not a bucket, not aligned.
        heap.free(40);
        heap.free(0);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_distinct_ranks_use_distinct_buckets() {
        let mut heap = Heap::new();
        let small = heap.allocate(16) as u32;
        let large = heap.allocate(512) as u32;
        assert_ne!(small >> PAGE_SIZE_EXPONENT, large >> PAGE_SIZE_EXPONENT);
        heap.check_invariants().unwrap();
    }
}
