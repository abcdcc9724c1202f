//! Segment layer: the heap as a doubly-linked list of contiguous,
//! address-ordered page runs.
//!
//! Two logical lists thread through the same headers. The all-segments
//! list (`next`/`prev`) is a total order by address, bounded by the left
//! sentinel at address 0 and the right sentinel near the end of memory.
//! The free-segment list (`next_free`/`prev_free`) links only free
//! segments, with both sentinels serving as permanently allocated anchors.
//! A segment is free iff both of its free links differ from
//! [`NON_FREE_SEGMENT`], which is why the anchors never read as free even
//! though one of their free links is live.

use log::debug;

use crate::heap::Heap;
use crate::layout::{
    self, NON_FREE_SEGMENT, PAGE_SIZE, SEGMENT_HEADER_SIZE, SEGMENT_NEXT_FREE_OFFSET,
    SEGMENT_NEXT_OFFSET, SEGMENT_PREV_FREE_OFFSET, SEGMENT_PREV_OFFSET,
};
use crate::memory::Memory;

/// The left sentinel segment always starts at address 0.
pub(crate) fn left_sentinel() -> u32 {
    0
}

/// Address of the right sentinel segment, computed from the current size.
pub(crate) fn right_sentinel(mem: &Memory) -> u32 {
    let heap_size = mem.byte_size();
    heap_size - layout::right_sentinel_size(heap_size)
}

/// Total size of the segment at `address`, header included.
pub(crate) fn size(mem: &Memory, address: u32) -> u32 {
    next(mem, address) - address
}

/// Whether the segment at `address` is in the free list. The caller must
/// ensure the address really is the start of a segment.
pub(crate) fn is_free(mem: &Memory, address: u32) -> bool {
    next_free(mem, address) != NON_FREE_SEGMENT && prev_free(mem, address) != NON_FREE_SEGMENT
}

/// Whether the segment at `address` holds a bucket.
pub(crate) fn is_bucket(mem: &Memory, address: u32) -> bool {
    mem.word(address + SEGMENT_NEXT_FREE_OFFSET) == layout::BUCKET_SEGMENT_MAGIC
}

#[inline]
pub(crate) fn next_free(mem: &Memory, address: u32) -> u32 {
    mem.word(address + SEGMENT_NEXT_FREE_OFFSET)
}

#[inline]
pub(crate) fn set_next_free(mem: &mut Memory, address: u32, next: u32) {
    mem.set_word(address + SEGMENT_NEXT_FREE_OFFSET, next);
}

#[inline]
pub(crate) fn prev_free(mem: &Memory, address: u32) -> u32 {
    mem.word(address + SEGMENT_PREV_FREE_OFFSET)
}

#[inline]
pub(crate) fn set_prev_free(mem: &mut Memory, address: u32, prev: u32) {
    mem.set_word(address + SEGMENT_PREV_FREE_OFFSET, prev);
}

#[inline]
pub(crate) fn next(mem: &Memory, address: u32) -> u32 {
    mem.word(address + SEGMENT_NEXT_OFFSET)
}

#[inline]
pub(crate) fn set_next(mem: &mut Memory, address: u32, next: u32) {
    mem.set_word(address + SEGMENT_NEXT_OFFSET, next);
}

#[inline]
pub(crate) fn prev(mem: &Memory, address: u32) -> u32 {
    mem.word(address + SEGMENT_PREV_OFFSET)
}

#[inline]
pub(crate) fn set_prev(mem: &mut Memory, address: u32, prev: u32) {
    mem.set_word(address + SEGMENT_PREV_OFFSET, prev);
}

/// Writes a full segment header. The caller is responsible for making sure
/// the segment does not overlap others.
pub(crate) fn init(
    mem: &mut Memory,
    address: u32,
    next_free: u32,
    prev_free: u32,
    next: u32,
    prev: u32,
) {
    mem.set_word(address + SEGMENT_NEXT_FREE_OFFSET, next_free);
    mem.set_word(address + SEGMENT_PREV_FREE_OFFSET, prev_free);
    mem.set_word(address + SEGMENT_NEXT_OFFSET, next);
    mem.set_word(address + SEGMENT_PREV_OFFSET, prev);
}

/// Finds the closest free segment at or before `address`, walking `prev`
/// links. May return the left sentinel. Linear by design; an interval tree
/// would make this O(log n) and is a pending improvement, not a defect.
pub(crate) fn find_preceding_free(mem: &Memory, address: u32) -> u32 {
    let mut cur = address;
    while cur != left_sentinel() {
        if is_free(mem, cur) {
            return cur;
        }
        cur = prev(mem, cur);
    }
    cur
}

/// Size of the smallest free segment, or 0 if none are free.
pub(crate) fn min_free_size(mem: &Memory) -> u32 {
    let mut min = 0;
    let mut cur = 0;
    while cur != NON_FREE_SEGMENT {
        if is_free(mem, cur) && (min == 0 || size(mem, cur) < min) {
            min = size(mem, cur);
        }
        cur = next_free(mem, cur);
    }
    min
}

/// Size of the largest free segment, or 0 if none are free.
pub(crate) fn max_free_size(mem: &Memory) -> u32 {
    let mut max = 0;
    let mut cur = 0;
    while cur != NON_FREE_SEGMENT {
        if is_free(mem, cur) && size(mem, cur) > max {
            max = size(mem, cur);
        }
        cur = next_free(mem, cur);
    }
    max
}

impl Heap {
    /// Finds a free segment that satisfies the request and either takes it
    /// whole or splits it in two. Returns the user address (just past the
    /// segment header), or 0 if the heap cannot grow enough.
    ///
    /// The search is first-fit over the free list; closest-fit via a
    /// size-keyed search tree is a pending improvement.
    pub(crate) fn allocate_segment(&mut self, request: u32) -> u32 {
        // If the heap itself is smaller than the request, growing is the
        // only option; resize before searching.
        let mut heap_size = self.memory.byte_size();
        let mut left = layout::left_sentinel_size(heap_size);
        let mut right = layout::right_sentinel_size(heap_size);
        if request > heap_size - left - right {
            loop {
                heap_size = heap_size.saturating_mul(2);
                left = layout::left_sentinel_size(heap_size);
                right = layout::right_sentinel_size(heap_size);
                if heap_size >= request.saturating_sub(left + right) {
                    break;
                }
            }
            if !self.try_extend_memory(heap_size) {
                return 0;
            }
        }

        let rounded = (request + SEGMENT_HEADER_SIZE).div_ceil(PAGE_SIZE) * PAGE_SIZE;
        let right_sentinel = right_sentinel(&self.memory);
        let mut address = next_free(&self.memory, left_sentinel());
        while address != right_sentinel {
            let mut seg_size = size(&self.memory, address);
            // Both sizes are page multiples, so the header does not need to
            // be deducted from seg_size here.
            if seg_size >= rounded {
                // Peel off the tail of the segment, rounded up to pages.
                let result = address + seg_size - rounded;
                seg_size -= rounded;
                if seg_size > 0 {
                    // Split: the head stays free, the tail is the result.
                    let successor = next(&self.memory, address);
                    init(
                        &mut self.memory,
                        result,
                        NON_FREE_SEGMENT,
                        NON_FREE_SEGMENT,
                        successor,
                        address,
                    );
                    set_next(&mut self.memory, address, result);
                    set_prev(&mut self.memory, successor, result);
                } else {
                    // The whole segment serves the request; unlink it from
                    // the free list.
                    let fprev = prev_free(&self.memory, address);
                    let fnext = next_free(&self.memory, address);
                    set_next_free(&mut self.memory, fprev, fnext);
                    set_prev_free(&mut self.memory, fnext, fprev);
                    set_next_free(&mut self.memory, result, NON_FREE_SEGMENT);
                    set_prev_free(&mut self.memory, result, NON_FREE_SEGMENT);
                }
                self.set_alloc_bit(result, true);
                return result + SEGMENT_HEADER_SIZE;
            }
            address = next_free(&self.memory, address);
        }

        // No free segment fits; double the heap and retry.
        if self.try_extend_memory(self.memory.byte_size().saturating_mul(2)) {
            return self.allocate_segment(request);
        }
        debug!("segment allocation of {request} bytes failed, heap cannot grow");
        0
    }

    /// Frees the segment at `address` (a page-aligned segment start) and
    /// coalesces it with free neighbors. Invalid addresses are ignored.
    pub(crate) fn free_segment(&mut self, address: u32) {
        // Sentinels are never freed.
        if address == left_sentinel() || address == right_sentinel(&self.memory) {
            return;
        }
        // The page bitset decides whether this is a live segment start.
        if !self.alloc_bit(address) {
            return;
        }
        // Bucket segments belong to the allocator and cannot be freed by
        // user programs.
        if is_bucket(&self.memory, address) {
            return;
        }

        let successor = next(&self.memory, address);
        let predecessor = prev(&self.memory, address);
        let next_is_free = is_free(&self.memory, successor);
        let prev_is_free = is_free(&self.memory, predecessor);
        self.set_alloc_bit(address, false);

        if next_is_free && prev_is_free {
            // Both neighbors are free (so neither is a sentinel): merge all
            // three into the predecessor and skip the successor's free-list
            // node.
            let after = next(&self.memory, successor);
            set_next(&mut self.memory, predecessor, after);
            set_prev(&mut self.memory, after, predecessor);

            let after_free = next_free(&self.memory, successor);
            set_next_free(&mut self.memory, predecessor, after_free);
            set_prev_free(&mut self.memory, after_free, predecessor);
        } else if next_is_free {
            // Only the successor is free: absorb it, and take over its
            // position in the free list.
            let after = next(&self.memory, successor);
            set_next(&mut self.memory, address, after);
            set_prev(&mut self.memory, after, address);

            let after_free = next_free(&self.memory, successor);
            let before_free = prev_free(&self.memory, successor);
            set_next_free(&mut self.memory, address, after_free);
            set_prev_free(&mut self.memory, after_free, address);
            set_prev_free(&mut self.memory, address, before_free);
            set_next_free(&mut self.memory, before_free, address);
        } else if prev_is_free {
            // Only the predecessor is free: it simply grows over this
            // segment. Its free-list node stays valid, so the free list is
            // untouched.
            set_next(&mut self.memory, predecessor, successor);
            set_prev(&mut self.memory, successor, predecessor);
        } else {
            // Neither neighbor is free: this segment becomes a standalone
            // free-list entry. Locate its position by walking backward to
            // the nearest free segment (possibly the left sentinel).
            let preceding = find_preceding_free(&self.memory, address);
            let subsequent = next_free(&self.memory, preceding);
            set_next_free(&mut self.memory, preceding, address);
            set_prev_free(&mut self.memory, address, preceding);
            set_next_free(&mut self.memory, address, subsequent);
            set_prev_free(&mut self.memory, subsequent, address);
        }
    }

    /// Size of the smallest free segment, or 0 if none are free. O(n) scan.
    pub fn min_free_size(&self) -> u32 {
        min_free_size(&self.memory)
    }

    /// Size of the largest free segment, or 0 if none are free. O(n) scan.
    pub fn max_free_size(&self) -> u32 {
        max_free_size(&self.memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;
    use crate::layout::{INITIAL_SIZE, MAX_FRAGMENT_SIZE};

    // 2000-byte requests round to two pages and bypass the bucket layer.
    const LARGE: u64 = 2000;
    const LARGE_SEGMENT: u32 = 2048;

    #[test]
    fn test_large_allocation_is_header_past_page_boundary() {
        let mut heap = Heap::new();
        assert!(LARGE > u64::from(MAX_FRAGMENT_SIZE));
        let q = heap.allocate(LARGE);
        assert_ne!(q, 0);
        assert_eq!((q as u32 - SEGMENT_HEADER_SIZE) & layout::PAGE_SIZE_MASK, 0);
    }

    #[test]
    fn test_initial_free_span() {
        let heap = Heap::new();
        let body = INITIAL_SIZE
            - layout::left_sentinel_size(INITIAL_SIZE)
            - layout::right_sentinel_size(INITIAL_SIZE);
        assert_eq!(heap.min_free_size(), body);
        assert_eq!(heap.max_free_size(), body);
    }

    #[test]
    fn test_tail_peel_allocates_descending_adjacent_segments() {
        let mut heap = Heap::new();
        let a = heap.allocate(LARGE) as u32;
        let b = heap.allocate(LARGE) as u32;
        let c = heap.allocate(LARGE) as u32;
        assert_eq!(a - b, LARGE_SEGMENT);
        assert_eq!(b - c, LARGE_SEGMENT);
    }

    #[test]
    fn test_coalescing_middle_then_right_then_left() {
        let mut heap = Heap::new();
        let before = heap.max_free_size();
        let a = heap.allocate(LARGE);
        let b = heap.allocate(LARGE);
        let c = heap.allocate(LARGE);
        let heap_size = heap.byte_size();

        // B has allocated neighbors (standalone insert), A merges into the
        // grown B-span on its left, C merges with free runs on both sides.
        heap.free(b);
        heap.free(a);
        heap.free(c);

        // Everything coalesced back into a single free span.
        assert_eq!(heap.min_free_size(), before);
        assert_eq!(heap.max_free_size(), before);

        // A request covering all three blocks fits without growing.
        let big = heap.allocate(3 * u64::from(LARGE_SEGMENT) - u64::from(SEGMENT_HEADER_SIZE));
        assert_ne!(big, 0);
        assert_eq!(heap.byte_size(), heap_size);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_coalescing_with_free_successor() {
        let mut heap = Heap::new();
        let before = heap.max_free_size();
        let a = heap.allocate(LARGE);
        let b = heap.allocate(LARGE);
        let c = heap.allocate(LARGE);

        heap.free(a); // both neighbors allocated
        heap.free(b); // successor (A's segment) is free, predecessor is not
        heap.free(c); // both neighbors free

        assert_eq!(heap.min_free_size(), before);
        assert_eq!(heap.max_free_size(), before);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_freed_segment_is_reused() {
        let mut heap = Heap::new();
        let a = heap.allocate(LARGE);
        heap.free(a);
        assert_eq!(heap.allocate(LARGE), a);
    }

    #[test]
    fn test_exact_fit_consumes_whole_segment() {
        let mut heap = Heap::new();
        let body = heap.max_free_size();
        // Request the entire body span, which exercises the
        // unlink-without-split path.
        let x = heap.allocate(u64::from(body - SEGMENT_HEADER_SIZE));
        assert_eq!(x as u32, layout::PAGE_SIZE + SEGMENT_HEADER_SIZE);
        assert_eq!(heap.byte_size(), INITIAL_SIZE);
        assert_eq!(heap.min_free_size(), 0);
        heap.free(x);
        assert_eq!(heap.max_free_size(), body);
        heap.check_invariants().unwrap();
    }
}
