//! Heap controller: owns the backing memory and the free-bucket side
//! table, routes requests between the segment and bucket layers, grows
//! the heap on demand, and exposes the public allocation surface.

use log::{debug, warn};

use crate::layout::{
    self, INITIAL_SIZE, MAX_FRAGMENT_SIZE, MAX_SIZE, NON_FREE_SEGMENT, PAGE_SIZE_EXPONENT,
    PAGE_SIZE_MASK, SEGMENT_HEADER_SIZE,
};
use crate::memory::{Endian, Memory};
use crate::check::CheckError;
use crate::{bucket, segment};

/// Configuration for a [`Heap`]. All fields have sensible defaults.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Starting heap size in bytes. Must be a power of two, at least
    /// 16 KiB, and at most `max_size`. Default: 64 KiB.
    pub initial_size: u32,

    /// Hard ceiling on heap growth. Default: 2 GiB (the full 32-bit
    /// address space the allocator hands out).
    pub max_size: u32,

    /// Byte order of the user-facing typed accessors. Default: little.
    pub endian: Endian,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            initial_size: INITIAL_SIZE,
            max_size: MAX_SIZE,
            endian: Endian::Little,
        }
    }
}

/// Head and tail of one rank's free-bucket list. Kept outside heap memory;
/// 0 means "no bucket".
pub(crate) struct FreeBucketList {
    pub head: u32,
    pub tail: u32,
}

/// A single managed heap. Owns the flat byte buffer and the free-bucket
/// side table; callers hold a `Heap` handle rather than a global.
///
/// Single-threaded by design: every operation runs to completion and no
/// internal locking exists. Wrap the whole heap in a mutex if concurrent
/// callers are unavoidable.
pub struct Heap {
    pub(crate) memory: Memory,
    pub(crate) free_buckets: Vec<FreeBucketList>,
    max_size: u32,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Creates an empty heap with the default configuration.
    pub fn new() -> Self {
        Self::with_config(HeapConfig::default())
    }

    /// Creates an empty heap. Panics if the configuration is unusable
    /// (initial size not a power of two, too small to hold the sentinels,
    /// or above the maximum).
    pub fn with_config(config: HeapConfig) -> Self {
        let size = config.initial_size;
        assert!(size.is_power_of_two(), "initial size must be a power of two");
        // At least 16 pages: sentinels plus body, and a page count that
        // keeps the bitset whole bytes.
        assert!(size >= 1 << 14, "initial size must be at least 16 KiB");
        assert!(size <= config.max_size, "initial size exceeds max size");

        let mut free_buckets = Vec::new();
        let mut rank = 0;
        while bucket::fragment_size_for_rank(rank) <= MAX_FRAGMENT_SIZE {
            free_buckets.push(FreeBucketList { head: 0, tail: 0 });
            rank += 1;
        }

        let mut heap = Self {
            memory: Memory::new(size as usize, config.endian),
            free_buckets,
            max_size: config.max_size,
        };

        let left_size = layout::left_sentinel_size(size);
        let right_size = layout::right_sentinel_size(size);
        let right = size - right_size;

        // Left sentinel: allocated, but anchors the free list forward.
        segment::init(&mut heap.memory, 0, left_size, NON_FREE_SEGMENT, left_size, 0);
        // One free segment spans the whole body.
        segment::init(&mut heap.memory, left_size, right, 0, right, 0);
        // Right sentinel: allocated, anchors the free list backward, and
        // holds the page allocation bitset in its body.
        segment::init(&mut heap.memory, right, NON_FREE_SEGMENT, left_size, size, left_size);

        heap.set_alloc_bit(0, true);
        heap.set_alloc_bit(right, true);
        heap
    }

    /// Current heap size in bytes. Always a multiple of the page size.
    pub fn byte_size(&self) -> u32 {
        self.memory.byte_size()
    }

    /// Current heap size in pages.
    pub fn page_count(&self) -> u32 {
        self.byte_size() >> PAGE_SIZE_EXPONENT
    }

    /// Total page count of all free segments.
    pub fn free_page_count(&self) -> u32 {
        let mut cur = 0;
        let mut count = 0;
        while cur < self.byte_size() {
            if segment::is_free(&self.memory, cur) {
                count += segment::size(&self.memory, cur) >> PAGE_SIZE_EXPONENT;
            }
            cur = segment::next(&self.memory, cur);
        }
        count
    }

    // ---- page-level allocation bitset ----

    /// Sets or clears the allocation bit for the page at `address`, which
    /// must be page-aligned.
    pub(crate) fn set_alloc_bit(&mut self, address: u32, value: bool) {
        let bitset = segment::right_sentinel(&self.memory) + SEGMENT_HEADER_SIZE;
        let page_index = address >> PAGE_SIZE_EXPONENT;
        let byte_address = bitset + (page_index >> 3);
        let bit = 1u8 << (page_index & 7);
        let old = self.memory.byte(byte_address);
        self.memory
            .set_byte(byte_address, if value { old | bit } else { old & !bit });
    }

    /// Whether the page at `address` (page-aligned) starts an allocated
    /// segment.
    pub(crate) fn alloc_bit(&self, address: u32) -> bool {
        let bitset = segment::right_sentinel(&self.memory) + SEGMENT_HEADER_SIZE;
        let page_index = address >> PAGE_SIZE_EXPONENT;
        (self.memory.byte(bitset + (page_index >> 3)) >> (page_index & 7)) & 1 == 1
    }

    // ---- growth ----

    /// Grows the heap to `size` bytes, relocating the right sentinel and
    /// turning the reclaimed gap into free space. Returns false if `size`
    /// exceeds the maximum or the buffer allocation fails; the heap is
    /// unchanged in that case.
    pub(crate) fn try_extend_memory(&mut self, size: u32) -> bool {
        if size > self.max_size {
            warn!(
                "cannot grow heap to {size} bytes, maximum is {}",
                self.max_size
            );
            return false;
        }

        let old_size = self.memory.byte_size();
        let old_page_count = old_size >> PAGE_SIZE_EXPONENT;
        let old_right = segment::right_sentinel(&self.memory);
        if !self.memory.grow(size as usize) {
            warn!("backing buffer allocation of {size} bytes failed");
            return false;
        }
        debug!("heap grown from {old_size} to {size} bytes");

        let right_size = layout::right_sentinel_size(size);
        let right = size - right_size;

        // The old right sentinel is about to be deallocated. Link a fresh
        // free segment over the gap between the old end of memory and the
        // new right sentinel, then let the ordinary free path merge the
        // old sentinel's pages into it.
        let fresh = old_size;
        let before_free = segment::prev_free(&self.memory, old_right);
        segment::set_next_free(&mut self.memory, old_right, NON_FREE_SEGMENT);
        segment::set_prev_free(&mut self.memory, old_right, NON_FREE_SEGMENT);
        segment::set_next(&mut self.memory, old_right, fresh);
        segment::set_next_free(&mut self.memory, before_free, fresh);
        segment::init(&mut self.memory, fresh, right, before_free, right, old_right);
        segment::init(&mut self.memory, right, NON_FREE_SEGMENT, fresh, size, fresh);

        // Move the page bitset into the new right sentinel. The page count
        // is a multiple of 8, so whole bytes suffice.
        self.memory.copy_within(
            old_right + SEGMENT_HEADER_SIZE,
            right + SEGMENT_HEADER_SIZE,
            old_page_count / 8,
        );
        self.set_alloc_bit(right, true);

        // Free-bucket lists need no changes. The invariants hold now, so
        // the 4-case coalescer can absorb the old sentinel's pages.
        self.free_segment(old_right);
        true
    }

    // ---- allocation surface ----

    fn alloc(&mut self, size: u32) -> u32 {
        if size <= MAX_FRAGMENT_SIZE {
            self.allocate_fragment(size)
        } else {
            self.allocate_segment(size)
        }
    }

    fn dealloc(&mut self, user_address: u32) {
        if user_address >= self.byte_size() {
            // Outside the heap entirely.
            return;
        }
        let segment_address = user_address.wrapping_sub(SEGMENT_HEADER_SIZE);
        if segment_address & PAGE_SIZE_MASK == 0 {
            self.free_segment(segment_address);
        } else {
            // Not aligned to a segment start, so it can only be a fragment.
            self.free_fragment(user_address);
        }
    }

    /// Derives the usable size of the live block at `user_address`, fully
    /// validating the address. `None` for anything that is not the start
    /// of a currently allocated user block.
    fn live_block_size(&self, user_address: u32) -> Option<u32> {
        if user_address >= self.byte_size() {
            return None;
        }
        let segment_address = user_address.wrapping_sub(SEGMENT_HEADER_SIZE);
        if segment_address & PAGE_SIZE_MASK == 0 {
            // Segment path: must be an allocated, non-sentinel, non-bucket
            // segment start.
            if segment_address == segment::left_sentinel()
                || segment_address == segment::right_sentinel(&self.memory)
            {
                return None;
            }
            if !self.alloc_bit(segment_address) {
                return None;
            }
            if segment::is_bucket(&self.memory, segment_address) {
                return None;
            }
            Some(segment::size(&self.memory, segment_address) - SEGMENT_HEADER_SIZE)
        } else {
            // Fragment path: the enclosing page must hold a bucket and the
            // offset must name an allocated, aligned fragment.
            let segment_address = user_address & !PAGE_SIZE_MASK;
            if !segment::is_bucket(&self.memory, segment_address) {
                return None;
            }
            let bucket_address = segment_address + SEGMENT_HEADER_SIZE;
            let area = bucket_address + layout::BUCKET_HEADER_SIZE;
            let exponent = bucket::fragment_size_exponent(&self.memory, bucket_address);
            let fragment_size = 1u32 << exponent;
            let offset = user_address.wrapping_sub(area);
            if offset >= bucket::fragment_count(&self.memory, bucket_address) << exponent {
                return None;
            }
            if offset & (fragment_size - 1) != 0 {
                return None;
            }
            if !bucket::alloc_bit(&self.memory, bucket_address, offset >> exponent) {
                return None;
            }
            Some(fragment_size)
        }
    }

    fn realloc(&mut self, user_address: u32, new_size: u32) -> u32 {
        if user_address == 0 {
            return self.alloc(new_size);
        }
        // Validate and size the old block first, so invalid input returns
        // 0 with no side effects. In-place extension is not attempted.
        let Some(old_size) = self.live_block_size(user_address) else {
            return 0;
        };
        let new_address = self.alloc(new_size);
        if new_address == 0 {
            return 0;
        }
        self.memory
            .copy_within(user_address, new_address, old_size.min(new_size));
        self.dealloc(user_address);
        new_address
    }

    /// Allocates `size` bytes and returns the block address, or 0 on
    /// failure (out of memory, or `size` exceeds the 32-bit range).
    pub fn allocate(&mut self, size: u64) -> u64 {
        if size >> 32 != 0 {
            return 0;
        }
        u64::from(self.alloc(size as u32))
    }

    /// Resizes the block at `address` by allocating a fresh block, copying
    /// the overlap, and freeing the old one. Returns the new address, or 0
    /// on failure or invalid input (in which case nothing changed).
    /// `address == 0` behaves as a plain allocation.
    pub fn reallocate(&mut self, address: u64, new_size: u64) -> u64 {
        if new_size >> 32 != 0 || address >> 32 != 0 {
            return 0;
        }
        u64::from(self.realloc(address as u32, new_size as u32))
    }

    /// Frees the block at `address`. Invalid addresses (bad alignment,
    /// not allocated, allocator-owned, sentinel, out of range) are
    /// silently ignored, mirroring native allocator semantics.
    pub fn free(&mut self, address: u64) {
        if address >> 32 != 0 {
            // No address in this range is ever handed out.
            return;
        }
        self.dealloc(address as u32);
    }

    // ---- typed raw access ----

    /// Narrows a 64-bit address to the 32-bit heap range. Panics if the
    /// high bits are set; raw access has no graceful failure mode.
    fn narrow(address: u64) -> u32 {
        assert!(
            address >> 32 == 0,
            "address {address:#x} is outside the 32-bit heap range"
        );
        address as u32
    }

    pub fn read_byte(&self, address: u64) -> i8 {
        self.memory.get_i8(Self::narrow(address))
    }

    pub fn write_byte(&mut self, address: u64, value: i8) {
        self.memory.set_i8(Self::narrow(address), value);
    }

    pub fn read_char(&self, address: u64) -> u16 {
        self.memory.get_u16(Self::narrow(address))
    }

    pub fn write_char(&mut self, address: u64, value: u16) {
        self.memory.set_u16(Self::narrow(address), value);
    }

    pub fn read_short(&self, address: u64) -> i16 {
        self.memory.get_i16(Self::narrow(address))
    }

    pub fn write_short(&mut self, address: u64, value: i16) {
        self.memory.set_i16(Self::narrow(address), value);
    }

    pub fn read_int(&self, address: u64) -> i32 {
        self.memory.get_i32(Self::narrow(address))
    }

    pub fn write_int(&mut self, address: u64, value: i32) {
        self.memory.set_i32(Self::narrow(address), value);
    }

    pub fn read_long(&self, address: u64) -> i64 {
        self.memory.get_i64(Self::narrow(address))
    }

    pub fn write_long(&mut self, address: u64, value: i64) {
        self.memory.set_i64(Self::narrow(address), value);
    }

    pub fn read_float(&self, address: u64) -> f32 {
        self.memory.get_f32(Self::narrow(address))
    }

    pub fn write_float(&mut self, address: u64, value: f32) {
        self.memory.set_f32(Self::narrow(address), value);
    }

    pub fn read_double(&self, address: u64) -> f64 {
        self.memory.get_f64(Self::narrow(address))
    }

    pub fn write_double(&mut self, address: u64, value: f64) {
        self.memory.set_f64(Self::narrow(address), value);
    }

    // ---- snapshot / restore ----

    /// Serializes the full heap state for offline inspection: the 32-bit
    /// byte length, the raw buffer, then the free-bucket side table as
    /// (head, tail) pairs. All fixed-width fields are big-endian.
    pub fn dump(&self) -> Vec<u8> {
        let size = self.byte_size();
        let mut out = Vec::with_capacity(4 + size as usize + 8 * self.free_buckets.len());
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(self.memory.as_bytes());
        for list in &self.free_buckets {
            out.extend_from_slice(&list.head.to_be_bytes());
            out.extend_from_slice(&list.tail.to_be_bytes());
        }
        out
    }

    /// Reconstructs a heap from a [`dump`](Self::dump) blob, using the
    /// default maximum size and endianness.
    pub fn load(blob: &[u8]) -> Result<Self, CheckError> {
        if blob.len() < 4 {
            return Err(CheckError::TruncatedDump {
                expected: 4,
                actual: blob.len(),
            });
        }
        let size = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        let expected = 4 + size;
        if blob.len() < expected {
            return Err(CheckError::TruncatedDump {
                expected,
                actual: blob.len(),
            });
        }
        if size % layout::PAGE_SIZE as usize != 0 {
            return Err(CheckError::MalformedDump {
                reason: "byte length is not a page multiple",
            });
        }
        let table = &blob[expected..];
        if table.len() % 8 != 0 {
            return Err(CheckError::MalformedDump {
                reason: "free-bucket table is not a whole number of pairs",
            });
        }
        let bytes = blob[4..expected].to_vec();
        let free_buckets = table
            .chunks_exact(8)
            .map(|pair| FreeBucketList {
                head: u32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]),
                tail: u32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]),
            })
            .collect();
        Ok(Self {
            memory: Memory::from_bytes(bytes, Endian::Little),
            free_buckets,
            max_size: MAX_SIZE,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_allocation_scenario() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        assert_ne!(p, 0);
        heap.write_int(p, 0x11223344);
        assert_eq!(heap.read_int(p), 0x11223344);
        heap.free(p);
        assert_eq!(heap.allocate(10), p);
    }

    #[test]
    fn test_high_bits_are_rejected_without_side_effects() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        heap.write_int(p, 42);
        let before = heap.dump();

        assert_eq!(heap.allocate(0xFFFF_FFFF_0000_0000 | 10), 0);
        assert_eq!(heap.reallocate(p, 0x1_0000_0000), 0);
        assert_eq!(heap.reallocate(0xAAAA_0000_0000_0000 | p, 16), 0);
        heap.free(0x5555_0000_0000_0000 | p);

        assert_eq!(heap.dump(), before);
        assert_eq!(heap.read_int(p), 42);
    }

    #[test]
    fn test_steady_state_churn_does_not_grow_the_heap() {
        let mut heap = Heap::new();
        let size_before = heap.byte_size();
        for _ in 0..1000 {
            let p = heap.allocate(48);
            assert_ne!(p, 0);
            heap.free(p);
        }
        for _ in 0..1000 {
            let p = heap.allocate(2000);
            assert_ne!(p, 0);
            heap.free(p);
        }
        assert_eq!(heap.byte_size(), size_before);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_growth_preserves_live_data() {
        let mut heap = Heap::new();
        let p = heap.allocate(4096);
        assert_ne!(p, 0);
        for i in 0..1024 {
            heap.write_int(p + 4 * i, i as i32 ^ 0x5a5a);
        }
        let size_before = heap.byte_size();

        // Larger than the remaining free capacity: forces growth.
        let q = heap.allocate(100_000);
        assert_ne!(q, 0);
        assert!(heap.byte_size() > size_before);

        for i in 0..1024 {
            assert_eq!(heap.read_int(p + 4 * i), i as i32 ^ 0x5a5a);
        }
        heap.check_invariants().unwrap();

        // Both blocks remain independently writable.
        heap.write_long(q, -1);
        assert_eq!(heap.read_long(q), -1);
        heap.free(q);
        heap.free(p);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_growth_stops_at_max_size() {
        let mut heap = Heap::with_config(HeapConfig {
            initial_size: 1 << 14,
            max_size: 1 << 16,
            endian: Endian::Little,
        });
        // Fits after one doubling.
        let p = heap.allocate(20_000);
        assert_ne!(p, 0);
        assert_eq!(heap.byte_size(), 1 << 15);
        // Can never fit.
        assert_eq!(heap.allocate(1 << 20), 0);
        assert_eq!(heap.byte_size(), 1 << 15);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_zero_address_allocates() {
        let mut heap = Heap::new();
        let p = heap.reallocate(0, 100);
        assert_ne!(p, 0);
        heap.free(p);
    }

    #[test]
    fn test_reallocate_copies_and_frees() {
        let mut heap = Heap::new();
        let p = heap.allocate(100);
        for i in 0..25 {
            heap.write_int(p + 4 * i, i as i32);
        }
        let q = heap.reallocate(p, 3000);
        assert_ne!(q, 0);
        assert_ne!(q, p);
        for i in 0..25 {
            assert_eq!(heap.read_int(q + 4 * i), i as i32);
        }
        // The old fragment was freed and is handed out again.
        assert_eq!(heap.allocate(100), p);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_truncates_to_new_size() {
        let mut heap = Heap::new();
        let p = heap.allocate(2000);
        heap.write_int(p, 1234);
        heap.write_int(p + 996, 5678);
        let q = heap.reallocate(p, 1000);
        assert_ne!(q, 0);
        assert_eq!(heap.read_int(q), 1234);
        assert_eq!(heap.read_int(q + 996), 5678);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_invalid_address_has_no_side_effects() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        let before = heap.dump();
        // Misaligned fragment pointer.
        assert_eq!(heap.reallocate(p + 4, 64), 0);
        // Interior of a sentinel page.
        assert_eq!(heap.reallocate(24, 64), 0);
        // Page-aligned address in a free region.
        assert_eq!(heap.reallocate(u64::from(2 * layout::PAGE_SIZE + SEGMENT_HEADER_SIZE), 64), 0);
        assert_eq!(heap.dump(), before);
    }

    #[test]
    fn test_free_of_sentinels_and_buckets_is_ignored() {
        let mut heap = Heap::new();
        let p = heap.allocate(10);
        let bucket_page = u64::from((p as u32) & !PAGE_SIZE_MASK);

        // Left sentinel, right sentinel, bucket-owned segment.
        heap.free(u64::from(SEGMENT_HEADER_SIZE));
        let right = segment::right_sentinel(&heap.memory);
        heap.free(u64::from(right + SEGMENT_HEADER_SIZE));
        heap.free(bucket_page + u64::from(SEGMENT_HEADER_SIZE));

        // The fragment inside the bucket is untouched.
        heap.write_int(p, 9);
        assert_eq!(heap.read_int(p), 9);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_segment_double_free_is_noop() {
        let mut heap = Heap::new();
        let a = heap.allocate(2000);
        let b = heap.allocate(2000);
        heap.free(a);
        heap.free(a);
        heap.check_invariants().unwrap();
        heap.free(b);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_allocate_zero_fails_cleanly() {
        let mut heap = Heap::new();
        assert_eq!(heap.allocate(0), 0);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_no_overlap_across_mixed_workload() {
        let mut heap = Heap::new();
        let mut live: Vec<(u64, u64)> = Vec::new();
        let sizes = [1u64, 16, 17, 100, 512, 513, 2000, 5000];
        for (i, &size) in sizes.iter().cycle().take(64).enumerate() {
            let p = heap.allocate(size);
            assert_ne!(p, 0);
            live.push((p, size));
            if i % 3 == 0 {
                let (q, _) = live.remove(live.len() / 2);
                heap.free(q);
            }
        }
        for (i, &(a, asize)) in live.iter().enumerate() {
            for &(b, bsize) in &live[i + 1..] {
                assert!(
                    a + asize <= b || b + bsize <= a,
                    "blocks {a:#x}+{asize} and {b:#x}+{bsize} overlap"
                );
            }
        }
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_dump_load_round_trip() {
        let mut heap = Heap::new();
        let p = heap.allocate(100);
        heap.write_int(p, 0x0badf00d_u32 as i32);
        let q = heap.allocate(3000);
        heap.free(q);

        let blob = heap.dump();
        let mut restored = Heap::load(&blob).unwrap();
        assert_eq!(restored.dump(), blob);
        restored.check_invariants().unwrap();

        // The restored heap is live: data readable, allocation works.
        assert_eq!(restored.read_int(p), 0x0badf00d_u32 as i32);
        let r = restored.allocate(10);
        assert_ne!(r, 0);
        restored.check_invariants().unwrap();
    }
}
