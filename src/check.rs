//! Heap consistency checking.
//!
//! [`Heap::check_invariants`] walks every internal structure (the segment
//! chain, the free-segment list, each bucket's fragment free list, and the
//! per-rank free-bucket lists) and reports the first inconsistency found.
//! It is meant for tests and for validating loaded dump images; it never
//! mutates the heap.

use fixedbitset::FixedBitSet;
use thiserror::Error;

use crate::heap::Heap;
use crate::layout::{
    self, BUCKET_HEADER_SIZE, FREE_LIST_NULL, MAX_BUCKET_FRAGMENTS, MIN_FRAGMENT_SIZE_EXPONENT,
    NON_FREE_SEGMENT, PAGE_SIZE_EXPONENT, PAGE_SIZE_MASK, SEGMENT_HEADER_SIZE,
};
use crate::{bucket, segment};

/// A heap structure inconsistency, or a rejected dump image.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("left sentinel header is corrupt")]
    BadLeftSentinel,

    #[error("segment chain corrupt at {address:#x}: {reason}")]
    SegmentChainCorrupted { address: u32, reason: &'static str },

    #[error("free-segment list corrupt at {address:#x}: {reason}")]
    FreeListCorrupted { address: u32, reason: &'static str },

    #[error("bucket {bucket:#x}: fragment free list is cyclic")]
    CyclicFragmentList { bucket: u32 },

    #[error("bucket {bucket:#x}: free-list entry {offset:#x} is out of bounds")]
    FragmentOutOfBounds { bucket: u32, offset: u16 },

    #[error("bucket {bucket:#x}: free-list entry {offset:#x} is misaligned")]
    MisalignedFreeListEntry { bucket: u32, offset: u16 },

    #[error("bucket {bucket:#x}: free-list entry {offset:#x} is marked allocated")]
    FreeFragmentMarkedAllocated { bucket: u32, offset: u16 },

    #[error("bucket {bucket:#x}: free list has {listed} entries but the free count is {counted}")]
    FreeCountMismatch { bucket: u32, listed: u32, counted: u32 },

    #[error("rank {rank} free-bucket list is cyclic at {bucket:#x}")]
    CyclicBucketList { rank: u32, bucket: u32 },

    #[error("rank {rank} free-bucket list corrupt at {bucket:#x}: {reason}")]
    BucketListCorrupted {
        rank: u32,
        bucket: u32,
        reason: &'static str,
    },

    #[error("dump truncated: need {expected} bytes, got {actual}")]
    TruncatedDump { expected: usize, actual: usize },

    #[error("dump malformed: {reason}")]
    MalformedDump { reason: &'static str },
}

impl Heap {
    /// Verifies every internal invariant and returns the first violation.
    pub fn check_invariants(&self) -> Result<(), CheckError> {
        let mem = &self.memory;
        let size = self.byte_size();
        let right = segment::right_sentinel(mem);
        let page_count = self.page_count();

        if segment::prev(mem, 0) != 0
            || segment::prev_free(mem, 0) != NON_FREE_SEGMENT
            || segment::next(mem, 0) != layout::left_sentinel_size(size)
            || !self.alloc_bit(0)
        {
            return Err(CheckError::BadLeftSentinel);
        }

        // Segment chain: strictly ascending, page-aligned, consistent back
        // links. Each segment covers at least one page, so a walk longer
        // than the page count means the chain loops.
        let mut bucket_segments = Vec::new();
        let mut cur = 0;
        let mut steps = 0;
        while cur != right {
            steps += 1;
            if steps > page_count {
                return Err(CheckError::SegmentChainCorrupted {
                    address: cur,
                    reason: "chain is longer than the page count",
                });
            }
            let next = segment::next(mem, cur);
            if next <= cur || next > right || next & PAGE_SIZE_MASK != 0 {
                return Err(CheckError::SegmentChainCorrupted {
                    address: cur,
                    reason: "next pointer is out of order",
                });
            }
            if segment::prev(mem, next) != cur {
                return Err(CheckError::SegmentChainCorrupted {
                    address: next,
                    reason: "prev pointer does not match its predecessor",
                });
            }
            if segment::is_bucket(mem, cur) {
                if !self.alloc_bit(cur) {
                    return Err(CheckError::SegmentChainCorrupted {
                        address: cur,
                        reason: "bucket page is not marked allocated",
                    });
                }
                bucket_segments.push(cur);
            } else if cur != 0 && segment::is_free(mem, cur) && self.alloc_bit(cur) {
                return Err(CheckError::FreeListCorrupted {
                    address: cur,
                    reason: "free segment is marked allocated",
                });
            }
            cur = next;
        }
        if segment::next(mem, right) != size
            || segment::next_free(mem, right) != NON_FREE_SEGMENT
            || !self.alloc_bit(right)
        {
            return Err(CheckError::SegmentChainCorrupted {
                address: right,
                reason: "right sentinel header is corrupt",
            });
        }

        // Free-segment list: anchored at the left sentinel, terminated at
        // the right sentinel, back links matching, no repeats.
        let mut visited = FixedBitSet::with_capacity(page_count as usize);
        let mut prev_entry = 0u32;
        let mut cur = segment::next_free(mem, 0);
        loop {
            if cur == NON_FREE_SEGMENT {
                return Err(CheckError::FreeListCorrupted {
                    address: prev_entry,
                    reason: "list does not reach the right sentinel",
                });
            }
            if cur > right || cur & PAGE_SIZE_MASK != 0 {
                return Err(CheckError::FreeListCorrupted {
                    address: cur,
                    reason: "free link points outside the heap",
                });
            }
            let page = (cur >> PAGE_SIZE_EXPONENT) as usize;
            if visited.contains(page) {
                return Err(CheckError::FreeListCorrupted {
                    address: cur,
                    reason: "list is cyclic",
                });
            }
            visited.insert(page);
            if segment::prev_free(mem, cur) != prev_entry {
                return Err(CheckError::FreeListCorrupted {
                    address: cur,
                    reason: "prev_free does not match its predecessor",
                });
            }
            if cur == right {
                break;
            }
            if !segment::is_free(mem, cur) {
                return Err(CheckError::FreeListCorrupted {
                    address: cur,
                    reason: "allocated segment on the free list",
                });
            }
            prev_entry = cur;
            cur = segment::next_free(mem, cur);
        }

        // Per-rank free-bucket lists, with the set of listed buckets kept
        // for the exactness check below.
        let mut listed = FixedBitSet::with_capacity(page_count as usize);
        for (rank, list) in self.free_buckets.iter().enumerate() {
            let rank = rank as u32;
            let mut visited = FixedBitSet::with_capacity(page_count as usize);
            let mut prev_bucket = 0u32;
            let mut cur = list.head;
            while cur != 0 {
                let segment_address = cur.wrapping_sub(SEGMENT_HEADER_SIZE);
                if cur > right || segment_address & PAGE_SIZE_MASK != 0 {
                    return Err(CheckError::BucketListCorrupted {
                        rank,
                        bucket: cur,
                        reason: "link points outside the heap",
                    });
                }
                if !segment::is_bucket(mem, segment_address) {
                    return Err(CheckError::BucketListCorrupted {
                        rank,
                        bucket: cur,
                        reason: "listed page is not a bucket",
                    });
                }
                let page = (cur >> PAGE_SIZE_EXPONENT) as usize;
                if visited.contains(page) {
                    return Err(CheckError::CyclicBucketList { rank, bucket: cur });
                }
                visited.insert(page);
                if bucket::fragment_size_exponent(mem, cur) - MIN_FRAGMENT_SIZE_EXPONENT != rank {
                    return Err(CheckError::BucketListCorrupted {
                        rank,
                        bucket: cur,
                        reason: "bucket has a different rank",
                    });
                }
                if bucket::free_count(mem, cur) == 0 {
                    return Err(CheckError::BucketListCorrupted {
                        rank,
                        bucket: cur,
                        reason: "full bucket on the free-bucket list",
                    });
                }
                if bucket::prev(mem, cur) != prev_bucket {
                    return Err(CheckError::BucketListCorrupted {
                        rank,
                        bucket: cur,
                        reason: "prev does not match its predecessor",
                    });
                }
                listed.insert(page);
                prev_bucket = cur;
                cur = bucket::next(mem, cur);
            }
            if list.tail != prev_bucket {
                return Err(CheckError::BucketListCorrupted {
                    rank,
                    bucket: list.tail,
                    reason: "tail does not match the last list entry",
                });
            }
        }

        // Every bucket is internally consistent, and sits on its rank's
        // list exactly when it has free fragments.
        for segment_address in bucket_segments {
            let bucket_address = segment_address + SEGMENT_HEADER_SIZE;
            self.check_bucket(bucket_address)?;
            let on_list = listed.contains((bucket_address >> PAGE_SIZE_EXPONENT) as usize);
            let has_free = bucket::free_count(mem, bucket_address) > 0;
            if on_list != has_free {
                return Err(CheckError::BucketListCorrupted {
                    rank: bucket::fragment_size_exponent(mem, bucket_address)
                        - MIN_FRAGMENT_SIZE_EXPONENT,
                    bucket: bucket_address,
                    reason: if has_free {
                        "bucket with free fragments is not listed"
                    } else {
                        "full bucket is listed"
                    },
                });
            }
        }
        Ok(())
    }

    /// Walks one bucket's fragment free list and verifies it against the
    /// header fields and the allocation bitset.
    fn check_bucket(&self, bucket: u32) -> Result<(), CheckError> {
        let mem = &self.memory;
        let exponent = bucket::fragment_size_exponent(mem, bucket);
        let area_size = bucket::fragment_count(mem, bucket) << exponent;
        let fragment_mask = (1u32 << exponent) - 1;
        let area = bucket + BUCKET_HEADER_SIZE;

        let mut visited = FixedBitSet::with_capacity(MAX_BUCKET_FRAGMENTS as usize);
        let mut len = 0;
        let mut offset = bucket::free_list(mem, bucket);
        while offset != FREE_LIST_NULL {
            if u32::from(offset) >= area_size {
                return Err(CheckError::FragmentOutOfBounds { bucket, offset });
            }
            if u32::from(offset) & fragment_mask != 0 {
                return Err(CheckError::MisalignedFreeListEntry { bucket, offset });
            }
            let index = (u32::from(offset) >> exponent) as usize;
            if visited.contains(index) {
                return Err(CheckError::CyclicFragmentList { bucket });
            }
            visited.insert(index);
            if bucket::alloc_bit(mem, bucket, index as u32) {
                return Err(CheckError::FreeFragmentMarkedAllocated { bucket, offset });
            }
            len += 1;
            offset = bucket::next_free_fragment(mem, area, offset);
        }
        let counted = u32::from(bucket::free_count(mem, bucket));
        if len != counted {
            return Err(CheckError::FreeCountMismatch {
                bucket,
                listed: len,
                counted,
            });
        }
        Ok(())
    }
}
