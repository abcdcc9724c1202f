//! A dynamic memory allocator over a single growable flat byte buffer.
//!
//! Addresses handed out are plain integer offsets into the buffer, never
//! host pointers. Large requests are served as whole-page segments, small
//! ones as fixed-size fragments carved out of page-sized buckets. The heap
//! grows by doubling when a request cannot be satisfied; existing
//! addresses stay valid across growth.

pub(crate) mod bucket;
pub mod check;
pub mod heap;
pub mod layout;
pub mod memory;
pub(crate) mod segment;

pub use check::CheckError;
pub use heap::{Heap, HeapConfig};
pub use memory::Endian;

// layout constants clients commonly need
pub use layout::{MAX_FRAGMENT_SIZE, MAX_SIZE, PAGE_SIZE};
