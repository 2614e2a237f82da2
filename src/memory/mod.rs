//! Memory backing for endpoints.
//!
//! # Architecture
//!
//! - [`MemorySegment`]: the mapping behind an endpoint ([`HeapSegment`],
//!   [`MemfdSegment`])
//! - [`SharedRegion`]: bounds-checked handle used for every access into an
//!   endpoint, including the atomic flag words of the buffer protocol
//! - [`OffsetAllocator`]: bump allocator carving ports and control blocks out
//!   of a region
//! - [`ipc`]: `SCM_RIGHTS` fd passing to attach an endpoint from another process
//!
//! # Example
//!
//! ```rust
//! use conduit::memory::{HeapSegment, OffsetAllocator, SharedRegion};
//!
//! let region = SharedRegion::new(HeapSegment::new(4096).unwrap());
//! let mut alloc = OffsetAllocator::new(region.len() as u64);
//! let flag = alloc.alloc(4, 4).unwrap();
//! region.store_flag(flag, 1).unwrap();
//! assert_eq!(region.load_flag(flag).unwrap(), 1);
//! ```

mod allocator;
mod bitmap;
mod heap;
pub mod ipc;
mod memfd;
mod region;
mod segment;

pub use allocator::{DEFAULT_ALIGN, OffsetAllocator};
pub use bitmap::AtomicBitmap;
pub use heap::HeapSegment;
pub use memfd::MemfdSegment;
pub use region::SharedRegion;
pub use segment::{Backing, MemorySegment};
