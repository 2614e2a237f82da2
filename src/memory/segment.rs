//! The mapping behind an endpoint.

use rustix::fd::BorrowedFd;
use std::ptr::NonNull;

/// Where an endpoint's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backing {
    /// Process-private heap. Every peer must share this address space.
    Heap,
    /// memfd mapping, attachable from another process by fd passing.
    Memfd,
}

/// A fixed-size, zero-initialized, writable mapping.
///
/// Endpoint code never touches a segment directly; it goes through
/// [`SharedRegion`](super::SharedRegion), which bounds-checks every offset.
///
/// # Safety
///
/// Implementations must keep `base()` valid for `len()` bytes, 8-byte
/// aligned, for as long as the segment is alive.
pub trait MemorySegment: Send + Sync {
    /// Start of the mapping.
    fn base(&self) -> NonNull<u8>;

    /// Size in bytes.
    fn len(&self) -> usize;

    /// Backing kind.
    fn backing(&self) -> Backing;

    /// The fd to send to a process that wants to attach this mapping.
    fn shared_fd(&self) -> Option<BorrowedFd<'_>> {
        None
    }
}
