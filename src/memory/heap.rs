use super::{Backing, MemorySegment};
use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::ptr::NonNull;

/// Endpoint memory on the heap, for endpoints whose peers all run in this
/// process.
///
/// Stored as `u64` words so every flag offset that is a multiple of 4 is
/// aligned for an atomic view.
pub struct HeapSegment {
    words: Box<[UnsafeCell<u64>]>,
    len: usize,
}

impl HeapSegment {
    /// Allocate `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AllocationFailed`] for an empty segment.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("endpoint memory cannot be empty".into()));
        }
        let words = (0..size.div_ceil(8)).map(|_| UnsafeCell::new(0)).collect();
        Ok(Self { words, len: size })
    }
}

impl MemorySegment for HeapSegment {
    fn base(&self) -> NonNull<u8> {
        // The slice is never empty, so the pointer is non-null.
        let ptr = UnsafeCell::raw_get(self.words.as_ptr()).cast::<u8>();
        NonNull::new(ptr).unwrap_or(NonNull::dangling())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn backing(&self) -> Backing {
        Backing::Heap
    }
}

// SAFETY: bytes are only reached through raw pointers, and the flag protocol
// on top orders every cross-thread access.
unsafe impl Send for HeapSegment {}
unsafe impl Sync for HeapSegment {}
