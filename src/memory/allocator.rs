//! Bump allocator carving control structures and port memory out of an endpoint.

use crate::error::{Error, Result};

/// Default alignment for allocations that do not ask for one.
pub const DEFAULT_ALIGN: u64 = 8;

/// A bump allocator over the offset range `[base, base + size)`.
///
/// Offsets are never handed back individually; the whole range is recycled
/// with [`reset`](Self::reset) when the owning resource is torn down.
#[derive(Debug, Clone)]
pub struct OffsetAllocator {
    base: u64,
    end: u64,
    next: u64,
    allocations: usize,
}

impl OffsetAllocator {
    /// Allocator over `[0, size)`.
    pub fn new(size: u64) -> Self {
        Self::with_base(0, size)
    }

    /// Allocator over `[base, base + size)`.
    pub fn with_base(base: u64, size: u64) -> Self {
        Self {
            base,
            end: base.saturating_add(size),
            next: base,
            allocations: 0,
        }
    }

    /// Allocate `size` bytes aligned to `align` (0 means [`DEFAULT_ALIGN`]).
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if `align` is not a power of two
    /// or the range is exhausted.
    pub fn alloc(&mut self, size: u64, align: u64) -> Result<u64> {
        let align = if align == 0 { DEFAULT_ALIGN } else { align };
        if !align.is_power_of_two() {
            return Err(Error::AllocationFailed(format!(
                "alignment {align} is not a power of two"
            )));
        }
        let start = self
            .next
            .checked_add(align - 1)
            .map(|v| v & !(align - 1))
            .ok_or_else(|| Error::AllocationFailed("offset overflow".into()))?;
        let end = start
            .checked_add(size)
            .filter(|&end| end <= self.end)
            .ok_or_else(|| {
                Error::AllocationFailed(format!(
                    "{size} bytes requested, {} available",
                    self.available()
                ))
            })?;
        self.next = end;
        self.allocations += 1;
        Ok(start)
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> u64 {
        self.next - self.base
    }

    /// Bytes left.
    pub fn available(&self) -> u64 {
        self.end - self.next
    }

    /// Number of successful allocations since the last reset.
    pub fn allocation_count(&self) -> usize {
        self.allocations
    }

    /// Forget every allocation.
    pub fn reset(&mut self) {
        self.next = self.base;
        self.allocations = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_aligns() {
        let mut a = OffsetAllocator::new(1024);
        assert_eq!(a.alloc(3, 1).unwrap(), 0);
        assert_eq!(a.alloc(8, 0).unwrap(), 8);
        assert_eq!(a.alloc(1, 64).unwrap(), 64);
        assert_eq!(a.used(), 65);
        assert_eq!(a.allocation_count(), 3);
    }

    #[test]
    fn test_alloc_exhaustion() {
        let mut a = OffsetAllocator::with_base(100, 50);
        assert_eq!(a.alloc(40, 4).unwrap(), 100);
        assert!(a.alloc(16, 4).is_err());
        assert_eq!(a.available(), 10);
        a.reset();
        assert_eq!(a.alloc(50, 4).unwrap(), 100);
    }

    #[test]
    fn test_bad_alignment() {
        let mut a = OffsetAllocator::new(64);
        assert!(a.alloc(4, 3).is_err());
    }
}
