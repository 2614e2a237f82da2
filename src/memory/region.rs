//! Bounds-checked view of an endpoint's memory.
//!
//! Every offset that crosses an endpoint boundary (buffer bases, metadata
//! slots, flag words learned from a peer's descriptor) is resolved through a
//! [`SharedRegion`]. Out-of-range accesses become [`Error::OutOfRange`]
//! instead of touching memory outside the mapping.
//!
//! # Memory ordering
//!
//! Flag words are the synchronization primitive between producer and
//! consumer. [`SharedRegion::store_flag`] is a Release store and
//! [`SharedRegion::load_flag`] an Acquire load, so payload written before a
//! flag store is visible to whoever observes the flag.

use super::MemorySegment;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A cheaply clonable, bounds-checked handle to one mapped segment.
#[derive(Clone)]
pub struct SharedRegion {
    segment: Arc<dyn MemorySegment>,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.segment.base())
            .field("len", &self.segment.len())
            .field("backing", &self.segment.backing())
            .finish()
    }
}

impl SharedRegion {
    /// Wrap a segment.
    pub fn new(segment: impl MemorySegment + 'static) -> Self {
        Self {
            segment: Arc::new(segment),
        }
    }

    /// Wrap an already shared segment.
    pub fn from_arc(segment: Arc<dyn MemorySegment>) -> Self {
        Self { segment }
    }

    /// The underlying segment.
    pub fn segment(&self) -> &Arc<dyn MemorySegment> {
        &self.segment
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.segment.len()
    }

    /// Returns true if the region is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address-space identity of this mapping.
    ///
    /// Two regions with the same id are the same mapping in this process, so
    /// an offset valid in one names the same bytes in the other.
    #[inline]
    pub fn id(&self) -> usize {
        self.segment.base().as_ptr() as usize
    }

    /// True if both handles refer to the same mapping.
    #[inline]
    pub fn same_mapping(&self, other: &SharedRegion) -> bool {
        self.id() == other.id()
    }

    fn check(&self, offset: u64, len: usize) -> Result<usize> {
        let out_of_range = || Error::OutOfRange {
            offset,
            len,
            size: self.len(),
        };
        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let end = start.checked_add(len).ok_or_else(out_of_range)?;
        if end > self.len() {
            return Err(out_of_range());
        }
        Ok(start)
    }

    #[inline]
    fn ptr(&self) -> *mut u8 {
        self.segment.base().as_ptr()
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.check(offset, data.len())?;
        // SAFETY: bounds checked above; the caller owns the destination bytes
        // under the buffer flag protocol.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr().add(start), data.len()) };
        Ok(())
    }

    /// Copy bytes at `offset` into `out`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let start = self.check(offset, out.len())?;
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr().add(start), out.as_mut_ptr(), out.len())
        };
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// The bytes may be rewritten by a peer that does not follow the buffer
    /// flag protocol; well-behaved peers only write a slot they own.
    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = self.check(offset, len)?;
        // SAFETY: bounds checked; the mapping lives as long as `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr().add(start), len) })
    }

    /// Mutably borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must own the bytes under the flag protocol and must not
    /// create another overlapping reference while this one is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let start = self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr().add(start), len) })
    }

    /// View the 4-byte flag word at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the word is out of range or not 4-byte aligned.
    pub fn flag(&self, offset: u64) -> Result<&AtomicU32> {
        let start = self.check(offset, 4)?;
        let ptr = self.ptr().wrapping_add(start);
        if (ptr as usize) % std::mem::align_of::<AtomicU32>() != 0 {
            return Err(Error::InvalidSegment(format!(
                "flag offset {offset} is not 4-byte aligned"
            )));
        }
        // SAFETY: in range, aligned, and AtomicU32 has the layout of u32.
        Ok(unsafe { &*(ptr as *const AtomicU32) })
    }

    /// Acquire-load the flag word at `offset`.
    #[inline]
    pub fn load_flag(&self, offset: u64) -> Result<u32> {
        Ok(self.flag(offset)?.load(Ordering::Acquire))
    }

    /// Release-store `value` into the flag word at `offset`.
    #[inline]
    pub fn store_flag(&self, offset: u64, value: u32) -> Result<()> {
        self.flag(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Copy `len` bytes between two regions (or within one; overlap is allowed).
    pub fn copy_between(
        src: &SharedRegion,
        src_offset: u64,
        dst: &SharedRegion,
        dst_offset: u64,
        len: usize,
    ) -> Result<()> {
        let s = src.check(src_offset, len)?;
        let d = dst.check(dst_offset, len)?;
        // SAFETY: both ranges are bounds checked; `copy` tolerates overlap.
        unsafe { std::ptr::copy(src.ptr().add(s), dst.ptr().add(d), len) };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HeapSegment;

    fn region(size: usize) -> SharedRegion {
        SharedRegion::new(HeapSegment::new(size).unwrap())
    }

    #[test]
    fn test_read_write() {
        let r = region(256);
        r.write(10, b"hello").unwrap();
        let mut out = [0u8; 5];
        r.read(10, &mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(r.slice(10, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_out_of_range() {
        let r = region(64);
        assert!(matches!(
            r.write(60, b"hello"),
            Err(Error::OutOfRange { offset: 60, len: 5, size: 64 })
        ));
        assert!(r.slice(u64::MAX, 1).is_err());
        assert!(r.flag(64).is_err());
        assert!(r.write(59, b"hello").is_ok());
    }

    #[test]
    fn test_flag_alignment() {
        let r = region(64);
        assert!(r.flag(2).is_err());
        r.store_flag(8, 0xdead_beef).unwrap();
        assert_eq!(r.load_flag(8).unwrap(), 0xdead_beef);
        let mut raw = [0u8; 4];
        r.read(8, &mut raw).unwrap();
        assert_eq!(u32::from_ne_bytes(raw), 0xdead_beef);
    }

    #[test]
    fn test_copy_between_regions() {
        let a = region(128);
        let b = region(128);
        a.write(0, &[1, 2, 3, 4]).unwrap();
        SharedRegion::copy_between(&a, 0, &b, 100, 4).unwrap();
        assert_eq!(b.slice(100, 4).unwrap(), &[1, 2, 3, 4]);
        assert!(SharedRegion::copy_between(&a, 0, &b, 126, 4).is_err());
    }

    #[test]
    fn test_identity() {
        let a = region(64);
        let b = region(64);
        assert!(a.same_mapping(&a.clone()));
        assert!(!a.same_mapping(&b));
    }
}
