//! memfd-backed endpoint memory.
//!
//! The creating process owns a memfd named after the endpoint. Another
//! process attaches by receiving that fd (see [`super::ipc`]) and mapping it
//! with [`MemfdSegment::attach`]; both then see the same bytes at the same
//! offsets, which is all the buffer protocol relies on.

use super::{Backing, MemorySegment};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::fs::MemfdFlags;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use tracing::trace;

/// A shared mapping of a memfd.
pub struct MemfdSegment {
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
}

impl MemfdSegment {
    /// Create and map a new memfd of `size` bytes.
    ///
    /// `name` shows up in `/proc/<pid>/fd` and is usually the endpoint name.
    ///
    /// # Errors
    ///
    /// Fails for an empty segment, a name containing NUL, or if any of
    /// `memfd_create`, `ftruncate` or `mmap` fails.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("endpoint memory cannot be empty".into()));
        }
        let cname = CString::new(name).map_err(|_| Error::InvalidEndpoint(name.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;
        trace!(name, size, "memfd created");
        // SAFETY: we just sized the memfd to `size` bytes.
        unsafe { Self::attach(fd, size) }
    }

    /// Map a memfd created elsewhere.
    ///
    /// # Safety
    ///
    /// `fd` must be a memfd at least `size` bytes long.
    pub unsafe fn attach(fd: OwnedFd, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::AllocationFailed("endpoint memory cannot be empty".into()));
        }
        // SAFETY: a fresh shared mapping chosen by the kernel aliases nothing.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;
        Ok(Self { fd, base, len: size })
    }

    /// Map the same memfd a second time, at a different address.
    ///
    /// This is what a peer process sees after attaching.
    pub fn duplicate(&self) -> Result<Self> {
        let fd = rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?;
        // SAFETY: `fd` refers to our own memfd of `self.len` bytes.
        unsafe { Self::attach(fd, self.len) }
    }
}

impl MemorySegment for MemfdSegment {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }

    fn backing(&self) -> Backing {
        Backing::Memfd
    }

    fn shared_fd(&self) -> Option<BorrowedFd<'_>> {
        Some(self.fd.as_fd())
    }
}

impl AsFd for MemfdSegment {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for MemfdSegment {
    fn drop(&mut self) {
        // SAFETY: `base`/`len` is exactly the mapping made in `attach`, and no
        // borrow of it outlives `self`.
        let _ = unsafe { rustix::mm::munmap(self.base.as_ptr().cast(), self.len) };
    }
}

// SAFETY: the mapping is process-wide and only reached through raw pointers
// ordered by the flag protocol.
unsafe impl Send for MemfdSegment {}
unsafe impl Sync for MemfdSegment {}
