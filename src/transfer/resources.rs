//! Per-endpoint communication resources.
//!
//! Every endpoint used by a container starts with a `ContainerComms` block:
//!
//! ```text
//! 0                 4        64              64 + 512          ...
//! +-----------------+--------+---------------+----------------+
//! | up-and-running  | unused | mailbox 0     | mailbox 1      | ... max_count slots
//! +-----------------+--------+---------------+----------------+
//! ```
//!
//! Each mailbox slot is a 16-byte header (`kind`, `length`, `source`,
//! `sequence`, all `u32`) followed by the payload. Slot `k` of an endpoint
//! receives requests from the peer whose mailbox number is `k`. The rest of
//! the endpoint is carved out by an [`OffsetAllocator`] for port memory.

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::memory::{OffsetAllocator, SharedRegion};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Marker stored at offset 0 once the comms block is initialised.
pub const COMMS_MAGIC: u32 = 0x434f_4e44;

/// Offset of mailbox slot 0.
pub const MAILBOX_BASE: u64 = 64;

/// Size of one mailbox slot.
pub const MAILBOX_SLOT_SIZE: u64 = 512;

/// Size of the mailbox request header.
pub const MAILBOX_HEADER_SIZE: u64 = 16;

/// Largest mailbox payload.
pub const MAILBOX_PAYLOAD_MAX: usize = (MAILBOX_SLOT_SIZE - MAILBOX_HEADER_SIZE) as usize;

/// Bytes reserved for the comms block of an endpoint with `max_count` mailboxes.
pub fn comms_size(max_count: u16) -> u64 {
    MAILBOX_BASE + u64::from(max_count) * MAILBOX_SLOT_SIZE
}

/// Offset of mailbox slot `slot` in an endpoint with `max_count` mailboxes.
pub fn mailbox_offset(max_count: u16, slot: u16) -> Result<u64> {
    if slot >= max_count {
        return Err(Error::InvalidEndpoint(format!(
            "mailbox {slot} outside 0..{max_count}"
        )));
    }
    Ok(MAILBOX_BASE + u64::from(slot) * MAILBOX_SLOT_SIZE)
}

/// An endpoint plus the allocator that carves it up.
pub struct SharedMemoryResource {
    endpoint: Arc<Endpoint>,
    allocator: Mutex<OffsetAllocator>,
    staging: Mutex<()>,
}

impl std::fmt::Debug for SharedMemoryResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemoryResource")
            .field("endpoint", &self.endpoint.id())
            .field("used", &self.used())
            .finish()
    }
}

impl SharedMemoryResource {
    /// Lay out the comms block and allocator over `endpoint`.
    ///
    /// A locally owned endpoint gets its up-and-running marker written here.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint cannot hold its comms block.
    pub fn new(endpoint: Arc<Endpoint>) -> Result<Self> {
        let reserved = comms_size(endpoint.max_count());
        if endpoint.size() <= reserved {
            return Err(Error::AllocationFailed(format!(
                "endpoint {} has {} bytes, comms block needs {reserved}",
                endpoint.id(),
                endpoint.size()
            )));
        }
        if endpoint.is_local() {
            endpoint.region().store_flag(0, COMMS_MAGIC)?;
        }
        let allocator = OffsetAllocator::with_base(reserved, endpoint.size() - reserved);
        Ok(Self {
            endpoint,
            allocator: Mutex::new(allocator),
            staging: Mutex::new(()),
        })
    }

    /// The endpoint.
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// The endpoint's memory.
    pub fn region(&self) -> &SharedRegion {
        self.endpoint.region()
    }

    /// Whether the owner has initialised the comms block.
    pub fn is_up(&self) -> bool {
        self.region().load_flag(0).is_ok_and(|v| v == COMMS_MAGIC)
    }

    /// Allocate `size` bytes of port memory.
    pub fn alloc(&self, size: u64, align: u64) -> Result<u64> {
        self.allocator.lock().alloc(size, align).map_err(|e| {
            Error::AllocationFailed(format!("endpoint {}: {e}", self.endpoint.id()))
        })
    }

    /// Bytes allocated past the comms block.
    pub fn used(&self) -> u64 {
        self.allocator.lock().used()
    }

    /// Bytes still free.
    pub fn available(&self) -> u64 {
        self.allocator.lock().available()
    }

    /// Offset of mailbox slot `slot`.
    pub fn mailbox_offset(&self, slot: u16) -> Result<u64> {
        mailbox_offset(self.endpoint.max_count(), slot)
    }

    /// Serialises use of this endpoint's outgoing staging slot.
    pub(crate) fn lock_staging(&self) -> MutexGuard<'_, ()> {
        self.staging.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointUri;
    use crate::memory::HeapSegment;

    fn endpoint(size: u64) -> Arc<Endpoint> {
        let uri = EndpointUri::new("ocpi-smb-pio", "res", size, 1, 20).unwrap();
        let region = SharedRegion::new(HeapSegment::new(size as usize).unwrap());
        Arc::new(Endpoint::new(uri, region, true).unwrap())
    }

    #[test]
    fn test_comms_reserved() {
        let res = SharedMemoryResource::new(endpoint(65536)).unwrap();
        assert!(res.is_up());
        let first = res.alloc(100, 64).unwrap();
        assert!(first >= comms_size(20));
        assert_eq!(res.mailbox_offset(0).unwrap(), MAILBOX_BASE);
        assert_eq!(res.mailbox_offset(3).unwrap(), MAILBOX_BASE + 3 * MAILBOX_SLOT_SIZE);
        assert!(res.mailbox_offset(20).is_err());
    }

    #[test]
    fn test_endpoint_too_small_for_comms() {
        assert!(SharedMemoryResource::new(endpoint(4096)).is_err());
    }

    #[test]
    fn test_alloc_exhaustion_names_endpoint() {
        let res = SharedMemoryResource::new(endpoint(16384)).unwrap();
        let err = res.alloc(1 << 20, 8).unwrap_err();
        assert!(err.to_string().contains("ocpi-smb-pio:res"));
    }
}
