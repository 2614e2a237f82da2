//! Shared-memory programmed-I/O driver.
//!
//! Endpoints are memfd mappings (or heap allocations for single-process
//! use). The driver keeps a weak cache keyed by endpoint id so that every
//! reference to an id in this process resolves to the same mapping, the way
//! a named shared-memory object would.

use super::driver::TransferDriver;
use super::template::{PioEngine, TransferTemplate};
use crate::endpoint::{Endpoint, EndpointUri};
use crate::error::{Error, Result};
use crate::memory::{HeapSegment, MemfdSegment, SharedRegion, ipc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Default protocol served by [`PioDriver`].
pub const PIO_PROTOCOL: &str = "ocpi-smb-pio";

/// Memory backing for endpoints created by a [`PioDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PioBacking {
    /// memfd, exportable to other processes.
    SharedMemory,
    /// Process-private heap.
    Heap,
}

/// The shared-memory PIO driver.
pub struct PioDriver {
    protocol: String,
    backing: PioBacking,
    engine: Arc<PioEngine>,
    endpoints: Mutex<HashMap<String, Weak<Endpoint>>>,
}

impl Default for PioDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl PioDriver {
    /// memfd-backed driver for [`PIO_PROTOCOL`].
    pub fn new() -> Self {
        Self::with_protocol(PIO_PROTOCOL, PioBacking::SharedMemory)
    }

    /// Heap-backed driver for [`PIO_PROTOCOL`].
    pub fn heap() -> Self {
        Self::with_protocol(PIO_PROTOCOL, PioBacking::Heap)
    }

    /// Driver for a custom protocol name.
    pub fn with_protocol(protocol: impl Into<String>, backing: PioBacking) -> Self {
        Self {
            protocol: protocol.into(),
            backing,
            engine: Arc::new(PioEngine),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Backing used for new endpoints.
    pub fn backing(&self) -> PioBacking {
        self.backing
    }

    fn cached(&self, id: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.lock().get(id).and_then(Weak::upgrade)
    }

    fn insert(&self, endpoint: &Arc<Endpoint>) {
        let mut map = self.endpoints.lock();
        map.retain(|_, weak| weak.strong_count() > 0);
        map.insert(endpoint.id().to_string(), Arc::downgrade(endpoint));
    }

    /// Send a local endpoint's memory to another process.
    ///
    /// # Errors
    ///
    /// Fails if the endpoint is heap-backed or the socket write fails.
    pub fn export(&self, endpoint: &Endpoint, socket: &UnixStream) -> Result<()> {
        let segment = endpoint.region().segment();
        let fd = segment.shared_fd().ok_or_else(|| {
            Error::InvalidSegment(format!("endpoint {} is not shareable", endpoint.id()))
        })?;
        ipc::offer_segment(socket, fd, segment.len(), endpoint.id())?;
        debug!(endpoint = %endpoint.id(), size = segment.len(), "exported endpoint");
        Ok(())
    }

    /// Attach to an endpoint exported by another process.
    pub fn attach(&self, socket: &UnixStream) -> Result<Arc<Endpoint>> {
        let offer = ipc::accept_segment(socket)?;
        let uri = EndpointUri::parse(&offer.uri)?;
        if uri.protocol() != self.protocol {
            return Err(Error::UnsupportedEndpoint(offer.uri));
        }
        let size = offer.size;
        // SAFETY: the peer sent the memfd of a mapping of `size` bytes.
        let segment = unsafe { MemfdSegment::attach(offer.fd, size)? };
        let endpoint = Arc::new(Endpoint::new(uri, SharedRegion::new(segment), false)?);
        self.insert(&endpoint);
        info!(endpoint = %offer.uri, size, "attached remote endpoint");
        Ok(endpoint)
    }
}

impl TransferDriver for PioDriver {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn create_endpoint(&self, uri: &EndpointUri, local: bool) -> Result<Arc<Endpoint>> {
        let id = uri.to_string();
        if let Some(endpoint) = self.cached(&id) {
            return Ok(endpoint);
        }
        if !local {
            return Err(Error::UnsupportedEndpoint(format!(
                "{id} is not mapped in this process; attach it first"
            )));
        }

        let size = usize::try_from(uri.size())
            .map_err(|_| Error::AllocationFailed(format!("endpoint size {} too large", uri.size())))?;
        let region = match self.backing {
            PioBacking::SharedMemory => SharedRegion::new(MemfdSegment::create(uri.name(), size)?),
            PioBacking::Heap => SharedRegion::new(HeapSegment::new(size)?),
        };
        let endpoint = Arc::new(Endpoint::new(uri.clone(), region, true)?);
        self.insert(&endpoint);
        debug!(endpoint = %id, backing = ?self.backing, "created endpoint");
        Ok(endpoint)
    }

    fn create_template(&self, source: &Arc<Endpoint>, target: &Arc<Endpoint>) -> Result<TransferTemplate> {
        Ok(TransferTemplate::new(
            Arc::clone(source),
            Arc::clone(target),
            self.engine.clone(),
        ))
    }

    fn forget_endpoint(&self, id: &str) {
        self.endpoints.lock().remove(id);
    }
}
